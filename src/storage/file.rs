//! Page file
//!
//! Owns the database file descriptor, its advisory lock and the optional
//! read-only memory map. All I/O is positioned; there is no shared cursor.

use std::fs::{File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config::Config;
use crate::error::{HashKvError, Result};
use crate::mode::{OpenFlags, OpenMode};

/// An open database file
pub struct PageFile {
    file: File,
    path: PathBuf,
    /// Cached file length (grown by our own writes and `set_len`)
    len: u64,
    /// Read-only shared mapping, remapped when the file grows
    map: Option<Mmap>,
    use_mmap: bool,
    locked: bool,
}

impl PageFile {
    /// Open `path` according to `flags`.
    ///
    /// The lock is taken before a `New` file is truncated, so another
    /// writer's data is never destroyed.
    pub fn open(path: &Path, flags: &OpenFlags, config: &Config) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if flags.mode.is_writable() {
            options.write(true);
        }
        if flags.mode.creates() {
            options.create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(config.file_mode);
            }
        }

        let file = options.open(path)?;
        let mut page_file = Self::adopt(file, path, flags, config)?;

        if flags.mode == OpenMode::New && page_file.len > 0 {
            page_file.map = None;
            page_file.file.set_len(0)?;
            page_file.len = 0;
        }

        Ok(page_file)
    }

    /// Wrap an already open file, taking the lock `flags` ask for
    pub fn adopt(file: File, path: &Path, flags: &OpenFlags, config: &Config) -> Result<Self> {
        let len = file.metadata()?.len();
        let mut page_file = Self {
            file,
            path: path.to_path_buf(),
            len,
            map: None,
            use_mmap: !flags.no_mmap,
            locked: false,
        };

        if !flags.no_lock {
            page_file.lock(flags.mode.is_writable(), config.blocking_lock)?;
        }
        Ok(page_file)
    }

    fn lock(&mut self, exclusive: bool, blocking: bool) -> Result<()> {
        let result = match (exclusive, blocking) {
            (true, false) => fs2::FileExt::try_lock_exclusive(&self.file),
            (true, true) => fs2::FileExt::lock_exclusive(&self.file),
            (false, false) => fs2::FileExt::try_lock_shared(&self.file),
            (false, true) => fs2::FileExt::lock_shared(&self.file),
        };

        match result {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) if is_contended(&e) => Err(HashKvError::LockUnavailable(format!(
                "{} is locked by another handle",
                self.path.display()
            ))),
            Err(e) => Err(HashKvError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Refresh the cached length from the file system
    pub fn refresh_len(&mut self) -> Result<u64> {
        self.len = self.file.metadata()?.len();
        Ok(self.len)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// Reading past the end of the file means the structure points outside
    /// the file and is reported as corruption.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len && end > self.refresh_len()? {
            return Err(HashKvError::CorruptStructure(format!(
                "short read: {} bytes at offset {} beyond end of file ({})",
                buf.len(),
                offset,
                self.len
            )));
        }

        if self.use_mmap {
            let mapped = self.map.as_ref().map_or(0, |m| m.len() as u64);
            if end > mapped {
                self.remap()?;
            }
            if let Some(map) = &self.map {
                if end <= map.len() as u64 {
                    buf.copy_from_slice(&map[offset as usize..end as usize]);
                    return Ok(());
                }
            }
        }

        read_exact_at(&self.file, buf, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                HashKvError::CorruptStructure(format!("short read at offset {}", offset))
            } else {
                HashKvError::Io(e)
            }
        })
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, data, offset)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    /// Grow (or shrink) the file
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        if len < self.len {
            self.map = None;
        }
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Flush file data and metadata to the storage device
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// File system metadata of the open file
    pub fn metadata(&self) -> Result<Metadata> {
        Ok(self.file.metadata()?)
    }

    /// Copy permissions, timestamps and (on unix) ownership from `source`
    pub fn apply_metadata(&self, source: &Metadata) -> Result<()> {
        copy_file_metadata(source, &self.file)
    }

    fn remap(&mut self) -> Result<()> {
        self.map = None;
        if self.len == 0 {
            return Ok(());
        }
        // SAFETY: the mapping is read-only and only ever sliced within the
        // length it was created with; this handle never shrinks the file
        // while mapped (set_len drops the map first).
        let map = unsafe { Mmap::map(&self.file)? };
        self.map = Some(map);
        Ok(())
    }
}

impl Drop for PageFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}

/// Apply permissions, access/modification times and ownership of `source`
/// to `target`.
///
/// Ownership changes that the process is not permitted to make are skipped
/// with a warning.
pub fn copy_file_metadata(source: &Metadata, target: &File) -> Result<()> {
    target.set_permissions(source.permissions())?;

    let mut times = FileTimes::new().set_modified(source.modified()?);
    if let Ok(accessed) = source.accessed() {
        times = times.set_accessed(accessed);
    }
    target.set_times(times)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let current = target.metadata()?;
        if current.uid() != source.uid() || current.gid() != source.gid() {
            match std::os::unix::fs::fchown(target, Some(source.uid()), Some(source.gid())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    tracing::warn!(
                        "Cannot copy ownership {}:{}: {}",
                        source.uid(),
                        source.gid(),
                        e
                    );
                }
                Err(e) => return Err(HashKvError::Io(e)),
            }
        }
    }

    Ok(())
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some()
            && e.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
