//! Static capability set
//!
//! Everything this build supports is resolved once and exposed as plain
//! flags, so callers can query features without version checks.

use std::sync::OnceLock;

/// Feature set of this build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub export: bool,
    pub dump: bool,
    pub count: bool,
    pub copy_metadata: bool,
    pub recovery: bool,
    /// Memory-mapped reads are available on this platform
    pub mmap: bool,
    /// Advisory file locks are available on this platform
    pub locking: bool,
    /// File owner can be copied by `copy_metadata`
    pub ownership: bool,
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

impl Capabilities {
    /// The capability set of the running build
    pub fn get() -> &'static Capabilities {
        CAPABILITIES.get_or_init(|| Capabilities {
            export: true,
            dump: true,
            count: true,
            copy_metadata: true,
            recovery: true,
            mmap: cfg!(any(unix, windows)),
            locking: cfg!(any(unix, windows)),
            ownership: cfg!(unix),
        })
    }

    /// Names of the enabled capabilities
    pub fn names(&self) -> Vec<&'static str> {
        let all = [
            ("export", self.export),
            ("dump", self.dump),
            ("count", self.count),
            ("copymeta", self.copy_metadata),
            ("recovery", self.recovery),
            ("mmap", self.mmap),
            ("locking", self.locking),
            ("ownership", self.ownership),
        ];
        all.iter().filter(|(_, on)| *on).map(|(name, _)| *name).collect()
    }
}
