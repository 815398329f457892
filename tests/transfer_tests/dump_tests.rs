//! Tests for the ASCII dump format
//!
//! These tests verify:
//! - Dump then load into a fresh database reproduces the records
//! - Header fields and line wrapping of the written file
//! - Malformed dumps are rejected with the offending line

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hashkv::transfer::{DumpReader, DumpWriter, DUMP_VERSION};
use hashkv::{Database, ErrorKind, HashKvError, Health, ImportPolicy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> (TempDir, PathBuf, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let dump_path = temp_dir.path().join("test.dump");
    (temp_dir, db_path, dump_path)
}

fn contents(db: &Database) -> HashMap<Vec<u8>, Vec<u8>> {
    db.iter().map(|r| r.unwrap()).collect()
}

const SMALL_DUMP: &str = "\
# hashkv dump file
#:version=1.0
#:file=small.db
#:format=standard
# End of header
#:len=1
YQ==
#:len=1
MQ==
# End of data
#:count=1
# End of file
";

fn write_text(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_dump_load_round_trip() {
    let (temp, db_path, dump_path) = setup_temp_dir();
    let source = Database::open(&db_path, "n").unwrap();
    for i in 0..60u32 {
        source.insert(&i.to_le_bytes(), &vec![(i % 256) as u8; i as usize * 5]).unwrap();
    }
    source.insert(b"", b"empty key").unwrap();
    source.insert(b"\0\n#:len=0\n", b"").unwrap();

    assert_eq!(source.dump(&dump_path).unwrap(), 62);

    let target = Database::open(temp.path().join("loaded.db"), "n").unwrap();
    assert_eq!(target.load(&dump_path, ImportPolicy::Insert).unwrap(), 62);
    assert_eq!(contents(&target), contents(&source));
}

#[test]
fn test_dump_header_and_wrapping() {
    let (_temp, db_path, dump_path) = setup_temp_dir();
    let db = Database::open(&db_path, "n").unwrap();
    db.insert(b"long", &[0x5Au8; 300]).unwrap();
    db.dump(&dump_path).unwrap();

    let text = std::fs::read_to_string(&dump_path).unwrap();
    assert!(text.starts_with("# hashkv dump file created by hashkv"));
    assert!(text.ends_with("# End of data\n#:count=1\n# End of file\n"));
    assert!(text
        .lines()
        .filter(|line| !line.starts_with('#'))
        .all(|line| line.len() <= 76));
    assert!(text.contains("#:len=300\n"));

    let reader = DumpReader::open(&dump_path).unwrap();
    let header = reader.header();
    assert_eq!(header.version, DUMP_VERSION);
    assert_eq!(header.file.as_deref(), Some("test.db"));
    assert_eq!(header.format, "standard");
    #[cfg(unix)]
    assert!(header.mode.is_some());
}

#[test]
fn test_writer_and_reader_directly() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    let mut writer = DumpWriter::create(&dump_path, "direct.db", Some(0o640)).unwrap();
    writer.write_record(b"k1", b"").unwrap();
    writer.write_record(b"", b"v2").unwrap();
    assert_eq!(writer.finish().unwrap(), 2);

    let reader = DumpReader::open(&dump_path).unwrap();
    assert_eq!(reader.header().mode, Some(0o640));

    let records: Vec<(Vec<u8>, Vec<u8>)> = reader.map(|r| r.unwrap()).collect();
    assert_eq!(
        records,
        vec![(b"k1".to_vec(), Vec::new()), (Vec::new(), b"v2".to_vec())]
    );
}

#[test]
fn test_load_hand_written_dump() {
    let (_temp, db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, SMALL_DUMP);
    let db = Database::open(&db_path, "n").unwrap();

    assert_eq!(db.load(&dump_path, ImportPolicy::Insert).unwrap(), 1);
    assert_eq!(db.fetch(b"a").unwrap(), b"1");
}

#[test]
fn test_load_replace_policy() {
    let (_temp, db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, SMALL_DUMP);
    let db = Database::open(&db_path, "n").unwrap();
    db.insert(b"a", b"old").unwrap();

    let err = db.load(&dump_path, ImportPolicy::Insert).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    db.load(&dump_path, ImportPolicy::Replace).unwrap();
    assert_eq!(db.fetch(b"a").unwrap(), b"1");
}

// =============================================================================
// Malformed Input Tests
// =============================================================================

#[test]
fn test_count_mismatch_rejected() {
    let (_temp, db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &SMALL_DUMP.replace("#:count=1", "#:count=2"));
    let db = Database::open(&db_path, "n").unwrap();

    let err = db.load(&dump_path, ImportPolicy::Insert).unwrap_err();

    match err {
        HashKvError::BadInput(message) => assert!(message.contains("line 11"), "{}", message),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(db.health(), Health::Healthy);
}

#[test]
fn test_missing_footer_rejected() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &SMALL_DUMP.replace("# End of file\n", ""));

    let results: Vec<_> = DumpReader::open(&dump_path).unwrap().collect();

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(HashKvError::BadInput(_))));
}

#[test]
fn test_trailing_content_rejected() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &format!("{}#:len=1\nYg==\n", SMALL_DUMP));

    let results: Vec<_> = DumpReader::open(&dump_path).unwrap().collect();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(HashKvError::BadInput(message)) => assert!(message.contains("line 13"), "{}", message),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_invalid_base64_rejected() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &SMALL_DUMP.replace("YQ==", "Y!=="));

    let mut reader = DumpReader::open(&dump_path).unwrap();
    assert!(matches!(reader.read_record(), Err(HashKvError::BadInput(_))));
}

#[test]
fn test_length_mismatch_rejected() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &SMALL_DUMP.replacen("#:len=1", "#:len=2", 1));

    let mut reader = DumpReader::open(&dump_path).unwrap();
    assert!(matches!(reader.read_record(), Err(HashKvError::BadInput(_))));
}

#[test]
fn test_unsupported_version_rejected() {
    let (_temp, _db_path, dump_path) = setup_temp_dir();
    write_text(&dump_path, &SMALL_DUMP.replace("#:version=1.0", "#:version=2.0"));

    let err = DumpReader::open(&dump_path).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
