//! Snapshot persistence and crash recovery against the backing file.

use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use dasdb::journal::Journal;
use dasdb::{cleanup, lockfile, MmapFile, Permissions};

fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("data.db")
}

fn open_db(path: &Path) -> MmapFile {
    MmapFile::open_or_create(path, Permissions::ReadWrite, 1 << 20).unwrap()
}

fn populate(map: &dasdb::Map<u64, u64>, range: std::ops::Range<u64>) {
    for i in range {
        map.insert(&i, i * 7).unwrap();
    }
}

fn assert_content(map: &dasdb::Map<u64, u64>, present: std::ops::Range<u64>, total: u64) {
    assert_eq!(map.size(), total);
    for i in present {
        assert_eq!(map.find(&i).unwrap(), Some(i * 7), "key {i}");
    }
}

#[test]
fn snapshot_then_reopen_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        let map = file.map::<u64, u64>(0);
        populate(&map, 0..500);
        let bytes = file.snapshot().unwrap();
        assert!(bytes > 0, "first snapshot must write something");
        file.close();
    }

    cleanup(&path).unwrap();
    let file = open_db(&path);
    let map = file.map::<u64, u64>(0);
    assert_content(&map, 0..500, 500);
}

#[test]
fn snapshot_with_no_changes_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let file = open_db(&path);
    file.allocate_map(0, "nums").unwrap();
    let map = file.map::<u64, u64>(0);
    populate(&map, 0..50);
    assert!(file.snapshot().unwrap() > 0);
    assert_eq!(file.snapshot().unwrap(), 0);
}

#[test]
fn unsnapshotted_changes_never_reach_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        let map = file.map::<u64, u64>(0);
        populate(&map, 0..100);
        file.snapshot().unwrap();

        // These die with the process: the mapping is private and no
        // snapshot pushes them out.
        populate(&map, 100..200);
        assert_content(&map, 0..200, 200);
        file.close();
    }

    cleanup(&path).unwrap();
    let file = open_db(&path);
    let map = file.map::<u64, u64>(0);
    assert_content(&map, 0..100, 100);
    assert_eq!(map.find(&150).unwrap(), None);
}

#[test]
fn snapshot_after_mutation_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        let map = file.map::<u64, u64>(0);
        populate(&map, 0..100);
        file.snapshot().unwrap();
        populate(&map, 100..300);
        for i in 0..50u64 {
            map.remove(&i).unwrap();
        }
        file.snapshot().unwrap();
        file.close();
    }

    cleanup(&path).unwrap();
    let file = open_db(&path);
    let map = file.map::<u64, u64>(0);
    assert_content(&map, 50..300, 250);
}

fn page_of_raw_bytes(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset).unwrap();
    buf
}

#[test]
fn cleanup_ignores_a_journal_without_commit_marker() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        populate(&file.map::<u64, u64>(0), 0..100);
        file.snapshot().unwrap();
        file.close();
    }
    let before = page_of_raw_bytes(&path, 0, 16384);

    // A writer died mid-journal: entries on disk, no commit marker, and
    // nothing written to the target yet.
    {
        let target = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut journal =
            Journal::create(target, lockfile::journal_path(&path)).unwrap();
        let mut tampered = page_of_raw_bytes(&path, 4096, 4096);
        for b in tampered.iter_mut().take(128) {
            *b ^= 0xff;
        }
        journal.add_entry(4096, &tampered).unwrap();
        // Dropping without apply leaves a truncated (uncommitted) journal.
    }
    assert!(lockfile::journal_path(&path).exists());

    assert_eq!(cleanup(&path).unwrap(), 0);
    assert!(!lockfile::journal_path(&path).exists());
    assert_eq!(page_of_raw_bytes(&path, 0, 16384), before);

    let file = open_db(&path);
    assert_content(&file.map::<u64, u64>(0), 0..100, 100);
}

#[test]
fn cleanup_undoes_a_committed_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        populate(&file.map::<u64, u64>(0), 0..100);
        file.snapshot().unwrap();
        file.close();
    }
    let before = page_of_raw_bytes(&path, 0, 16384);

    // A writer died after the commit marker, mid-pwrite: the journal is
    // complete and the target holds a half-applied batch.
    {
        let target = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut tampered = page_of_raw_bytes(&path, 4096, 4096);
        for b in tampered.iter_mut().take(128) {
            *b ^= 0xff;
        }
        let mut journal = Journal::create(
            target.try_clone().unwrap(),
            lockfile::journal_path(&path),
        )
        .unwrap();
        journal.add_entry(4096, &tampered).unwrap();
        drop(journal);
        {
            let mut stream = std::fs::OpenOptions::new()
                .append(true)
                .open(lockfile::journal_path(&path))
                .unwrap();
            stream.write_u64::<LittleEndian>(0xFFEE_DDCC_CCDD_EEFF).unwrap();
            stream.flush().unwrap();
        }
        // Half of the batch reached the target before the crash.
        target.write_all_at(&tampered[..64], 4096).unwrap();
    }

    let restored = cleanup(&path).unwrap();
    assert!(restored > 0);
    assert_eq!(page_of_raw_bytes(&path, 0, 16384), before);

    let file = open_db(&path);
    assert_content(&file.map::<u64, u64>(0), 0..100, 100);
}

#[test]
fn cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        populate(&file.map::<u64, u64>(0), 0..10);
        file.snapshot().unwrap();
        file.close();
    }
    assert_eq!(cleanup(&path).unwrap(), 0);
    assert_eq!(cleanup(&path).unwrap(), 0);
    let file = open_db(&path);
    assert_content(&file.map::<u64, u64>(0), 0..10, 10);
}

#[test]
fn cleanup_refuses_while_attached() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    let file = open_db(&path);
    file.allocate_map(0, "nums").unwrap();
    assert!(cleanup(&path).is_err());
    drop(file);
    assert!(cleanup(&path).is_ok());
}

#[test]
fn snapshot_includes_transactional_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir);
    {
        let file = open_db(&path);
        file.allocate_map(0, "nums").unwrap();
        let map = file.map::<u64, u64>(0);
        let mut txn = map.transaction();
        for i in 0..100u64 {
            txn.insert(&i, i * 7).unwrap();
        }
        txn.commit().unwrap();
        file.snapshot().unwrap();
        file.close();
    }

    cleanup(&path).unwrap();
    let file = open_db(&path);
    assert_content(&file.map::<u64, u64>(0), 0..100, 100);
}
