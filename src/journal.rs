//! Write-ahead journal for pushing a batch of page writes to the backing
//! file safely.
//!
//! On disk: a magic header, then `{file_offset u64, size u64, old_bytes}`
//! entries, then a commit marker written only after the entries have been
//! fdatasync'd. An unlinked journal means the batch completed; a journal
//! with a marker can be undone; a truncated journal (no marker) means the
//! writer died before commit and the target was never touched.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::{DbError, Result};

const JOURNAL_HEADER: u64 = 0x4C4E_524A_5041_4D4D; // "MMAPJRNL"
const COMMIT_MARKER: u64 = 0xFFEE_DDCC_CCDD_EEFF;

/// Diff granularity when comparing memory against the file.
const CHUNK: usize = 64;

struct Entry {
    offset: u64,
    new_data: Vec<u8>,
}

pub struct Journal {
    path: PathBuf,
    stream: BufWriter<File>,
    target: File,
    entries: Vec<Entry>,
}

impl Journal {
    /// Start a fresh journal at `path`, targeting `target`.
    pub fn create(target: File, path: PathBuf) -> Result<Journal> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(DbError::Open)?;
        let mut stream = BufWriter::new(file);
        stream.write_u64::<LittleEndian>(JOURNAL_HEADER)?;
        Ok(Journal {
            path,
            stream,
            target,
            entries: Vec::new(),
        })
    }

    /// Compare `new_data` against the current file content at `offset` in
    /// cache-line chunks, recording only the differing runs. Old bytes go
    /// into the journal stream; new bytes are kept for the apply.
    pub fn add_entry(&mut self, offset: u64, new_data: &[u8]) -> Result<()> {
        let size = new_data.len();
        let mut file_buffer = [0u8; CHUNK];
        let mut old_data: Vec<u8> = Vec::new();
        let mut start_chunk: Option<usize> = None;

        let mut i = 0;
        while i < size {
            let read_size = CHUNK.min(size - i);
            self.target
                .read_exact_at(&mut file_buffer[..read_size], offset + i as u64)?;

            let matches = new_data[i..i + read_size] == file_buffer[..read_size];
            if !matches {
                old_data.extend_from_slice(&file_buffer[..read_size]);
                if start_chunk.is_none() {
                    start_chunk = Some(i);
                }
            }

            // Coalesce adjacent modified chunks into a single entry.
            if let Some(start) = start_chunk {
                if matches || i + CHUNK >= size {
                    let file_offset = offset + start as u64;
                    self.stream.write_u64::<LittleEndian>(file_offset)?;
                    self.stream.write_u64::<LittleEndian>(old_data.len() as u64)?;
                    self.stream.write_all(&old_data)?;

                    self.entries.push(Entry {
                        offset: file_offset,
                        new_data: new_data[start..start + old_data.len()].to_vec(),
                    });

                    start_chunk = None;
                    old_data.clear();
                }
            }
            i += CHUNK;
        }
        Ok(())
    }

    /// Finalize the journal and write the new bytes to the target.
    /// Returns the number of bytes written; the journal is unlinked on
    /// success so recovery won't try to undo a completed batch.
    pub fn apply_to_target(mut self) -> Result<u64> {
        if self.entries.is_empty() {
            drop(self.stream);
            let _ = std::fs::remove_file(&self.path);
            return Ok(0);
        }

        self.stream.flush()?;
        self.stream.get_ref().sync_data().map_err(DbError::Sync)?;

        // Only now is the journal complete.
        self.stream.write_u64::<LittleEndian>(COMMIT_MARKER)?;
        self.stream.flush()?;
        self.stream.get_ref().sync_data().map_err(DbError::Sync)?;

        let mut write_count = 0u64;
        for entry in &self.entries {
            self.target.write_all_at(&entry.new_data, entry.offset)?;
            write_count += entry.new_data.len() as u64;
        }
        self.target.sync_data().map_err(DbError::Sync)?;

        drop(self.stream);
        std::fs::remove_file(&self.path)?;
        debug!(
            "journal applied: {} entries, {} bytes",
            self.entries.len(),
            write_count
        );
        Ok(write_count)
    }

    /// Undo the journal at `journal_path` against `target`, if it exists and
    /// carries a commit marker. A missing, foreign, or truncated journal
    /// leaves the target untouched. The journal file is always removed.
    pub fn undo(target: &File, journal_path: &Path) -> Result<u64> {
        let mut stream = match File::open(journal_path) {
            Ok(f) => std::io::BufReader::new(f),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DbError::Open(e)),
        };

        let header = match stream.read_u64::<LittleEndian>() {
            Ok(h) => h,
            Err(_) => 0,
        };
        if header != JOURNAL_HEADER {
            warn!("journal {:?} has a foreign header; ignoring", journal_path);
            let _ = std::fs::remove_file(journal_path);
            return Ok(0);
        }

        struct UndoEntry {
            offset: u64,
            old_data: Vec<u8>,
        }
        let mut entries: Vec<UndoEntry> = Vec::new();
        let mut found_marker = false;

        loop {
            let value = match stream.read_u64::<LittleEndian>() {
                Ok(v) => v,
                Err(_) => break,
            };
            if value == COMMIT_MARKER {
                found_marker = true;
                break;
            }
            let size = match stream.read_u64::<LittleEndian>() {
                Ok(v) => v,
                Err(_) => break,
            };
            let mut old_data = vec![0u8; size as usize];
            if stream.read_exact(&mut old_data).is_err() {
                // Truncated entry: the writer died mid-journal.
                break;
            }
            entries.push(UndoEntry {
                offset: value,
                old_data,
            });
        }

        let mut write_count = 0u64;
        if found_marker {
            for entry in &entries {
                target.write_all_at(&entry.old_data, entry.offset)?;
                write_count += entry.old_data.len() as u64;
            }
            debug!(
                "journal undone: {} entries, {} bytes restored",
                entries.len(),
                write_count
            );
        }
        target.sync_data().map_err(DbError::Sync)?;
        std::fs::remove_file(journal_path)?;
        Ok(write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn target_with(content: &[u8]) -> (tempfile::TempDir, File, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(content).unwrap();
        f.rewind().unwrap();
        let journal_path = dir.path().join("data.log");
        (dir, f, journal_path)
    }

    fn read_back(f: &File, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        f.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    #[test]
    fn apply_writes_only_diffs() {
        let old = vec![0u8; 4096];
        let (_dir, target, jpath) = target_with(&old);

        let mut new = old.clone();
        new[100] = 1;
        new[3000] = 2;

        let mut journal = Journal::create(target.try_clone().unwrap(), jpath.clone()).unwrap();
        journal.add_entry(0, &new).unwrap();
        let written = journal.apply_to_target().unwrap();

        // Two distinct cache lines changed.
        assert_eq!(written, 2 * CHUNK as u64);
        assert_eq!(read_back(&target, 4096), new);
        assert!(!jpath.exists());
    }

    #[test]
    fn no_change_no_journal() {
        let old = vec![7u8; 1024];
        let (_dir, target, jpath) = target_with(&old);
        let mut journal = Journal::create(target.try_clone().unwrap(), jpath.clone()).unwrap();
        journal.add_entry(0, &old).unwrap();
        assert_eq!(journal.apply_to_target().unwrap(), 0);
        assert!(!jpath.exists());
    }

    #[test]
    fn undo_without_journal_is_noop() {
        let old = vec![3u8; 512];
        let (_dir, target, jpath) = target_with(&old);
        assert_eq!(Journal::undo(&target, &jpath).unwrap(), 0);
        assert_eq!(read_back(&target, 512), old);
    }

    #[test]
    fn undo_truncated_journal_is_noop() {
        let old = vec![9u8; 2048];
        let (_dir, target, jpath) = target_with(&old);

        let mut new = old.clone();
        new[0] = 0;
        let mut journal = Journal::create(target.try_clone().unwrap(), jpath.clone()).unwrap();
        journal.add_entry(0, &new).unwrap();
        // Flush entries but never write the marker, as if we died mid-write.
        journal.stream.flush().unwrap();
        drop(journal);

        assert_eq!(Journal::undo(&target, &jpath).unwrap(), 0);
        assert_eq!(read_back(&target, 2048), old);
        assert!(!jpath.exists());
    }

    #[test]
    fn undo_complete_journal_restores() {
        let old: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let (_dir, target, jpath) = target_with(&old);

        let mut new = old.clone();
        new[64] = 0xff;
        new[65] = 0xfe;
        new[1500] = 0xaa;

        let mut journal = Journal::create(target.try_clone().unwrap(), jpath.clone()).unwrap();
        journal.add_entry(0, &new).unwrap();
        journal.stream.flush().unwrap();
        // Write the marker by hand, then simulate dying before the pwrites.
        journal
            .stream
            .write_u64::<LittleEndian>(COMMIT_MARKER)
            .unwrap();
        journal.stream.flush().unwrap();
        // Half-applied batch reaches the target.
        target.write_all_at(&new[64..66], 64).unwrap();
        drop(journal);

        let restored = Journal::undo(&target, &jpath).unwrap();
        assert!(restored > 0);
        assert_eq!(read_back(&target, 2048), old);
    }

    #[test]
    fn undo_foreign_file_leaves_target() {
        let old = vec![1u8; 256];
        let (_dir, target, jpath) = target_with(&old);
        std::fs::write(&jpath, b"not a journal at all").unwrap();
        assert_eq!(Journal::undo(&target, &jpath).unwrap(), 0);
        assert_eq!(read_back(&target, 256), old);
        assert!(!jpath.exists());
    }
}
