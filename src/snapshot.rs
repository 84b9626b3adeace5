//! Snapshots: durably persisting a consistent image of the region while
//! mutation continues.
//!
//! The driver swaps in a fresh dirty-page table under the exclusive lock
//! and forks a child. The child's copy-on-write view of the address space
//! freezes the region at that instant; steered over a socketpair, it walks
//! the old dirty table and pushes each dirty page through the journal to
//! the backing file. Writes in the parent between the fork and the worker's
//! completion never reach the snapshotted image.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, error, warn};

use crate::dirty::DirtyPageTable;
use crate::error::{DbError, Result};
use crate::journal::Journal;
use crate::lockfile::{self, NamedLock};
use crate::region::{page_size, Region};

const OP_SYNC: u64 = 1;
const OP_KILL: u64 = 2;

const STATUS_DONE: u64 = 0;
const STATUS_ERR: u64 = 1;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Request {
    op: u64,
    offset: u64,
    len: u64,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Reply {
    status: u64,
    bytes: u64,
}

fn send<T: Pod>(mut stream: impl Write, msg: &T) -> Result<()> {
    stream.write_all(bytemuck::bytes_of(msg))?;
    Ok(())
}

fn recv<T: Pod>(mut stream: impl Read) -> Result<T> {
    let mut msg = T::zeroed();
    stream.read_exact(bytemuck::bytes_of_mut(&mut msg))?;
    Ok(msg)
}

/// Take a snapshot of `region` into its backing file. Returns the bytes
/// written. Serialised against other snapshotters by the snapshot lock
/// file.
pub fn snapshot(region: &Arc<Region>) -> Result<u64> {
    let path = region
        .path()
        .ok_or(DbError::Other("anonymous regions cannot snapshot"))?
        .to_owned();
    let lock = NamedLock::open(lockfile::snapshot_lock_path(&path))?;
    lock.lock()?;
    let result = snapshot_locked(region);
    lock.unlock();
    result
}

fn snapshot_locked(region: &Arc<Region>) -> Result<u64> {
    // Freeze: no mutator is mid-write under the exclusive lock, so the
    // forked image is a consistent cut and the fresh table cleanly
    // captures everything after it.
    let worker = {
        let excl = region.gc().lock_exclusive();
        let old_table = region.swap_dirty(&excl);
        SnapshotWorker::fork(region.clone(), old_table)?
    };

    let len = region.length();
    let result = worker.sync(0, len);
    worker.terminate();
    match result {
        Ok(bytes) => {
            debug!("snapshot complete: {bytes} bytes");
            Ok(bytes)
        }
        Err(e) => Err(e),
    }
}

/// A forked child holding a frozen copy-on-write view of the region.
struct SnapshotWorker {
    pid: libc::pid_t,
    ctrl: UnixStream,
}

impl SnapshotWorker {
    fn fork(region: Arc<Region>, table: Arc<DirtyPageTable>) -> Result<SnapshotWorker> {
        let (parent_sock, child_sock) = UnixStream::pair()?;
        // SAFETY: the child touches only its frozen memory image, fresh
        // file descriptors, and the inherited socket, then _exits without
        // running destructors.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(DbError::Io(std::io::Error::last_os_error())),
            0 => {
                drop(parent_sock);
                let code = worker_main(child_sock, &region, &table);
                unsafe { libc::_exit(code) }
            }
            pid => {
                drop(child_sock);
                Ok(SnapshotWorker {
                    pid,
                    ctrl: parent_sock,
                })
            }
        }
    }

    /// Ask the worker to sync `[offset, offset + len)` of its view.
    fn sync(&self, offset: u64, len: u64) -> Result<u64> {
        send(
            &self.ctrl,
            &Request {
                op: OP_SYNC,
                offset,
                len,
            },
        )?;
        let reply: Reply = recv(&self.ctrl)?;
        if reply.status != STATUS_DONE {
            return Err(DbError::Other("snapshot worker reported a failure"));
        }
        Ok(reply.bytes)
    }

    fn terminate(self) {
        let _ = send(
            &self.ctrl,
            &Request {
                op: OP_KILL,
                offset: 0,
                len: 0,
            },
        );
        let mut status = 0;
        let res = unsafe { libc::waitpid(self.pid, &mut status, 0) };
        if res != self.pid {
            warn!("snapshot worker {}: waitpid failed", self.pid);
            unsafe { libc::kill(self.pid, libc::SIGKILL) };
        }
    }
}

/// Child-side control loop. Runs in the forked process: no locks, no epoch
/// machinery, only the frozen memory image and its own descriptors.
fn worker_main(mut ctrl: UnixStream, region: &Region, table: &DirtyPageTable) -> i32 {
    loop {
        let req: Request = match recv(&mut ctrl) {
            Ok(req) => req,
            Err(_) => return 1,
        };
        match req.op {
            OP_SYNC => {
                let reply = match sync_dirty_pages(region, table, req.offset, req.len) {
                    Ok(bytes) => Reply {
                        status: STATUS_DONE,
                        bytes,
                    },
                    Err(e) => {
                        error!("snapshot worker sync failed: {e}");
                        Reply {
                            status: STATUS_ERR,
                            bytes: 0,
                        }
                    }
                };
                if send(&mut ctrl, &reply).is_err() {
                    return 1;
                }
            }
            OP_KILL => return 0,
            _ => return 1,
        }
    }
}

/// Walk the dirty table and drive every set page through the journal.
fn sync_dirty_pages(
    region: &Region,
    table: &DirtyPageTable,
    offset: u64,
    len: u64,
) -> Result<u64> {
    let path = region
        .path()
        .ok_or(DbError::Other("snapshot of an anonymous region"))?;
    let target = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(DbError::Open)?;
    let mut journal = Journal::create(
        target.try_clone().map_err(DbError::Open)?,
        lockfile::journal_path(path),
    )?;

    let page = page_size();
    let end = (offset + len).min(region.length());
    let base = region.base_addr();
    let mut at = offset;
    let mut pages = 0u64;
    while let Some(dirty) = table.next_page(at) {
        if dirty >= end {
            break;
        }
        // The child's image is frozen: raw access is single-threaded and
        // the region cannot move underneath it.
        let bytes =
            unsafe { std::slice::from_raw_parts((base + dirty as usize) as *const u8, page as usize) };
        journal.add_entry(dirty, bytes)?;
        pages += 1;
        at = dirty + page;
    }
    let written = journal.apply_to_target()?;
    debug!("snapshot worker: {pages} dirty pages, {written} bytes journaled");
    Ok(written)
}
