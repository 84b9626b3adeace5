//! DasDB: an embedded, memory-mapped, persistent, concurrent ordered map.
//!
//! The entire state of every map lives in one file mapped into the
//! process. Readers run without locks against copy-on-write tries; writers
//! either mutate the live structure atomically (a path rebuild published
//! by one compare-and-swap of the root) or fork a private transactional
//! workspace that a three-way merge folds back in. A forked snapshot
//! worker pushes dirty pages through a write-ahead journal, so the backing
//! file always holds a consistent, crash-recoverable image.
//!
//! ```no_run
//! use dasdb::{cleanup, MmapFile, Permissions};
//!
//! # fn main() -> dasdb::Result<()> {
//! let path = std::path::Path::new("data.db");
//! cleanup(path)?; // recover after a crash, before the first open
//! let file = MmapFile::open_or_create(path, Permissions::ReadWrite, 1 << 20)?;
//! file.allocate_map(0, "counts")?;
//!
//! let map = file.map::<String, u64>(0);
//! map.insert(&"answer".to_string(), 42)?;
//!
//! let mut txn = map.transaction();
//! txn.insert(&"staged".to_string(), 7)?;
//! txn.commit()?;
//!
//! file.snapshot()?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod dirty;
pub mod epoch;
mod error;
mod file;
pub mod frag;
pub mod journal;
pub mod kv;
pub mod lockfile;
pub mod map;
pub mod merge;
pub mod meta;
pub mod node;
pub mod path;
pub mod region;
mod snapshot;
pub mod stats;
pub mod trie;
pub mod txn;

pub use error::{DbError, Result};
pub use file::{cleanup, MmapFile};
pub use frag::KeyFragment;
pub use map::{Map, MapIter, MapTransaction, MapVersion, TrieKey, TrieValue};
pub use region::Permissions;
pub use stats::TrieStats;
pub use trie::{CasOutcome, Trie, TrieVersion};
pub use txn::TrieTransaction;
