use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Couldn't open the backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Generic I/O failure on the backing file or the journal
    #[error("I/O failure on the backing store")]
    Io(#[from] std::io::Error),
    /// Couldn't resize the backing file
    #[error(
        "Can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: u64,
        requested: u64,
        source: std::io::Error,
    },
    /// Couldn't map or remap the region
    #[error("Can't map 0x{requested:x} bytes of the backing file")]
    MapFailed {
        requested: u64,
        source: std::io::Error,
    },
    /// The region can no longer grow
    #[error("Out of space: the region cannot grow to 0x{requested:x} bytes")]
    OutOfSpace { requested: u64 },
    /// The first-page metadata doesn't describe a valid file
    #[error("Invalid file metadata: {0}")]
    DataFormat(&'static str),
    /// A user conflict callback refused to resolve a merge conflict
    #[error("Unresolved merge conflict on commit")]
    Conflict,
    /// Other, miscellaneous errors
    #[error("Other: {0}")]
    Other(&'static str),
    #[error("Invalid access on the memory map was attempted. Tried to get slice at offset 0x{offset:x} with length 0x{len:x}")]
    InvalidAccess { offset: u64, len: u64 },
}

/// Internal result of an operation running under the shared region lock.
///
/// `Restart(len)` means the region must grow to at least `len` bytes but
/// can't do so in place; the outermost mutator drops its pin, performs a
/// moving resize under the exclusive lock, and retries the whole operation.
/// It never crosses the public API boundary.
#[derive(Debug)]
pub(crate) enum Fault {
    Restart(u64),
    Error(DbError),
}

impl From<DbError> for Fault {
    fn from(e: DbError) -> Self {
        Fault::Error(e)
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Fault::Error(DbError::Io(e))
    }
}

pub(crate) type OpResult<T> = std::result::Result<T, Fault>;

pub type Result<T> = std::result::Result<T, DbError>;
