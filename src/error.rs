use std::fmt;
use std::io;

use derive_more::From;

/// Crate-wide error type.
///
/// Every fallible operation in the store returns one of these kinds rather than
/// panicking; `NotFound`/`Expired` are legitimate outcomes rather than failures.
#[derive(Debug, From)]
pub enum Error {
    /// Underlying file operation failed.
    Io(io::Error),
    /// Key/bucket absent.
    NotFound,
    /// Entry present but its TTL has elapsed.
    Expired,
    /// Key would exceed the segment size cap.
    KeyTooLarge,
    /// Value (or the record carrying it) would exceed the segment size cap.
    ValueTooLarge,
    /// Checksum mismatch or truncated trailer on read.
    Corrupted,
    /// Location points past a segment's physical size.
    OutOfRange,
    /// Operation issued on a transaction that already committed/rolled back.
    TxClosed,
    /// Mutating call on a read-only transaction.
    TxReadOnly,
    /// Directory is locked by another open `Db`.
    AlreadyOpen,
    /// Malformed bucket/key/range/rank argument.
    #[from(ignore)]
    InvalidArgument(String),
    /// Second write transaction was attempted concurrently.
    #[from(ignore)]
    WouldBlock,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::NotFound => write!(f, "key not found"),
            Error::Expired => write!(f, "key expired"),
            Error::KeyTooLarge => write!(f, "key too large"),
            Error::ValueTooLarge => write!(f, "value too large"),
            Error::Corrupted => write!(f, "record checksum mismatch"),
            Error::OutOfRange => write!(f, "location out of range"),
            Error::TxClosed => write!(f, "transaction already closed"),
            Error::TxReadOnly => write!(f, "transaction is read-only"),
            Error::AlreadyOpen => write!(f, "database directory already open"),
            Error::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            Error::WouldBlock => write!(f, "a write transaction is already in progress"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
