//! Error taxonomy shared across the engine.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SiloError>;

/// Errors surfaced by the storage engine.
///
/// Key absence is not an error: `get` returns `Ok(None)` and `delete` of an
/// absent key returns `Ok(())`. Everything that does come back as an error
/// either ends the current transaction (`Corrupt`, `Io`) or describes a
/// misuse the caller can correct (`TxClosed`, `Incompatible`, `Invalid`).
#[derive(Debug, Error)]
pub enum SiloError {
    /// Propagated from the underlying storage medium.
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    /// A page failed checksum or structural validation. The in-flight
    /// transaction is dead; the database remains recoverable from the last
    /// durable meta slot.
    #[error("corruption: {0}")]
    Corrupt(&'static str),
    /// The exclusive file lock could not be acquired before the configured
    /// timeout elapsed. The caller may retry.
    #[error("database file is locked by another process")]
    Busy,
    /// Named bucket does not exist in this transaction's snapshot.
    #[error("bucket not found")]
    BucketNotFound,
    /// Operation attempted on a committed, rolled-back, or released
    /// transaction, or a write attempted through a read-only transaction.
    #[error("transaction is no longer usable: {0}")]
    TxClosed(&'static str),
    /// A key was addressed as a bucket or a bucket as a plain key.
    #[error("incompatible entry: {0}")]
    Incompatible(&'static str),
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Key or value exceeds the representable size for this page size.
    #[error("key or value too large")]
    TooLarge,
}
