//! silo: an embedded, single-file, transactional key-value store.
//!
//! Data lives in named buckets, each backed by a copy-on-write B+tree over
//! a fixed-size page file. One writable transaction runs at a time; any
//! number of read-only transactions run concurrently against immutable
//! snapshots and never block. Commits are made durable by writing dirty
//! pages, then flipping one of two alternating meta pages — a crash at any
//! point leaves the previous committed state intact.
//!
//! ```
//! use silo::{Db, Options};
//!
//! let dir = tempfile::tempdir()?;
//! let db = Db::open(dir.path().join("app.db"), Options::default())?;
//!
//! db.update(|tx| {
//!     let bucket = tx.create_bucket_if_not_exists(b"settings")?;
//!     bucket.put(b"theme", b"dark")
//! })?;
//!
//! db.view(|tx| {
//!     let bucket = tx.bucket(b"settings")?;
//!     assert_eq!(bucket.get(b"theme")?.as_deref(), Some(&b"dark"[..]));
//!     Ok(())
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bucket;
mod compact;
mod cursor;
mod db;
mod error;
mod freelist;
mod meta;
mod node;
mod overflow;
mod page;
mod pager;
mod tx;

pub use bucket::Bucket;
pub use compact::compact;
pub use cursor::{Cursor, Entry};
pub use db::{Db, Options, Stats};
pub use error::{Result, SiloError};
pub use page::{TxId, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use tx::{Tx, TxPhase};
