//! Multiversion page buffers that can be frozen to disk and thawed back.
//!
//! A page cache that serves snapshot readers keeps several versions of a page
//! at once. Old versions are needed only by long-running readers, yet holding
//! them in memory forever starves the cache. This crate lets the cache freeze
//! such a version: its content moves to a per-bucket freezer file and a small
//! frozen header keeps its place in the page's version chain. A reader that
//! needs the version later thaws it into a fresh buffer, and once no reader
//! can need it any more it is thawed away for good.
//!
//! The entry point is [`Region`]. Operations on versions take a
//! [`LockedBucket`], the hash bucket the page belongs to with its mutex held.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mvpool::{env::Std, Options, PageKey, Region, TxnRegistry};
//!
//! # fn main() -> mvpool::Result<()> {
//! let txns = Arc::new(TxnRegistry::new());
//! let region = Region::open(Std, "/tmp/mvpool", Options::default(), txns)?;
//! let mf = region.register_file(4096)?;
//! let page = PageKey::new(mf, 7);
//!
//! let mut bucket = region.lock_page(page);
//! let live = region.new_version(&mut bucket, page, None, &[0u8; 4096])?;
//! region.mark_clean(&mut bucket, live)?;
//! region.pin(&mut bucket, live)?;
//! let refill = region.freeze(&mut bucket, live)?;
//! region.unpin(&mut bucket, live)?;
//! region.free_buffer(&mut bucket, live)?;
//! if refill {
//!     region.alloc_frozen_headers(16)?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, unreachable_pub)]

pub mod env;

mod error;
pub use error::{Error, ErrorClass, Result};

mod mpool;
pub use mpool::{
    BhFlags, BhId, BufferHeader, FreezerStats, LockedBucket, Lsn, MfOffset, Options, PageKey,
    Pgno, ReaderId, Region, TdOffset, TxnManager, TxnRegistry,
};

mod util;
