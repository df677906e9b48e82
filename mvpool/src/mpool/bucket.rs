use log::error;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use super::header::{BhId, BufferHeader, PageKey};
use crate::{util::notify::IoWaiters, Error, Result};

/// A hash bucket of the page cache.
pub(crate) struct HashBucket {
    state: Mutex<BucketState>,
}

impl HashBucket {
    pub(crate) fn new() -> Self {
        HashBucket {
            state: Mutex::new(BucketState::default()),
        }
    }

    pub(crate) fn lock(&self, index: u32) -> LockedBucket<'_> {
        LockedBucket {
            index,
            state: self.state.lock(),
        }
    }

    /// Returns true if `bucket` holds the mutex of this bucket.
    pub(crate) fn owns(&self, bucket: &LockedBucket<'_>) -> bool {
        std::ptr::eq(MutexGuard::mutex(&bucket.state), &self.state)
    }

    /// Locks the bucket state without a handle, for whole-region passes.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock()
    }
}

/// Everything a hash bucket mutex protects.
#[derive(Default)]
pub(crate) struct BucketState {
    /// Every header owned by the bucket, chained or not.
    pub(crate) headers: FxHashMap<BhId, BufferHeader>,
    /// The lookup queue: the newest version of each page.
    pub(crate) heads: FxHashMap<PageKey, BhId>,
    pub(crate) waiters: IoWaiters<BhId>,
}

impl BucketState {
    /// Resolves a header offset owned by this bucket.
    pub(crate) fn resolve(&self, id: BhId) -> Result<&BufferHeader> {
        match self.headers.get(&id) {
            Some(bh) => Ok(bh),
            None => {
                error!("Buffer header {id} is not in its hash bucket");
                Err(Error::Corrupted)
            }
        }
    }

    pub(crate) fn resolve_mut(&mut self, id: BhId) -> Result<&mut BufferHeader> {
        match self.headers.get_mut(&id) {
            Some(bh) => Ok(bh),
            None => {
                error!("Buffer header {id} is not in its hash bucket");
                Err(Error::Corrupted)
            }
        }
    }
}

/// A hash bucket with its mutex held.
///
/// Freeze and thaw take the bucket in this state; the lock is released when
/// the value is dropped.
pub struct LockedBucket<'a> {
    pub(crate) index: u32,
    pub(crate) state: MutexGuard<'a, BucketState>,
}

impl<'a> LockedBucket<'a> {
    /// Returns the index of this bucket in its region.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the header at `id`, if this bucket owns it.
    pub fn header(&self, id: BhId) -> Option<&BufferHeader> {
        self.state.headers.get(&id)
    }

    /// Returns the newest version of `page`.
    pub fn lookup(&self, page: PageKey) -> Option<BhId> {
        self.state.heads.get(&page).copied()
    }

    /// Returns the versions of `page`, newest first.
    pub fn versions(&self, page: PageKey) -> Result<Vec<BhId>> {
        self.state.versions(page)
    }

    /// Returns the number of headers owned by this bucket.
    pub fn len(&self) -> usize {
        self.state.headers.len()
    }

    /// Whether this bucket owns no header.
    pub fn is_empty(&self) -> bool {
        self.state.headers.is_empty()
    }
}
