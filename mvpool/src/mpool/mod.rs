//! The multiversion part of a shared page cache.
//!
//! A [`Region`] owns a set of hash buckets. Each bucket holds the version
//! chains of the pages that hash to it, and each version is a
//! [`BufferHeader`]. Versions that are too old to stay in memory but may still
//! be read by a snapshot are frozen into the bucket's freezer file, and thawed
//! back or discarded later.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

mod bucket;
pub use bucket::LockedBucket;
use bucket::{BucketState, HashBucket};

mod chain;
mod freeze;
mod freezer_file;
use freezer_file::FreezerFiles;

mod header;
pub use header::{BhFlags, BhId, BufferHeader, MfOffset, PageKey, Pgno, TdOffset};

mod pool;
use pool::{FrozenPool, RegionAlloc, HEADER_SIZE};

mod stats;
pub use stats::FreezerStats;
use stats::AtomicFreezerStats;

mod thaw;

mod txn;
pub use txn::{Lsn, ReaderId, TxnManager, TxnRegistry};

use crate::{
    env::{Env, Std},
    util::{atomic::Counter, notify::wait_while},
    Error, Result,
};

/// Options to configure a region.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct Options {
    /// The index of the cache. It is part of every freezer file name.
    ///
    /// Default: 0
    pub cache_id: u32,

    /// The number of hash buckets.
    ///
    /// Default: 1024
    pub num_buckets: u32,

    /// The memory budget of the region, shared by live buffers and frozen
    /// headers.
    ///
    /// Default: 64MB
    pub region_size: usize,

    /// The number of frozen headers carved when the region is opened.
    ///
    /// Default: 16
    pub prealloc_frozen: usize,

    /// If true, sync freezer files after every write.
    ///
    /// Default: false
    pub sync_freezer_files: bool,

    /// Custom flags to open freezer files with.
    ///
    /// Default: 0
    pub custom_flags: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_id: 0,
            num_buckets: 1024,
            region_size: 64 << 20,
            prealloc_frozen: 16,
            sync_freezer_files: false,
            custom_flags: 0,
        }
    }
}

/// A registered logical file.
struct MpoolFile {
    page_size: u32,
    block_cnt: Counter,
}

/// Everything the region mutex protects.
struct RegionState {
    alloc: RegionAlloc,
    frozen: FrozenPool,
}

/// A page cache region.
///
/// Lock order is bucket mutex, then region mutex.
pub struct Region<E: Env = Std> {
    options: Options,
    home: PathBuf,
    buckets: Vec<HashBucket>,
    region: Mutex<RegionState>,
    files: RwLock<Vec<Arc<MpoolFile>>>,
    freezer: FreezerFiles<E>,
    txn: Arc<dyn TxnManager>,
    lru_priority: Counter,
    panicked: AtomicBool,
    stats: Arc<AtomicFreezerStats>,
}

impl<E: Env> Region<E> {
    /// Opens a region whose freezer files live under `home`.
    pub fn open<P: AsRef<Path>>(
        env: E,
        home: P,
        options: Options,
        txn: Arc<dyn TxnManager>,
    ) -> Result<Self> {
        if options.num_buckets == 0 {
            return Err(Error::InvalidArgument);
        }
        let home = home.as_ref().to_path_buf();
        env.create_dir_all(&home)?;

        let stats = Arc::<AtomicFreezerStats>::default();
        let freezer = FreezerFiles::new(
            env,
            home.clone(),
            options.cache_id,
            options.custom_flags,
            options.sync_freezer_files,
            stats.clone(),
        );
        let buckets = (0..options.num_buckets).map(|_| HashBucket::new()).collect();

        let mut state = RegionState {
            alloc: RegionAlloc::new(options.region_size),
            frozen: FrozenPool::default(),
        };
        for _ in 0..options.prealloc_frozen {
            match state.frozen.carve(&mut state.alloc) {
                Some(bh) => {
                    state.frozen.push(bh);
                    stats.headers_carved.inc();
                }
                None => break,
            }
        }

        info!(
            "Open region {} at {} with {} buckets and {} frozen headers",
            options.cache_id,
            home.display(),
            options.num_buckets,
            state.frozen.free_len()
        );
        Ok(Region {
            options,
            home,
            buckets,
            region: Mutex::new(state),
            files: RwLock::new(Vec::new()),
            freezer,
            txn,
            lru_priority: Counter::new(0),
            panicked: AtomicBool::new(false),
            stats,
        })
    }

    /// Closes the region.
    ///
    /// Every version is discarded, the freezer files are removed and the
    /// memory of both header pools is given back.
    pub fn close(self) {
        let page_sizes = self.page_sizes();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let mut state = bucket.lock_state();
            state.heads.clear();
            state.headers.clear();
            for &page_size in &page_sizes {
                self.freezer
                    .remove_quietly(&self.freezer.path(index as u32, page_size));
            }
        }
        let mut region = self.region.lock();
        let RegionState { alloc, frozen } = &mut *region;
        let in_use = frozen.drain(alloc);
        info!(
            "Close region {} at {}, {in_use} frozen headers were still in use",
            self.options.cache_id,
            self.home.display()
        );
    }

    /// Registers a logical file with the given page size.
    ///
    /// The page size must be a power of two from 512 to 65536.
    pub fn register_file(&self, page_size: u32) -> Result<MfOffset> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::InvalidArgument);
        }
        let mut files = self.files.write();
        let mf = MfOffset(files.len() as u32);
        files.push(Arc::new(MpoolFile {
            page_size,
            block_cnt: Counter::new(0),
        }));
        Ok(mf)
    }

    /// Returns the page size of a registered file.
    pub fn page_size(&self, mf: MfOffset) -> Result<u32> {
        Ok(self.file(mf)?.page_size)
    }

    /// Returns the number of buffers, live or frozen, held for a file.
    pub fn block_count(&self, mf: MfOffset) -> Result<u64> {
        Ok(self.file(mf)?.block_cnt.get())
    }

    /// Returns the hash bucket of a page.
    pub fn bucket_of(&self, page: PageKey) -> u32 {
        let hash = (page.pgno << 8) ^ page.pgno ^ page.mf.0.wrapping_mul(509);
        hash % self.options.num_buckets
    }

    /// Locks a hash bucket.
    pub fn lock_bucket(&self, index: u32) -> Result<LockedBucket<'_>> {
        match self.buckets.get(index as usize) {
            Some(bucket) => Ok(bucket.lock(index)),
            None => Err(Error::InvalidArgument),
        }
    }

    /// Locks the hash bucket of a page.
    pub fn lock_page(&self, page: PageKey) -> LockedBucket<'_> {
        let index = self.bucket_of(page);
        self.buckets[index as usize].lock(index)
    }

    /// Creates the newest version of `page`, owned by `td` if given.
    ///
    /// New versions are dirty.
    pub fn new_version(
        &self,
        bucket: &mut LockedBucket<'_>,
        page: PageKey,
        td: Option<TdOffset>,
        data: &[u8],
    ) -> Result<BhId> {
        self.check_panic()?;
        self.check_bucket(bucket, Some(page))?;
        let file = self.file(page.mf)?;
        if page.pgno == 0 || data.len() != file.page_size as usize {
            return Err(Error::InvalidArgument);
        }
        let id = self.alloc_live(file.page_size)?;
        if let Some(td) = td {
            if let Err(err) = self.txn.add_buffer(td) {
                self.free_live(file.page_size);
                return self.guard(Err(err));
            }
        }
        let mut bh = BufferHeader::new_live(id, page, data.into());
        bh.flags = BhFlags::DIRTY;
        bh.priority = self.next_priority();
        bh.td_off = td;
        self.guard(bucket.state.push_newest(bh))?;
        file.block_cnt.inc();
        debug!("Create version {id} of page {page} in bucket {}", bucket.index);
        Ok(id)
    }

    /// Allocates a live header that is not linked to any chain yet, to be
    /// used as the target of a thaw.
    pub fn alloc_buffer(&self, bucket: &mut LockedBucket<'_>, mf: MfOffset) -> Result<BhId> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let file = self.file(mf)?;
        let id = self.alloc_live(file.page_size)?;
        let data = vec![0u8; file.page_size as usize].into_boxed_slice();
        let mut bh = BufferHeader::new_live(id, PageKey::new(mf, 0), data);
        bh.priority = self.next_priority();
        bucket.state.headers.insert(id, bh);
        file.block_cnt.inc();
        Ok(id)
    }

    /// Frees a live header that nobody references.
    pub fn free_buffer(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let (mf, td) = {
            let bh = bucket.header(id).ok_or(Error::InvalidArgument)?;
            if bh.is_frozen() || bh.is_locked() || bh.refs != 0 {
                return Err(Error::InvalidArgument);
            }
            (bh.page.mf, bh.td_off)
        };
        let file = self.file(mf)?;
        if let Some(td) = td {
            self.guard(self.txn.remove_buffer(td))?;
        }
        self.guard(bucket.state.detach(id))?;
        bucket.state.headers.remove(&id);
        self.free_live(file.page_size);
        file.block_cnt.dec();
        debug!("Free buffer {id} in bucket {}", bucket.index);
        Ok(())
    }

    /// Overwrites the content of a live header and marks it dirty.
    pub fn write_page(&self, bucket: &mut LockedBucket<'_>, id: BhId, data: &[u8]) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let bh = bucket
            .state
            .headers
            .get_mut(&id)
            .ok_or(Error::InvalidArgument)?;
        if bh.is_locked() {
            return Err(Error::InvalidArgument);
        }
        let page = bh.data_mut().ok_or(Error::InvalidArgument)?;
        if page.len() != data.len() {
            return Err(Error::InvalidArgument);
        }
        page.copy_from_slice(data);
        bh.flags.insert(BhFlags::DIRTY);
        Ok(())
    }

    /// Marks a live header clean, as if it had been written back.
    pub fn mark_clean(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let bh = bucket
            .state
            .headers
            .get_mut(&id)
            .ok_or(Error::InvalidArgument)?;
        if bh.is_frozen() {
            return Err(Error::InvalidArgument);
        }
        bh.flags.remove(BhFlags::DIRTY);
        Ok(())
    }

    /// Takes a reference on a header.
    pub fn pin(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let bh = bucket
            .state
            .headers
            .get_mut(&id)
            .ok_or(Error::InvalidArgument)?;
        bh.refs = bh.refs.checked_add(1).ok_or(Error::InvalidArgument)?;
        Ok(())
    }

    /// Drops a reference on a header.
    ///
    /// Dropping the last reference on a thawed header returns it to the
    /// frozen-header pool.
    pub fn unpin(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let (refs, thawed, td) = {
            let bh = bucket.header(id).ok_or(Error::InvalidArgument)?;
            (bh.refs, bh.is_thawed(), bh.td_off)
        };
        if refs == 0 {
            return Err(Error::InvalidArgument);
        }
        if thawed && refs == 1 {
            if let Some(td) = td {
                self.guard(self.txn.remove_buffer(td))?;
            }
            if let Some(bh) = bucket.state.headers.remove(&id) {
                let mf = bh.page.mf;
                self.region.lock().frozen.push(bh);
                self.file(mf)?.block_cnt.dec();
            }
            debug!("Release thawed header {id} in bucket {}", bucket.index);
            return Ok(());
        }
        bucket.state.resolve_mut(id)?.refs -= 1;
        Ok(())
    }

    /// Blocks until no freeze or thaw is in progress on a header.
    ///
    /// The bucket mutex is released while waiting.
    pub fn wait_for_io(&self, bucket: &mut LockedBucket<'_>, id: BhId) {
        wait_while(
            &mut bucket.state,
            id,
            |s| &mut s.waiters,
            |s| s.headers.get(&id).map_or(false, BufferHeader::is_locked),
        );
    }

    /// Returns the lowest priority over every version of the page `id`
    /// belongs to.
    ///
    /// Frozen versions have the maximum priority, so a chain is only as
    /// valuable as its most valuable live version.
    pub fn aggregate_priority(&self, bucket: &LockedBucket<'_>, id: BhId) -> Result<u32> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        self.guard(bucket.state.aggregate_priority(id))
    }

    /// Returns true if a cursor reading `page` on behalf of `td` must not
    /// adjust itself, because the newest version belongs to another
    /// transaction family.
    pub fn skip_cursor_adjust(
        &self,
        bucket: &LockedBucket<'_>,
        page: PageKey,
        td: TdOffset,
    ) -> Result<bool> {
        self.check_panic()?;
        self.check_bucket(bucket, Some(page))?;
        let owner = match bucket.lookup(page) {
            Some(head) => bucket.state.resolve(head)?.td_off,
            None => return Ok(false),
        };
        match owner {
            Some(owner) => Ok(self.txn.root(owner)? != self.txn.root(td)?),
            None => Ok(false),
        }
    }

    /// Returns true if no active reader can need version `id`.
    ///
    /// That is the case for the only version of a page, and for a version
    /// whose next newer version is visible at the oldest reader's snapshot.
    pub fn is_obsolete(&self, bucket: &LockedBucket<'_>, id: BhId) -> Result<bool> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        let res = self.obsolete(&bucket.state, id);
        self.guard(res)
    }

    fn obsolete(&self, state: &BucketState, id: BhId) -> Result<bool> {
        let bh = state.resolve(id)?;
        let newer = match bh.newer {
            Some(newer) => state.resolve(newer)?,
            None => return Ok(bh.older.is_none()),
        };
        match newer.td_off {
            None => Ok(true),
            Some(td) => Ok(self
                .txn
                .visible_lsn(td)?
                .map_or(false, |lsn| lsn <= self.txn.oldest_reader())),
        }
    }

    /// Carves `n` more frozen headers out of the region.
    ///
    /// The general allocator calls this after [`Region::freeze`] reported that
    /// the pool needs a refill. Returns the number carved, which is less than
    /// `n` if the region ran out of memory.
    pub fn alloc_frozen_headers(&self, n: usize) -> Result<usize> {
        self.check_panic()?;
        let mut region = self.region.lock();
        let RegionState { alloc, frozen } = &mut *region;
        let mut carved = 0;
        while carved < n {
            match frozen.carve(alloc) {
                Some(bh) => frozen.push(bh),
                None => break,
            }
            carved += 1;
        }
        self.stats.headers_carved.add(carved as u64);
        if carved == 0 && n > 0 {
            return Err(Error::OutOfMemory);
        }
        Ok(carved)
    }

    /// Returns the number of unused frozen headers.
    pub fn free_frozen_headers(&self) -> usize {
        self.region.lock().frozen.free_len()
    }

    /// Returns the number of frozen headers ever carved.
    pub fn carved_frozen_headers(&self) -> usize {
        self.region.lock().frozen.carved_len()
    }

    /// Returns the bytes of region memory in use.
    pub fn memory_used(&self) -> usize {
        self.region.lock().alloc.used()
    }

    /// Returns a snapshot of the freeze and thaw statistics.
    pub fn stats(&self) -> FreezerStats {
        self.stats.snapshot()
    }

    /// Returns true once the region has seen a consistency violation.
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Checks every version chain and every freezer file.
    ///
    /// Each slot of a freezer file must be held by exactly one frozen version
    /// or be on the free list exactly once.
    pub fn verify(&self) -> Result<()> {
        self.check_panic()?;
        let res = self.verify_buckets();
        self.guard(res)
    }

    fn verify_buckets(&self) -> Result<()> {
        let files = self.files.read().clone();
        let page_sizes = self.page_sizes();
        for (index, bucket) in self.buckets.iter().enumerate() {
            let state = bucket.lock_state();
            state.check_chains()?;

            let mut slots: FxHashMap<u32, Vec<Pgno>> = FxHashMap::default();
            for bh in state.headers.values() {
                match bh.spgno() {
                    Some(spgno) if spgno != 0 => {
                        let file = files.get(bh.page.mf.0 as usize).ok_or_else(|| {
                            error!("Frozen header {} belongs to no file", bh.id);
                            Error::Corrupted
                        })?;
                        slots.entry(file.page_size).or_default().push(spgno);
                    }
                    _ => {}
                }
            }
            for &page_size in &page_sizes {
                let in_use = slots.get(&page_size).map_or(&[][..], |v| &v[..]);
                match self.freezer.try_open(index as u32, page_size)? {
                    Some(file) => file.check_slots(in_use)?,
                    None if !in_use.is_empty() => {
                        error!(
                            "Freezer file {} is missing",
                            self.freezer.path(index as u32, page_size).display()
                        );
                        return Err(Error::Corrupted);
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    fn page_sizes(&self) -> BTreeSet<u32> {
        self.files.read().iter().map(|f| f.page_size).collect()
    }

    fn file(&self, mf: MfOffset) -> Result<Arc<MpoolFile>> {
        self.files
            .read()
            .get(mf.0 as usize)
            .cloned()
            .ok_or(Error::InvalidArgument)
    }

    fn check_bucket(&self, bucket: &LockedBucket<'_>, page: Option<PageKey>) -> Result<()> {
        let owned = self
            .buckets
            .get(bucket.index as usize)
            .map_or(false, |b| b.owns(bucket));
        if !owned {
            return Err(Error::InvalidArgument);
        }
        match page {
            Some(page) if self.bucket_of(page) != bucket.index => Err(Error::InvalidArgument),
            _ => Ok(()),
        }
    }

    fn check_panic(&self) -> Result<()> {
        if self.is_panicked() {
            return Err(Error::RegionPanic);
        }
        Ok(())
    }

    /// Marks the region panicked if `res` is a consistency violation.
    fn guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(Error::Corrupted) = &res {
            if !self.panicked.swap(true, Ordering::AcqRel) {
                error!(
                    "Region {} panics after a consistency violation",
                    self.options.cache_id
                );
            }
        }
        res
    }

    fn next_priority(&self) -> u32 {
        let priority = self.lru_priority.inc() + 1;
        priority.min(u32::MAX as u64 - 1) as u32
    }

    fn alloc_live(&self, page_size: u32) -> Result<BhId> {
        self.region
            .lock()
            .alloc
            .alloc(HEADER_SIZE + page_size as usize)
            .ok_or(Error::OutOfMemory)
    }

    fn free_live(&self, page_size: u32) {
        self.region
            .lock()
            .alloc
            .free(HEADER_SIZE + page_size as usize);
    }
}
