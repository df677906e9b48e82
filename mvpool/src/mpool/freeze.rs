use log::{debug, warn};
use parking_lot::MutexGuard;

use super::{BhFlags, BhId, BufferHeader, LockedBucket, Region, RegionState};
use crate::{env::Env, Error, Result};

impl<E: Env> Region<E> {
    /// Freezes the live version `id`.
    ///
    /// The content of the version is written to the bucket's freezer file and
    /// a frozen header for the same page is linked right after it on the newer
    /// side of the chain. The caller then frees the live header.
    ///
    /// The caller must hold the only reference on `id`, which must be clean.
    ///
    /// Returns true if the frozen-header pool is empty and should be refilled
    /// with [`Region::alloc_frozen_headers`]. [`Error::OutOfMemory`] means no
    /// frozen header was available at all; it never falls back to the
    /// general allocator.
    pub fn freeze(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<bool> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        {
            let bh = bucket.header(id).ok_or(Error::InvalidArgument)?;
            if bh.is_frozen() || bh.is_dirty() || bh.is_locked() || bh.refs != 1 {
                return Err(Error::InvalidArgument);
            }
        }
        if let Some(bh) = bucket.state.headers.get_mut(&id) {
            bh.flags.insert(BhFlags::LOCKED);
            bh.refs += 1;
        }

        let res = self.freeze_locked(bucket, id);

        if let Some(bh) = bucket.state.headers.get_mut(&id) {
            bh.flags.remove(BhFlags::LOCKED);
            bh.refs -= 1;
        }
        bucket.state.waiters.notify_one(id);
        match &res {
            Ok(_) => self.stats.frozen.inc(),
            Err(err) => {
                debug!("Freeze {id} in bucket {}: {err}", bucket.index);
                self.stats.freeze_failed.inc()
            }
        };
        self.guard(res)
    }

    fn freeze_locked(&self, bucket: &mut LockedBucket<'_>, id: BhId) -> Result<bool> {
        // The live header is locked, so it stays put while the bucket is
        // unlocked.
        let (mut frozen, need_refill) =
            MutexGuard::unlocked(&mut bucket.state, || self.pop_frozen())?;

        if let Err(err) = self.write_frozen(bucket, id, &mut frozen) {
            self.region.lock().frozen.push(frozen);
            return Err(err);
        }
        let mf = frozen.page.mf;
        bucket.state.insert_newer(id, frozen)?;
        self.file(mf)?.block_cnt.inc();
        Ok(need_refill)
    }

    /// Takes an unused frozen header, carving a new one if the pool is empty.
    fn pop_frozen(&self) -> Result<(BufferHeader, bool)> {
        let mut region = self.region.lock();
        let RegionState { alloc, frozen } = &mut *region;
        let bh = match frozen.pop() {
            Some(bh) => bh,
            None => match frozen.carve(alloc) {
                Some(bh) => {
                    self.stats.headers_carved.inc();
                    bh
                }
                None => return Err(Error::OutOfMemory),
            },
        };
        Ok((bh, frozen.is_empty()))
    }

    /// Writes the content of `id` to a freezer slot and fills `frozen` in.
    ///
    /// Nothing is left behind in the freezer file on failure.
    fn write_frozen(
        &self,
        bucket: &mut LockedBucket<'_>,
        id: BhId,
        frozen: &mut BufferHeader,
    ) -> Result<()> {
        let index = bucket.index;
        let live = bucket.state.resolve(id)?;
        let page_size = self.file(live.page.mf)?.page_size;
        let mut file = self.freezer.open_or_create(index, page_size)?;
        let spgno = file.alloc()?;

        let res = match live.data() {
            Some(data) => file.write_slot(spgno, data),
            None => Err(Error::Corrupted),
        };
        let res = res.and_then(|()| {
            frozen.freeze_from(live, spgno);
            match live.td_off {
                Some(td) => self.txn.add_buffer(td),
                None => Ok(()),
            }
        });
        if let Err(err) = res {
            if let Err(rollback) = self.freezer.release(&mut file, index, page_size, spgno) {
                warn!("Release freezer slot {spgno} of bucket {index}: {rollback}");
            }
            return Err(err);
        }
        debug!(
            "Freeze page {} of {id} into freezer slot {spgno} of bucket {index}",
            live.page
        );
        Ok(())
    }
}
