use log::debug;

use super::{BhFlags, BhId, LockedBucket, Region};
use crate::{env::Env, Error, Result};

impl<E: Env> Region<E> {
    /// Thaws the frozen version `id`.
    ///
    /// With a `target`, a live header from [`Region::alloc_buffer`], the
    /// frozen content is read into the target and the target takes the place
    /// of the frozen version in its chain. Without one, the frozen version
    /// must be obsolete (see [`Region::is_obsolete`]) and is discarded.
    ///
    /// The caller holds a reference on `id`, which a successful thaw
    /// consumes. If other threads still reference the header it is marked
    /// [`BhFlags::THAWED`] and the last [`Region::unpin`] gives it back to the
    /// pool.
    ///
    /// On failure the version is left in its chain, unlocked and still
    /// referenced, so the thaw can be retried. A retried thaw never releases
    /// the same freezer slot twice.
    pub fn thaw(&self, bucket: &mut LockedBucket<'_>, id: BhId, target: Option<BhId>) -> Result<()> {
        self.check_panic()?;
        self.check_bucket(bucket, None)?;
        self.check_thaw(bucket, id, target)?;
        if let Some(bh) = bucket.state.headers.get_mut(&id) {
            bh.flags.insert(BhFlags::LOCKED);
        }

        let res = self.thaw_locked(bucket, id, target);

        if res.is_err() {
            if let Some(bh) = bucket.state.headers.get_mut(&id) {
                bh.flags.remove(BhFlags::LOCKED);
            }
        }
        bucket.state.waiters.notify_all(id);
        match (&res, target) {
            (Ok(()), Some(_)) => self.stats.thawed.inc(),
            (Ok(()), None) => self.stats.discarded.inc(),
            (Err(err), _) => {
                debug!("Thaw {id} in bucket {}: {err}", bucket.index);
                self.stats.thaw_failed.inc()
            }
        };
        self.guard(res)
    }

    fn check_thaw(&self, bucket: &LockedBucket<'_>, id: BhId, target: Option<BhId>) -> Result<()> {
        let bh = bucket.header(id).ok_or(Error::InvalidArgument)?;
        if !bh.is_frozen() || bh.is_locked() || bh.refs == 0 {
            return Err(Error::InvalidArgument);
        }
        match target {
            Some(target) => {
                // The content is gone once the slot has been released.
                if bh.spgno() == Some(0) {
                    return Err(Error::InvalidArgument);
                }
                let page_size = self.page_size(bh.page.mf)?;
                let live = bucket.header(target).ok_or(Error::InvalidArgument)?;
                let detached = live.is_singleton() && bucket.lookup(live.page) != Some(target);
                if live.is_frozen()
                    || live.is_locked()
                    || live.page.mf != bh.page.mf
                    || !detached
                    || live.data().map(<[u8]>::len) != Some(page_size as usize)
                {
                    return Err(Error::InvalidArgument);
                }
            }
            None => {
                if !self.guard(self.obsolete(&bucket.state, id))? {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        Ok(())
    }

    fn thaw_locked(
        &self,
        bucket: &mut LockedBucket<'_>,
        id: BhId,
        target: Option<BhId>,
    ) -> Result<()> {
        let index = bucket.index;
        let (page, spgno, td) = {
            let bh = bucket.state.resolve(id)?;
            (bh.page, bh.spgno().unwrap_or(0), bh.td_off)
        };

        if spgno != 0 {
            let page_size = self.file(page.mf)?.page_size;
            let mut file = self.freezer.open(index, page_size)?;
            if let Some(target) = target {
                let data = bucket
                    .state
                    .resolve_mut(target)?
                    .data_mut()
                    .ok_or(Error::InvalidArgument)?;
                file.read_slot(spgno, data)?;
            }
            let release = self.freezer.release(&mut file, index, page_size, spgno)?;
            bucket.state.resolve_mut(id)?.clear_spgno();
            debug!(
                "Release freezer slot {spgno} of bucket {index} held by page {page}: {release:?}"
            );
        }

        if let Some(target) = target {
            let mut live = match bucket.state.headers.remove(&target) {
                Some(live) => live,
                None => return Err(Error::Corrupted),
            };
            live.page = page;
            live.td_off = td;
            live.flags.remove(BhFlags::DIRTY);
            bucket.state.resolve_mut(id)?.td_off = None;
            bucket.state.insert_newer(id, live)?;
            debug!("Thaw page {page} from {id} into {target} in bucket {index}");
        }

        let (refs, td) = {
            let bh = bucket.state.resolve(id)?;
            (bh.refs, bh.td_off)
        };
        if refs > 1 {
            bucket.state.detach(id)?;
            let bh = bucket.state.resolve_mut(id)?;
            bh.refs -= 1;
            bh.flags.remove(BhFlags::LOCKED);
            bh.flags.insert(BhFlags::THAWED);
            debug!("Leave thawed header {id} to {} other holders", refs - 1);
            return Ok(());
        }

        if let Some(td) = td {
            self.txn.remove_buffer(td)?;
        }
        bucket.state.detach(id)?;
        if let Some(bh) = bucket.state.headers.remove(&id) {
            self.region.lock().frozen.push(bh);
            self.file(page.mf)?.block_cnt.dec();
        }
        if target.is_none() {
            debug!("Discard obsolete frozen page {page} of {id} in bucket {index}");
        }
        Ok(())
    }
}
