//! Version chains.
//!
//! All versions of a page form a doubly linked list through `newer` and
//! `older`, newest first. Only the newest version is in the bucket's lookup
//! queue.

use log::error;
use rustc_hash::FxHashSet;

use super::{
    bucket::BucketState,
    header::{BhId, BufferHeader, PageKey},
};
use crate::{Error, Result};

impl BucketState {
    /// Links `bh` as the newest version of its page.
    pub(crate) fn push_newest(&mut self, mut bh: BufferHeader) -> Result<()> {
        let id = bh.id;
        let head = self.heads.get(&bh.page).copied();
        if let Some(head) = head {
            self.resolve_mut(head)?.newer = Some(id);
        }
        bh.newer = None;
        bh.older = head;
        self.heads.insert(bh.page, id);
        self.headers.insert(id, bh);
        Ok(())
    }

    /// Links `bh` right after `anchor` on the newer side.
    ///
    /// If `anchor` was the newest version, `bh` takes its place in the lookup
    /// queue.
    pub(crate) fn insert_newer(&mut self, anchor: BhId, mut bh: BufferHeader) -> Result<()> {
        let (page, newer) = {
            let anchor = self.resolve(anchor)?;
            (anchor.page, anchor.newer)
        };
        if let Some(newer) = newer {
            self.resolve(newer)?;
        }
        debug_assert_eq!(bh.page, page);

        let id = bh.id;
        bh.page = page;
        bh.newer = newer;
        bh.older = Some(anchor);
        match newer {
            Some(newer) => self.resolve_mut(newer)?.older = Some(id),
            None => {
                self.heads.insert(page, id);
            }
        }
        self.resolve_mut(anchor)?.newer = Some(id);
        self.headers.insert(id, bh);
        Ok(())
    }

    /// Unlinks `id` from its chain. The header stays in the bucket.
    ///
    /// If `id` was the newest version its older neighbor takes its place in
    /// the lookup queue.
    pub(crate) fn detach(&mut self, id: BhId) -> Result<()> {
        let (page, newer, older) = {
            let bh = self.resolve(id)?;
            (bh.page, bh.newer, bh.older)
        };
        if let Some(newer) = newer {
            self.resolve(newer)?;
        }
        if let Some(older) = older {
            self.resolve(older)?;
        }

        match newer {
            Some(newer) => self.resolve_mut(newer)?.older = older,
            None => {
                if self.heads.get(&page) == Some(&id) {
                    match older {
                        Some(older) => self.heads.insert(page, older),
                        None => self.heads.remove(&page),
                    };
                }
            }
        }
        if let Some(older) = older {
            self.resolve_mut(older)?.newer = newer;
        }
        let bh = self.resolve_mut(id)?;
        bh.newer = None;
        bh.older = None;
        Ok(())
    }

    /// Returns the versions of `page`, newest first.
    pub(crate) fn versions(&self, page: PageKey) -> Result<Vec<BhId>> {
        let mut versions = Vec::new();
        let mut next = self.heads.get(&page).copied();
        while let Some(id) = next {
            if versions.len() > self.headers.len() {
                error!("Version chain of page {page} has a cycle");
                return Err(Error::Corrupted);
            }
            versions.push(id);
            next = self.resolve(id)?.older;
        }
        Ok(versions)
    }

    /// Returns the lowest priority over the whole chain containing `id`.
    pub(crate) fn aggregate_priority(&self, id: BhId) -> Result<u32> {
        let mut head = self.resolve(id)?;
        let mut steps = 0;
        while let Some(newer) = head.newer {
            steps += 1;
            if steps > self.headers.len() {
                error!("Version chain of {id} has a cycle");
                return Err(Error::Corrupted);
            }
            head = self.resolve(newer)?;
        }
        let mut priority = head.priority;
        let mut next = head.older;
        while let Some(older) = next {
            let bh = self.resolve(older)?;
            priority = priority.min(bh.priority);
            next = bh.older;
        }
        Ok(priority)
    }

    /// Checks that every chain is well formed.
    ///
    /// Each lookup queue entry must be the newest version of its page, links
    /// must agree in both directions, a chain holds one page only, and every
    /// linked header must be reachable from the queue.
    pub(crate) fn check_chains(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for (&page, &head) in &self.heads {
            let bh = self.resolve(head)?;
            if bh.newer.is_some() || bh.page != page {
                error!("Lookup queue entry {head} of page {page} is not its newest version");
                return Err(Error::Corrupted);
            }
            let mut prev = head;
            seen.insert(head);
            let mut next = bh.older;
            while let Some(id) = next {
                let bh = self.resolve(id)?;
                if !seen.insert(id) {
                    error!("Version chain of page {page} revisits {id}");
                    return Err(Error::Corrupted);
                }
                if bh.newer != Some(prev) || bh.page != page {
                    error!("Version {id} of page {page} is linked inconsistently");
                    return Err(Error::Corrupted);
                }
                prev = id;
                next = bh.older;
            }
        }
        for (id, bh) in &self.headers {
            if !seen.contains(id) && !bh.is_singleton() {
                error!("Buffer header {id} is linked but not reachable from the lookup queue");
                return Err(Error::Corrupted);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpool::header::MfOffset;

    fn live(id: u32, page: PageKey, priority: u32) -> BufferHeader {
        let mut bh = BufferHeader::new_live(BhId(id), page, vec![0u8; 8].into());
        bh.priority = priority;
        bh
    }

    #[test]
    fn push_and_detach() {
        let page = PageKey::new(MfOffset(0), 7);
        let mut state = BucketState::default();
        state.push_newest(live(1, page, 5)).unwrap();
        state.push_newest(live(2, page, 3)).unwrap();
        state.push_newest(live(3, page, 9)).unwrap();
        assert_eq!(
            state.versions(page).unwrap(),
            vec![BhId(3), BhId(2), BhId(1)]
        );
        assert_eq!(state.aggregate_priority(BhId(1)).unwrap(), 3);
        state.check_chains().unwrap();

        state.detach(BhId(2)).unwrap();
        assert_eq!(state.versions(page).unwrap(), vec![BhId(3), BhId(1)]);
        state.check_chains().unwrap();

        state.detach(BhId(3)).unwrap();
        assert_eq!(state.versions(page).unwrap(), vec![BhId(1)]);
        state.check_chains().unwrap();

        state.detach(BhId(1)).unwrap();
        assert!(state.heads.is_empty());
        assert_eq!(state.headers.len(), 3);
        state.check_chains().unwrap();
    }

    #[test]
    fn insert_newer_takes_queue_position() {
        let page = PageKey::new(MfOffset(0), 7);
        let mut state = BucketState::default();
        state.push_newest(live(1, page, 5)).unwrap();
        state.push_newest(live(2, page, 6)).unwrap();

        state.insert_newer(BhId(1), live(3, page, 1)).unwrap();
        assert_eq!(
            state.versions(page).unwrap(),
            vec![BhId(2), BhId(3), BhId(1)]
        );
        state.insert_newer(BhId(2), live(4, page, 8)).unwrap();
        assert_eq!(state.heads[&page], BhId(4));
        assert_eq!(state.aggregate_priority(BhId(4)).unwrap(), 1);
        state.check_chains().unwrap();
    }

    #[test]
    fn check_chains_detects_broken_links() {
        let page = PageKey::new(MfOffset(0), 1);
        let mut state = BucketState::default();
        state.push_newest(live(1, page, 0)).unwrap();
        state.push_newest(live(2, page, 0)).unwrap();
        state.headers.get_mut(&BhId(1)).unwrap().newer = None;
        assert!(matches!(state.check_chains(), Err(Error::Corrupted)));

        let mut state = BucketState::default();
        state.push_newest(live(1, page, 0)).unwrap();
        let mut stray = live(2, PageKey::new(MfOffset(0), 2), 0);
        stray.older = Some(BhId(1));
        state.headers.insert(BhId(2), stray);
        assert!(matches!(state.check_chains(), Err(Error::Corrupted)));
    }
}
