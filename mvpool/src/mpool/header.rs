use std::fmt;

use bitflags::bitflags;

/// A page number within a logical file. Page 0 is never used.
pub type Pgno = u32;

/// The region offset of a buffer header.
///
/// Headers never hold pointers to each other, only offsets, and an offset is
/// resolved through the hash bucket that currently owns the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BhId(pub(crate) u32);

impl BhId {
    /// Returns the raw offset.
    #[inline]
    pub fn offset(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BhId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bh@{}", self.0)
    }
}

/// The region offset of a registered logical file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MfOffset(pub(crate) u32);

/// The region offset of a transaction-detail record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TdOffset(pub u64);

/// The identity of a page: its logical file and page number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    /// The logical file.
    pub mf: MfOffset,
    /// The page number within `mf`.
    pub pgno: Pgno,
}

impl PageKey {
    /// Creates a page key.
    pub fn new(mf: MfOffset, pgno: Pgno) -> Self {
        PageKey { mf, pgno }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mf.0, self.pgno)
    }
}

bitflags! {
/// Buffer header state flags.
pub struct BhFlags: u8 {
    /// The page was modified and must be written before its memory is reused.
    const DIRTY = 0b00000001;
    /// A freeze or thaw of this header is in progress.
    const LOCKED = 0b00000010;
    /// The header was thawed while other threads still referenced it.
    const THAWED = 0b00000100;
}
}

impl Default for BhFlags {
    fn default() -> Self {
        BhFlags::empty()
    }
}

/// The content of a version.
pub(crate) enum Payload {
    /// The page bytes are held in memory.
    Live(Box<[u8]>),
    /// The page bytes are in slot `spgno` of the bucket's freezer file.
    ///
    /// `spgno == 0` means the slot has already been released.
    Frozen { spgno: Pgno },
}

/// A buffer header: one version of one page.
pub struct BufferHeader {
    pub(crate) id: BhId,
    pub(crate) page: PageKey,
    pub(crate) flags: BhFlags,
    pub(crate) refs: u32,
    pub(crate) ref_sync: u32,
    pub(crate) priority: u32,
    pub(crate) td_off: Option<TdOffset>,
    /// The next newer version of this page.
    pub(crate) newer: Option<BhId>,
    /// The next older version of this page.
    pub(crate) older: Option<BhId>,
    pub(crate) payload: Payload,
}

impl BufferHeader {
    pub(crate) fn new_live(id: BhId, page: PageKey, data: Box<[u8]>) -> Self {
        BufferHeader {
            id,
            page,
            flags: BhFlags::empty(),
            refs: 0,
            ref_sync: 0,
            priority: 0,
            td_off: None,
            newer: None,
            older: None,
            payload: Payload::Live(data),
        }
    }

    /// Returns an unused frozen header as kept in the frozen-header pool.
    pub(crate) fn new_frozen(id: BhId) -> Self {
        BufferHeader {
            id,
            page: PageKey::new(MfOffset(0), 0),
            flags: BhFlags::empty(),
            refs: 0,
            ref_sync: 0,
            priority: 0,
            td_off: None,
            newer: None,
            older: None,
            payload: Payload::Frozen { spgno: 0 },
        }
    }

    /// Turns this pooled header into the frozen copy of `live`.
    pub(crate) fn freeze_from(&mut self, live: &BufferHeader, spgno: Pgno) {
        debug_assert!(spgno != 0);
        self.page = live.page;
        self.flags = live.flags - BhFlags::LOCKED;
        self.refs = 0;
        self.ref_sync = 0;
        self.priority = u32::MAX;
        self.td_off = live.td_off;
        self.newer = None;
        self.older = None;
        self.payload = Payload::Frozen { spgno };
    }

    /// Clears everything but the identity before going back to the pool.
    pub(crate) fn reset(&mut self) {
        *self = BufferHeader::new_frozen(self.id);
    }

    /// Returns the offset of this header.
    #[inline]
    pub fn id(&self) -> BhId {
        self.id
    }

    /// Returns the page this header is a version of.
    #[inline]
    pub fn page(&self) -> PageKey {
        self.page
    }

    /// Returns the page number.
    #[inline]
    pub fn pgno(&self) -> Pgno {
        self.page.pgno
    }

    /// Returns the state flags.
    #[inline]
    pub fn flags(&self) -> BhFlags {
        self.flags
    }

    /// Returns the number of threads referencing this header.
    #[inline]
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// Returns the number of threads waiting for this header to be written.
    #[inline]
    pub fn ref_sync(&self) -> u32 {
        self.ref_sync
    }

    /// Returns the replacement priority. Frozen headers never win over live ones.
    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Returns the transaction that created this version, if it is not yet
    /// known to be visible to everyone.
    #[inline]
    pub fn owner(&self) -> Option<TdOffset> {
        self.td_off
    }

    /// Returns the next newer version of the page.
    #[inline]
    pub fn newer(&self) -> Option<BhId> {
        self.newer
    }

    /// Returns the next older version of the page.
    #[inline]
    pub fn older(&self) -> Option<BhId> {
        self.older
    }

    /// Whether the page bytes live in a freezer file.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        matches!(self.payload, Payload::Frozen { .. })
    }

    /// Whether a freeze or thaw of this header is in progress.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flags.contains(BhFlags::LOCKED)
    }

    /// Whether the page was modified since it was last written.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BhFlags::DIRTY)
    }

    /// Whether the header was thawed while still referenced.
    #[inline]
    pub fn is_thawed(&self) -> bool {
        self.flags.contains(BhFlags::THAWED)
    }

    /// Returns the freezer slot of a frozen header.
    pub fn spgno(&self) -> Option<Pgno> {
        match self.payload {
            Payload::Frozen { spgno } => Some(spgno),
            Payload::Live(_) => None,
        }
    }

    /// Returns the page bytes of a live header.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Live(data) => Some(&data[..]),
            Payload::Frozen { .. } => None,
        }
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.payload {
            Payload::Live(data) => Some(&mut data[..]),
            Payload::Frozen { .. } => None,
        }
    }

    /// Records that the freezer slot of this header has been released.
    pub(crate) fn clear_spgno(&mut self) {
        if let Payload::Frozen { spgno } = &mut self.payload {
            *spgno = 0;
        }
    }

    #[inline]
    pub(crate) fn is_singleton(&self) -> bool {
        self.newer.is_none() && self.older.is_none()
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("id", &self.id)
            .field("page", &self.page)
            .field("flags", &self.flags)
            .field("refs", &self.refs)
            .field("priority", &self.priority)
            .field("td_off", &self.td_off)
            .field("newer", &self.newer)
            .field("older", &self.older)
            .field("spgno", &self.spgno())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_from_live() {
        let page = PageKey::new(MfOffset(3), 7);
        let mut live = BufferHeader::new_live(BhId(1), page, vec![7u8; 16].into());
        live.flags = BhFlags::LOCKED;
        live.refs = 2;
        live.priority = 10;
        live.td_off = Some(TdOffset(42));
        live.newer = Some(BhId(9));

        let mut frozen = BufferHeader::new_frozen(BhId(2));
        frozen.freeze_from(&live, 5);
        assert_eq!(frozen.id(), BhId(2));
        assert_eq!(frozen.page(), page);
        assert!(frozen.is_frozen());
        assert!(!frozen.is_locked());
        assert_eq!(frozen.refs(), 0);
        assert_eq!(frozen.priority(), u32::MAX);
        assert_eq!(frozen.owner(), Some(TdOffset(42)));
        assert_eq!(frozen.newer(), None);
        assert_eq!(frozen.spgno(), Some(5));
        assert!(frozen.data().is_none());

        frozen.reset();
        assert_eq!(frozen.id(), BhId(2));
        assert!(frozen.flags().is_empty());
        assert_eq!(frozen.owner(), None);
        assert_eq!(frozen.spgno(), Some(0));
    }
}
