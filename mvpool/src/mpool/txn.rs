//! Transaction linkage of buffer headers.

use log::error;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::header::TdOffset;
use crate::{Error, Result};

/// A log sequence number.
pub type Lsn = u64;

/// The view of the transaction manager that freeze and thaw need.
pub trait TxnManager: Send + Sync {
    /// Records one more buffer owned by `td`.
    fn add_buffer(&self, td: TdOffset) -> Result<()>;

    /// Drops one buffer owned by `td`.
    fn remove_buffer(&self, td: TdOffset) -> Result<()>;

    /// Returns the commit LSN that makes versions of `td` visible, or `None`
    /// while its root transaction has not committed.
    fn visible_lsn(&self, td: TdOffset) -> Result<Option<Lsn>>;

    /// Returns the snapshot LSN of the oldest active reader, or [`Lsn::MAX`]
    /// if there is none.
    fn oldest_reader(&self) -> Lsn;

    /// Returns the root of the transaction family `td` belongs to.
    fn root(&self, td: TdOffset) -> Result<TdOffset>;
}

/// A snapshot reader registered with [`TxnRegistry::begin_reader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

/// A minimal in-memory transaction manager.
///
/// It keeps per transaction buffer counts and the set of snapshot readers,
/// nothing more.
#[derive(Default)]
pub struct TxnRegistry {
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    txns: FxHashMap<TdOffset, TxnDetail>,
    readers: FxHashMap<ReaderId, Lsn>,
}

struct TxnDetail {
    parent: Option<TdOffset>,
    commit_lsn: Option<Lsn>,
    buffers: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn detail(&self, td: TdOffset) -> Result<&TxnDetail> {
        match self.txns.get(&td) {
            Some(detail) => Ok(detail),
            None => {
                error!("Transaction detail {td:?} does not exist");
                Err(Error::Corrupted)
            }
        }
    }

    fn root(&self, td: TdOffset) -> Result<TdOffset> {
        let mut current = td;
        for _ in 0..=self.txns.len() {
            match self.detail(current)?.parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
        error!("Transaction family of {td:?} has a cycle");
        Err(Error::Corrupted)
    }
}

impl TxnRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a top level transaction.
    pub fn begin(&self) -> TdOffset {
        let mut inner = self.inner.lock();
        let td = TdOffset(inner.next_id());
        inner.txns.insert(
            td,
            TxnDetail {
                parent: None,
                commit_lsn: None,
                buffers: 0,
            },
        );
        td
    }

    /// Begins a child of `parent`.
    pub fn begin_child(&self, parent: TdOffset) -> Result<TdOffset> {
        let mut inner = self.inner.lock();
        inner.detail(parent)?;
        let td = TdOffset(inner.next_id());
        inner.txns.insert(
            td,
            TxnDetail {
                parent: Some(parent),
                commit_lsn: None,
                buffers: 0,
            },
        );
        Ok(td)
    }

    /// Commits a top level transaction at `lsn`.
    pub fn commit(&self, td: TdOffset, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        let detail = inner.txns.get_mut(&td).ok_or(Error::InvalidArgument)?;
        if detail.parent.is_some() || detail.commit_lsn.is_some() {
            return Err(Error::InvalidArgument);
        }
        detail.commit_lsn = Some(lsn);
        Ok(())
    }

    /// Returns the number of buffers owned by `td`.
    pub fn buffers(&self, td: TdOffset) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.detail(td)?.buffers)
    }

    /// Registers a snapshot reader at `lsn`.
    pub fn begin_reader(&self, lsn: Lsn) -> ReaderId {
        let mut inner = self.inner.lock();
        let id = ReaderId(inner.next_id());
        inner.readers.insert(id, lsn);
        id
    }

    /// Unregisters a snapshot reader.
    pub fn end_reader(&self, id: ReaderId) {
        self.inner.lock().readers.remove(&id);
    }
}

impl TxnManager for TxnRegistry {
    fn add_buffer(&self, td: TdOffset) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.detail(td)?;
        if let Some(detail) = inner.txns.get_mut(&td) {
            detail.buffers += 1;
        }
        Ok(())
    }

    fn remove_buffer(&self, td: TdOffset) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.detail(td)?.buffers == 0 {
            error!("Transaction detail {td:?} owns no buffer to remove");
            return Err(Error::Corrupted);
        }
        if let Some(detail) = inner.txns.get_mut(&td) {
            detail.buffers -= 1;
        }
        Ok(())
    }

    fn visible_lsn(&self, td: TdOffset) -> Result<Option<Lsn>> {
        let inner = self.inner.lock();
        let root = inner.root(td)?;
        Ok(inner.detail(root)?.commit_lsn)
    }

    fn oldest_reader(&self) -> Lsn {
        let inner = self.inner.lock();
        inner.readers.values().copied().min().unwrap_or(Lsn::MAX)
    }

    fn root(&self, td: TdOffset) -> Result<TdOffset> {
        self.inner.lock().root(td)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_accounting() {
        let txns = TxnRegistry::new();
        let td = txns.begin();
        txns.add_buffer(td).unwrap();
        txns.add_buffer(td).unwrap();
        assert_eq!(txns.buffers(td).unwrap(), 2);
        txns.remove_buffer(td).unwrap();
        txns.remove_buffer(td).unwrap();
        assert!(matches!(txns.remove_buffer(td), Err(Error::Corrupted)));
        assert!(matches!(
            txns.add_buffer(TdOffset(999)),
            Err(Error::Corrupted)
        ));
    }

    #[test]
    fn visibility_follows_root() {
        let txns = TxnRegistry::new();
        let parent = txns.begin();
        let child = txns.begin_child(parent).unwrap();
        assert_eq!(txns.root(child).unwrap(), parent);
        assert_eq!(txns.visible_lsn(child).unwrap(), None);
        assert!(matches!(txns.commit(child, 5), Err(Error::InvalidArgument)));

        txns.commit(parent, 10).unwrap();
        assert_eq!(txns.visible_lsn(child).unwrap(), Some(10));
        assert!(matches!(txns.commit(parent, 11), Err(Error::InvalidArgument)));
    }

    #[test]
    fn oldest_reader() {
        let txns = TxnRegistry::new();
        assert_eq!(txns.oldest_reader(), Lsn::MAX);
        let a = txns.begin_reader(20);
        let b = txns.begin_reader(7);
        assert_eq!(txns.oldest_reader(), 7);
        txns.end_reader(b);
        assert_eq!(txns.oldest_reader(), 20);
        txns.end_reader(a);
        assert_eq!(txns.oldest_reader(), Lsn::MAX);
    }
}
