use std::{
    io::{Error, ErrorKind, Result},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use super::{Env, Metadata, OpenOptions, PositionalFile, ReadAt, Std, Syncer, Truncate, WriteAt};

/// An [`Env`] wrapping [`Std`] that fails I/O on demand.
#[derive(Clone, Default)]
pub(crate) struct Faulty {
    inner: Std,
    faults: Arc<Faults>,
}

#[derive(Default)]
pub(crate) struct Faults {
    /// Fail every write once this many further writes succeeded.
    writes_left: AtomicUsize,
    fail_writes: AtomicBool,
    /// Heal writes after the first injected failure.
    fail_once: AtomicBool,
    fail_reads: AtomicBool,
    no_truncate: AtomicBool,
    fail_truncate: AtomicBool,
}

impl Faulty {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails writes after `n` more successful ones.
    pub(crate) fn fail_writes_after(&self, n: usize) {
        self.faults.writes_left.store(n, Ordering::SeqCst);
        self.faults.fail_once.store(false, Ordering::SeqCst);
        self.faults.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Fails the write that follows `n` more successful ones, and only that.
    pub(crate) fn fail_one_write_after(&self, n: usize) {
        self.faults.writes_left.store(n, Ordering::SeqCst);
        self.faults.fail_once.store(true, Ordering::SeqCst);
        self.faults.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn disable_truncate(&self, disable: bool) {
        self.faults.no_truncate.store(disable, Ordering::SeqCst);
    }

    /// Makes `set_len` fail while truncation is still supported.
    pub(crate) fn fail_truncate(&self, fail: bool) {
        self.faults.fail_truncate.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn heal(&self) {
        self.faults.fail_writes.store(false, Ordering::SeqCst);
        self.faults.fail_reads.store(false, Ordering::SeqCst);
        self.faults.fail_truncate.store(false, Ordering::SeqCst);
    }
}

impl Faults {
    fn check_write(&self) -> Result<()> {
        if !self.fail_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == 0 {
            if self.fail_once.load(Ordering::SeqCst) {
                self.fail_writes.store(false, Ordering::SeqCst);
            }
            return Err(Error::new(ErrorKind::Other, "injected write failure"));
        }
        self.writes_left.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Env for Faulty {
    type PositionalFile = FaultyFile;

    fn open_positional_file<P>(&self, path: P, opt: OpenOptions) -> Result<Self::PositionalFile>
    where
        P: AsRef<Path>,
    {
        let file = self.inner.open_positional_file(path, opt)?;
        Ok(FaultyFile {
            file,
            faults: self.faults.clone(),
        })
    }

    fn remove_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn create_dir_all<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn metadata<P: AsRef<Path>>(&self, path: P) -> Result<Metadata> {
        self.inner.metadata(path)
    }
}

pub(crate) struct FaultyFile {
    file: PositionalFile,
    faults: Arc<Faults>,
}

impl ReadAt for FaultyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Other, "injected read failure"));
        }
        self.file.read_at(buf, offset)
    }
}

impl WriteAt for FaultyFile {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.faults.check_write()?;
        self.file.write_at(buf, offset)
    }
}

impl Truncate for FaultyFile {
    fn supports_truncate(&self) -> bool {
        !self.faults.no_truncate.load(Ordering::SeqCst)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        if self.faults.fail_truncate.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Other, "injected truncate failure"));
        }
        self.file.set_len(len)
    }
}

impl Syncer for FaultyFile {
    fn sync_data(&self) -> Result<()> {
        self.file.sync_data()
    }
}
