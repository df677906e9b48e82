//! Freezer files hold the content of frozen page versions.
//!
//! There is one freezer file per `(cache, bucket, page size)`. The layout is
//! a fixed header followed by page sized slots numbered from 1:
//!
//! ```text
//! offset 0                      u32    magic
//! offset 4                      pgno   free list head (0 = empty)
//! offset 8                      pgno   highest allocated slot
//! offset 12 + (n - 1) * psize   slot n
//! ```
//!
//! Integers use the native byte order. A free slot stores the number of the
//! next free slot in its first bytes, so the free list lives inside the file
//! and every update to it is a read-modify-write of the file itself.

use std::{
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{error, info, trace, warn};

use super::{header::Pgno, stats::AtomicFreezerStats};
use crate::{
    env::{Env, OpenOptions, ReadAt, Syncer, Truncate, WriteAt},
    util::bitmap::SlotBitmap,
    Error, Result,
};

pub(crate) const FREEZER_MAGIC: u32 = 0x0610_2002;

const PGNO_SIZE: usize = mem::size_of::<Pgno>();

pub(crate) const FREEZER_HEADER_SIZE: usize = mem::size_of::<u32>() + 2 * PGNO_SIZE;

/// Returns the name of the freezer file for a bucket and page size.
pub(crate) fn freezer_file_name(cache_id: u32, bucket: u32, page_size: u32) -> String {
    format!("__db.freezer.{cache_id}.{bucket}.{}K", page_size / 1024)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreezerHeader {
    pub(crate) magic: u32,
    pub(crate) free: Pgno,
    pub(crate) max: Pgno,
}

impl FreezerHeader {
    fn empty() -> Self {
        FreezerHeader {
            magic: FREEZER_MAGIC,
            free: 0,
            max: 0,
        }
    }

    fn encode(&self) -> [u8; FREEZER_HEADER_SIZE] {
        let mut buf = [0u8; FREEZER_HEADER_SIZE];
        buf[..4].copy_from_slice(&self.magic.to_ne_bytes());
        buf[4..4 + PGNO_SIZE].copy_from_slice(&self.free.to_ne_bytes());
        buf[4 + PGNO_SIZE..].copy_from_slice(&self.max.to_ne_bytes());
        buf
    }

    fn decode(buf: &[u8; FREEZER_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        let mut free = [0u8; PGNO_SIZE];
        let mut max = [0u8; PGNO_SIZE];
        magic.copy_from_slice(&buf[..4]);
        free.copy_from_slice(&buf[4..4 + PGNO_SIZE]);
        max.copy_from_slice(&buf[4 + PGNO_SIZE..]);
        FreezerHeader {
            magic: u32::from_ne_bytes(magic),
            free: Pgno::from_ne_bytes(free),
            max: Pgno::from_ne_bytes(max),
        }
    }
}

/// What happened to the file when a slot was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotRelease {
    /// The slot was pushed on the free list.
    Pushed,
    /// The file was shrunk to `max` slots.
    Truncated { max: Pgno },
    /// Every slot is free. The caller removes the file.
    Emptied,
}

/// A free list link rewritten by compaction.
struct Relink {
    slot: Pgno,
    next: Pgno,
    old_next: Pgno,
}

/// An open freezer file.
pub(crate) struct FreezerFile<F> {
    file: F,
    page_size: u32,
    sync: bool,
    header: FreezerHeader,
}

impl<F> FreezerFile<F>
where
    F: ReadAt + WriteAt + Truncate + Syncer,
{
    /// Initializes an empty freezer file.
    pub(crate) fn create(file: F, page_size: u32, sync: bool) -> Result<Self> {
        let mut this = FreezerFile {
            file,
            page_size,
            sync,
            header: FreezerHeader::empty(),
        };
        this.write_header(FreezerHeader::empty())?;
        Ok(this)
    }

    /// Opens an initialized freezer file, validating its header.
    pub(crate) fn open(file: F, page_size: u32, sync: bool) -> Result<Self> {
        let mut buf = [0u8; FREEZER_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let header = FreezerHeader::decode(&buf);
        if header.magic != FREEZER_MAGIC {
            error!(
                "Freezer file has bad magic number {:#x}, expect {:#x}",
                header.magic, FREEZER_MAGIC
            );
            return Err(Error::Corrupted);
        }
        if header.free > header.max {
            error!(
                "Freezer file free list head {} beyond max slot {}",
                header.free, header.max
            );
            return Err(Error::Corrupted);
        }
        Ok(FreezerFile {
            file,
            page_size,
            sync,
            header,
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> FreezerHeader {
        self.header
    }

    #[inline]
    pub(crate) fn max(&self) -> Pgno {
        self.header.max
    }

    /// Allocates a slot, reusing the head of the free list if there is one.
    pub(crate) fn alloc(&mut self) -> Result<Pgno> {
        let header = self.header;
        if header.free != 0 {
            let next = self.read_link(header.free)?;
            if next > header.max {
                error!(
                    "Freezer free slot {} links to {next} beyond max slot {}",
                    header.free, header.max
                );
                return Err(Error::Corrupted);
            }
            self.write_header(FreezerHeader { free: next, ..header })?;
            trace!("Reuse freezer slot {}", header.free);
            return Ok(header.free);
        }
        let pgno = header.max.checked_add(1).ok_or(Error::OutOfMemory)?;
        self.write_header(FreezerHeader { max: pgno, ..header })?;
        trace!("Extend freezer file to slot {pgno}");
        Ok(pgno)
    }

    /// Writes a page image to an allocated slot.
    pub(crate) fn write_slot(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        self.check_slot(pgno)?;
        if data.len() != self.page_size as usize {
            return Err(Error::InvalidArgument);
        }
        self.file.write_all_at(data, self.slot_offset(pgno))?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Reads a page image from an allocated slot.
    pub(crate) fn read_slot(&self, pgno: Pgno, buf: &mut [u8]) -> Result<()> {
        self.check_slot(pgno)?;
        if buf.len() != self.page_size as usize {
            return Err(Error::InvalidArgument);
        }
        self.file.read_exact_at(buf, self.slot_offset(pgno))?;
        Ok(())
    }

    /// Releases a slot.
    ///
    /// Releasing the highest slot tries to peel the contiguous run of free
    /// slots off the end of the file. Any other slot is pushed on the head of
    /// the free list.
    pub(crate) fn release(&mut self, pgno: Pgno) -> Result<SlotRelease> {
        self.check_slot(pgno)?;
        if pgno == self.header.max {
            if let Some(release) = self.compact(pgno)? {
                return Ok(release);
            }
        }
        self.push(pgno)?;
        Ok(SlotRelease::Pushed)
    }

    /// Pushes a slot on the head of the free list.
    pub(crate) fn push(&mut self, pgno: Pgno) -> Result<()> {
        self.check_slot(pgno)?;
        let header = self.header;
        self.write_link(pgno, header.free)?;
        self.write_header(FreezerHeader {
            free: pgno,
            ..header
        })?;
        trace!("Push freezer slot {pgno} on the free list");
        Ok(())
    }

    fn compact(&mut self, pgno: Pgno) -> Result<Option<SlotRelease>> {
        let old = self.free_list()?;
        if old.contains(&pgno) {
            error!("Freezer slot {pgno} released twice");
            return Err(Error::Corrupted);
        }
        let mut free = old.clone();
        free.push(pgno);
        free.sort_unstable();

        let mut start = free.len() - 1;
        while start > 0 && free[start - 1] + 1 == free[start] {
            start -= 1;
        }
        let max = free[start] - 1;
        if max == 0 {
            return Ok(Some(SlotRelease::Emptied));
        }
        if !self.file.supports_truncate() {
            return Ok(None);
        }

        // Keep the free slots below the new end in their current order, so
        // only links that skip over a dropped slot change.
        let kept = old
            .iter()
            .enumerate()
            .filter(|&(_, &slot)| slot <= max)
            .map(|(i, &slot)| (slot, old.get(i + 1).copied().unwrap_or(0)))
            .collect::<Vec<_>>();
        let mut relinks = Vec::new();
        for (i, &(slot, old_next)) in kept.iter().enumerate() {
            let next = kept.get(i + 1).map_or(0, |&(next, _)| next);
            if next != old_next {
                relinks.push(Relink {
                    slot,
                    next,
                    old_next,
                });
            }
        }
        for (i, relink) in relinks.iter().enumerate() {
            if let Err(err) = self.write_link(relink.slot, relink.next) {
                self.undo_relinks(&relinks[..=i])?;
                return Err(err);
            }
        }

        // The header write commits the compaction.
        let header = FreezerHeader {
            magic: FREEZER_MAGIC,
            free: kept.first().map_or(0, |&(slot, _)| slot),
            max,
        };
        if let Err(err) = self.file.write_all_at(&header.encode(), 0) {
            self.undo_relinks(&relinks)?;
            return Err(err.into());
        }
        self.header = header;
        if self.sync {
            if let Err(err) = self.file.sync_data() {
                warn!("Sync freezer file truncated to {max} slots: {err}");
            }
        }
        // Slots past `max` are never read again.
        if let Err(err) = self.file.set_len(self.slot_offset(max + 1)) {
            warn!("Truncate freezer file to {max} slots: {err}");
        }
        trace!("Truncate freezer file to {max} slots");
        Ok(Some(SlotRelease::Truncated { max }))
    }

    /// Walks the free list.
    pub(crate) fn free_list(&self) -> Result<Vec<Pgno>> {
        let mut seen = SlotBitmap::new(self.header.max);
        self.walk_free_list(&mut seen)
    }

    /// Checks that every slot is either in `in_use` or on the free list,
    /// exactly once.
    pub(crate) fn check_slots(&self, in_use: &[Pgno]) -> Result<()> {
        let mut seen = SlotBitmap::new(self.header.max);
        self.walk_free_list(&mut seen)?;
        for &pgno in in_use {
            if !seen.set(pgno) {
                error!("Freezer slot {pgno} is in use twice, free, or beyond the file");
                return Err(Error::Corrupted);
            }
        }
        if let Some(pgno) = seen.first_unset() {
            error!("Freezer slot {pgno} is neither in use nor free");
            return Err(Error::Corrupted);
        }
        Ok(())
    }

    fn walk_free_list(&self, seen: &mut SlotBitmap) -> Result<Vec<Pgno>> {
        let mut list = Vec::new();
        let mut next = self.header.free;
        while next != 0 {
            if !seen.set(next) {
                error!("Freezer free list revisits or overruns at slot {next}");
                return Err(Error::Corrupted);
            }
            list.push(next);
            next = self.read_link(next)?;
        }
        Ok(list)
    }

    fn check_slot(&self, pgno: Pgno) -> Result<()> {
        if pgno == 0 || pgno > self.header.max {
            error!(
                "Freezer slot {pgno} out of range, max slot {}",
                self.header.max
            );
            return Err(Error::Corrupted);
        }
        Ok(())
    }

    fn read_link(&self, pgno: Pgno) -> Result<Pgno> {
        let mut buf = [0u8; PGNO_SIZE];
        self.file.read_exact_at(&mut buf, self.slot_offset(pgno))?;
        Ok(Pgno::from_ne_bytes(buf))
    }

    fn write_link(&self, pgno: Pgno, next: Pgno) -> Result<()> {
        self.file
            .write_all_at(&next.to_ne_bytes(), self.slot_offset(pgno))?;
        Ok(())
    }

    fn write_header(&mut self, header: FreezerHeader) -> Result<()> {
        self.file.write_all_at(&header.encode(), 0)?;
        if self.sync {
            self.file.sync_data()?;
        }
        self.header = header;
        Ok(())
    }

    /// Puts back the free list links a failed compaction rewrote.
    fn undo_relinks(&self, relinks: &[Relink]) -> Result<()> {
        for relink in relinks.iter().rev() {
            if let Err(err) = self.write_link(relink.slot, relink.old_next) {
                error!(
                    "Restore free link of freezer slot {} to {}: {err}",
                    relink.slot, relink.old_next
                );
                return Err(Error::Corrupted);
            }
        }
        Ok(())
    }

    #[inline]
    fn slot_offset(&self, pgno: Pgno) -> u64 {
        FREEZER_HEADER_SIZE as u64 + (pgno as u64 - 1) * self.page_size as u64
    }
}

/// The facade of the freezer files of one cache.
///
/// It hides where the files live and how they are named.
pub(crate) struct FreezerFiles<E: Env> {
    env: E,
    base: PathBuf,
    cache_id: u32,
    custom_flags: i32,
    sync: bool,
    stats: Arc<AtomicFreezerStats>,
}

impl<E: Env> FreezerFiles<E> {
    pub(crate) fn new(
        env: E,
        base: impl Into<PathBuf>,
        cache_id: u32,
        custom_flags: i32,
        sync: bool,
        stats: Arc<AtomicFreezerStats>,
    ) -> Self {
        FreezerFiles {
            env,
            base: base.into(),
            cache_id,
            custom_flags,
            sync,
            stats,
        }
    }

    pub(crate) fn path(&self, bucket: u32, page_size: u32) -> PathBuf {
        self.base
            .join(freezer_file_name(self.cache_id, bucket, page_size))
    }

    /// Opens the freezer file of a bucket, creating it if absent.
    pub(crate) fn open_or_create(
        &self,
        bucket: u32,
        page_size: u32,
    ) -> Result<FreezerFile<E::PositionalFile>> {
        let path = self.path(bucket, page_size);
        let file = self.env.open_positional_file(
            &path,
            OpenOptions {
                custom_flags: self.custom_flags,
                create: true,
            },
        )?;
        let len = self.env.metadata(&path)?.len;
        if len == 0 {
            info!("Create freezer file {}", path.display());
            self.stats.files_created.inc();
            return FreezerFile::create(file, page_size, self.sync);
        }
        if len < FREEZER_HEADER_SIZE as u64 {
            error!(
                "Freezer file {} is too short: {len} bytes",
                path.display()
            );
            return Err(Error::Corrupted);
        }
        FreezerFile::open(file, page_size, self.sync)
    }

    /// Opens the freezer file of a bucket that must already exist.
    pub(crate) fn open(&self, bucket: u32, page_size: u32) -> Result<FreezerFile<E::PositionalFile>> {
        match self.try_open(bucket, page_size)? {
            Some(file) => Ok(file),
            None => {
                error!(
                    "Freezer file {} is missing",
                    self.path(bucket, page_size).display()
                );
                Err(Error::Corrupted)
            }
        }
    }

    /// Opens the freezer file of a bucket if it exists.
    pub(crate) fn try_open(
        &self,
        bucket: u32,
        page_size: u32,
    ) -> Result<Option<FreezerFile<E::PositionalFile>>> {
        let path = self.path(bucket, page_size);
        let opt = OpenOptions {
            custom_flags: self.custom_flags,
            create: false,
        };
        match self.env.open_positional_file(&path, opt) {
            Ok(file) => FreezerFile::open(file, page_size, self.sync).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn remove(&self, bucket: u32, page_size: u32) -> Result<()> {
        let path = self.path(bucket, page_size);
        self.env.remove_file(&path)?;
        info!("Remove freezer file {}", path.display());
        self.stats.files_removed.inc();
        Ok(())
    }

    /// Releases a slot of the bucket's freezer file.
    ///
    /// A file left with no slot in use is removed. If the removal fails the
    /// slot is pushed on the free list instead, so the file stays consistent.
    pub(crate) fn release(
        &self,
        file: &mut FreezerFile<E::PositionalFile>,
        bucket: u32,
        page_size: u32,
        pgno: Pgno,
    ) -> Result<SlotRelease> {
        match file.release(pgno)? {
            SlotRelease::Emptied => match self.remove(bucket, page_size) {
                Ok(()) => Ok(SlotRelease::Emptied),
                Err(err) => {
                    warn!(
                        "Remove empty freezer file {}: {err}",
                        self.path(bucket, page_size).display()
                    );
                    file.push(pgno)?;
                    Ok(SlotRelease::Pushed)
                }
            },
            SlotRelease::Truncated { max } => {
                self.stats.files_truncated.inc();
                Ok(SlotRelease::Truncated { max })
            }
            SlotRelease::Pushed => Ok(SlotRelease::Pushed),
        }
    }

    /// Removes a freezer file if it exists, ignoring failures.
    pub(crate) fn remove_quietly(&self, path: &Path) {
        match self.env.remove_file(path) {
            Ok(()) => {
                info!("Remove freezer file {}", path.display());
                self.stats.files_removed.inc();
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Remove freezer file {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use quickcheck::QuickCheck;
    use tempfile::tempdir;

    use super::*;
    use crate::env::{faulty::Faulty, Std};

    const PAGE_SIZE: u32 = 1024;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE as usize]
    }

    #[test]
    fn freezer_file_name_format() {
        assert_eq!(freezer_file_name(0, 3, 4096), "__db.freezer.0.3.4K");
        assert_eq!(freezer_file_name(2, 17, 65536), "__db.freezer.2.17.64K");
    }

    #[test]
    fn header_encoding() {
        let header = FreezerHeader {
            magic: FREEZER_MAGIC,
            free: 7,
            max: 9,
        };
        let buf = header.encode();
        assert_eq!(&buf[..4], &FREEZER_MAGIC.to_ne_bytes());
        assert_eq!(FreezerHeader::decode(&buf), header);
    }

    #[test]
    fn create_alloc_and_read_back() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(3, PAGE_SIZE).unwrap();
        assert_eq!(file.header(), FreezerHeader::empty());

        let a = file.alloc().unwrap();
        let b = file.alloc().unwrap();
        assert_eq!((a, b), (1, 2));
        file.write_slot(a, &page(0xa)).unwrap();
        file.write_slot(b, &page(0xb)).unwrap();
        drop(file);

        let file = files.open(3, PAGE_SIZE).unwrap();
        assert_eq!(file.max(), 2);
        let mut buf = page(0);
        file.read_slot(b, &mut buf).unwrap();
        assert_eq!(buf, page(0xb));
        assert!(matches!(file.read_slot(3, &mut buf), Err(Error::Corrupted)));
        file.check_slots(&[1, 2]).unwrap();
    }

    #[test]
    fn release_middle_slot_pushes_free_list() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..3 {
            let pgno = file.alloc().unwrap();
            file.write_slot(pgno, &page(pgno as u8)).unwrap();
        }
        assert_eq!(file.release(1).unwrap(), SlotRelease::Pushed);
        assert_eq!(file.release(2).unwrap(), SlotRelease::Pushed);
        assert_eq!(file.free_list().unwrap(), vec![2, 1]);
        assert_eq!(file.max(), 3);
        file.check_slots(&[3]).unwrap();

        // The free list is reused head first.
        assert_eq!(file.alloc().unwrap(), 2);
        assert_eq!(file.free_list().unwrap(), vec![1]);
        file.check_slots(&[2, 3]).unwrap();
    }

    #[test]
    fn release_last_slot_truncates() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..5 {
            let pgno = file.alloc().unwrap();
            file.write_slot(pgno, &page(pgno as u8)).unwrap();
        }
        file.release(4).unwrap();
        file.release(2).unwrap();
        assert_eq!(file.release(5).unwrap(), SlotRelease::Truncated { max: 3 });
        assert_eq!(file.max(), 3);
        assert_eq!(file.free_list().unwrap(), vec![2]);
        file.check_slots(&[1, 3]).unwrap();

        let len = Std.metadata(files.path(0, PAGE_SIZE)).unwrap().len;
        assert_eq!(len, FREEZER_HEADER_SIZE as u64 + 3 * PAGE_SIZE as u64);

        file.release(1).unwrap();
        assert_eq!(file.release(3).unwrap(), SlotRelease::Emptied);
    }

    #[test]
    fn release_last_slot_without_truncate_pushes() {
        let dir = tempdir().unwrap();
        let env = Faulty::new();
        env.disable_truncate(true);
        let files = FreezerFiles::new(env, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..3 {
            let pgno = file.alloc().unwrap();
            file.write_slot(pgno, &page(1)).unwrap();
        }
        file.release(2).unwrap();
        assert_eq!(file.release(3).unwrap(), SlotRelease::Pushed);
        assert_eq!(file.max(), 3);
        assert_eq!(file.free_list().unwrap(), vec![3, 2]);

        // Emptying the file does not need truncation.
        assert_eq!(file.release(1).unwrap(), SlotRelease::Pushed);
        file.check_slots(&[]).unwrap();
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        std::fs::write(files.path(1, PAGE_SIZE), [0u8; 64]).unwrap();
        assert!(matches!(
            files.open_or_create(1, PAGE_SIZE),
            Err(Error::Corrupted)
        ));
        assert!(matches!(files.open(1, PAGE_SIZE), Err(Error::Corrupted)));
        std::fs::write(files.path(1, PAGE_SIZE), [0u8; 5]).unwrap();
        assert!(matches!(
            files.open_or_create(1, PAGE_SIZE),
            Err(Error::Corrupted)
        ));
    }

    #[test]
    fn missing_file() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        assert!(files.try_open(5, PAGE_SIZE).unwrap().is_none());
        assert!(matches!(files.open(5, PAGE_SIZE), Err(Error::Corrupted)));
    }

    #[test]
    fn check_slots_detects_leaks_and_double_use() {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..3 {
            file.alloc().unwrap();
        }
        file.release(1).unwrap();
        assert!(matches!(file.check_slots(&[2]), Err(Error::Corrupted)));
        assert!(matches!(file.check_slots(&[1, 2, 3]), Err(Error::Corrupted)));
        assert!(matches!(file.check_slots(&[2, 3, 3]), Err(Error::Corrupted)));
        file.check_slots(&[3, 2]).unwrap();
    }

    #[test]
    fn failed_header_write_keeps_state() {
        let dir = tempdir().unwrap();
        let env = Faulty::new();
        let files = FreezerFiles::new(env.clone(), dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        file.alloc().unwrap();
        env.fail_writes_after(0);
        assert!(matches!(file.alloc(), Err(Error::Io(_))));
        assert_eq!(file.max(), 1);
        env.heal();
        assert_eq!(file.alloc().unwrap(), 2);
    }

    /// Allocates 6 slots and frees 2, 5 and 3, leaving the free list out of
    /// slot order.
    fn unordered_free_list<E: Env>(files: &FreezerFiles<E>) -> FreezerFile<E::PositionalFile> {
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..6 {
            let pgno = file.alloc().unwrap();
            file.write_slot(pgno, &page(pgno as u8)).unwrap();
        }
        for pgno in [2, 5, 3] {
            assert_eq!(file.release(pgno).unwrap(), SlotRelease::Pushed);
        }
        assert_eq!(file.free_list().unwrap(), vec![3, 5, 2]);
        file
    }

    #[test]
    fn failed_compaction_keeps_free_list() {
        // The first write relinks slot 3 past slot 5, the second one commits
        // the header.
        for writes in 0..2 {
            let dir = tempdir().unwrap();
            let env = Faulty::new();
            let files = FreezerFiles::new(env.clone(), dir.path(), 0, 0, false, Arc::default());
            let mut file = unordered_free_list(&files);

            env.fail_one_write_after(writes);
            assert!(matches!(file.release(6), Err(Error::Io(_))));
            assert_eq!(file.max(), 6);
            assert_eq!(file.free_list().unwrap(), vec![3, 5, 2]);
            file.check_slots(&[1, 4, 6]).unwrap();
            drop(file);

            // The file on disk is intact as well.
            let mut file = files.open(0, PAGE_SIZE).unwrap();
            assert_eq!(file.free_list().unwrap(), vec![3, 5, 2]);
            assert_eq!(file.release(6).unwrap(), SlotRelease::Truncated { max: 4 });
            assert_eq!(file.free_list().unwrap(), vec![3, 2]);
            file.check_slots(&[1, 4]).unwrap();
        }
    }

    #[test]
    fn failed_compaction_rollback_is_corruption() {
        let dir = tempdir().unwrap();
        let env = Faulty::new();
        let files = FreezerFiles::new(env.clone(), dir.path(), 0, 0, false, Arc::default());
        let mut file = unordered_free_list(&files);

        env.fail_writes_after(1);
        assert!(matches!(file.release(6), Err(Error::Corrupted)));
    }

    #[test]
    fn failed_truncate_still_compacts() {
        let dir = tempdir().unwrap();
        let env = Faulty::new();
        let files = FreezerFiles::new(env.clone(), dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        for _ in 0..3 {
            let pgno = file.alloc().unwrap();
            file.write_slot(pgno, &page(pgno as u8)).unwrap();
        }
        file.release(2).unwrap();

        env.fail_truncate(true);
        assert_eq!(file.release(3).unwrap(), SlotRelease::Truncated { max: 1 });
        assert_eq!(file.max(), 1);
        assert!(file.free_list().unwrap().is_empty());
        file.check_slots(&[1]).unwrap();
        let len = env.metadata(files.path(0, PAGE_SIZE)).unwrap().len;
        assert_eq!(len, FREEZER_HEADER_SIZE as u64 + 3 * PAGE_SIZE as u64);

        // The stale tail is overwritten by the next allocation.
        env.heal();
        drop(file);
        let mut file = files.open(0, PAGE_SIZE).unwrap();
        assert_eq!(file.alloc().unwrap(), 2);
        file.write_slot(2, &page(0x22)).unwrap();
        let mut buf = page(0);
        file.read_slot(2, &mut buf).unwrap();
        assert_eq!(buf, page(0x22));
        file.check_slots(&[1, 2]).unwrap();
    }

    fn apply_ops(ops: Vec<(bool, u8)>) -> bool {
        let dir = tempdir().unwrap();
        let files = FreezerFiles::new(Std, dir.path(), 0, 0, false, Arc::default());
        let mut file = files.open_or_create(0, PAGE_SIZE).unwrap();
        let mut in_use = BTreeSet::new();
        for (alloc, pick) in ops {
            if alloc || in_use.is_empty() {
                let pgno = file.alloc().unwrap();
                if !in_use.insert(pgno) {
                    return false;
                }
            } else {
                let pgno = *in_use.iter().nth(pick as usize % in_use.len()).unwrap();
                in_use.remove(&pgno);
                match file.release(pgno).unwrap() {
                    SlotRelease::Emptied => {
                        if !in_use.is_empty() {
                            return false;
                        }
                        drop(file);
                        files.remove(0, PAGE_SIZE).unwrap();
                        file = files.open_or_create(0, PAGE_SIZE).unwrap();
                    }
                    SlotRelease::Truncated { max } => {
                        if in_use.iter().next_back() != Some(&max) {
                            return false;
                        }
                    }
                    SlotRelease::Pushed => {}
                }
            }
            let slots: Vec<Pgno> = in_use.iter().copied().collect();
            if file.check_slots(&slots).is_err() {
                return false;
            }
        }
        true
    }

    #[test]
    fn slot_invariant_holds() {
        QuickCheck::new()
            .tests(50)
            .quickcheck(apply_ops as fn(Vec<(bool, u8)>) -> bool);
    }
}
