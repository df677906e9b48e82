use crate::util::atomic::Counter;

/// Statistics of freeze and thaw.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct FreezerStats {
    /// Live versions frozen.
    pub frozen: u64,
    /// Frozen versions thawed into a live buffer.
    pub thawed: u64,
    /// Obsolete frozen versions discarded.
    pub discarded: u64,
    /// Freezes that returned an error.
    pub freeze_failed: u64,
    /// Thaws that returned an error.
    pub thaw_failed: u64,
    /// Frozen headers carved out of the region.
    pub headers_carved: u64,
    /// Freezer files created.
    pub files_created: u64,
    /// Freezer files removed once empty.
    pub files_removed: u64,
    /// Freezer files truncated after their last slot was released.
    pub files_truncated: u64,
}

impl FreezerStats {
    /// Returns the counts accumulated since `o` was taken.
    pub fn sub(&self, o: &FreezerStats) -> FreezerStats {
        FreezerStats {
            frozen: self.frozen - o.frozen,
            thawed: self.thawed - o.thawed,
            discarded: self.discarded - o.discarded,
            freeze_failed: self.freeze_failed - o.freeze_failed,
            thaw_failed: self.thaw_failed - o.thaw_failed,
            headers_carved: self.headers_carved - o.headers_carved,
            files_created: self.files_created - o.files_created,
            files_removed: self.files_removed - o.files_removed,
            files_truncated: self.files_truncated - o.files_truncated,
        }
    }
}

#[derive(Default)]
pub(crate) struct AtomicFreezerStats {
    pub(crate) frozen: Counter,
    pub(crate) thawed: Counter,
    pub(crate) discarded: Counter,
    pub(crate) freeze_failed: Counter,
    pub(crate) thaw_failed: Counter,
    pub(crate) headers_carved: Counter,
    pub(crate) files_created: Counter,
    pub(crate) files_removed: Counter,
    pub(crate) files_truncated: Counter,
}

impl AtomicFreezerStats {
    pub(crate) fn snapshot(&self) -> FreezerStats {
        FreezerStats {
            frozen: self.frozen.get(),
            thawed: self.thawed.get(),
            discarded: self.discarded.get(),
            freeze_failed: self.freeze_failed.get(),
            thaw_failed: self.thaw_failed.get(),
            headers_carved: self.headers_carved.get(),
            files_created: self.files_created.get(),
            files_removed: self.files_removed.get(),
            files_truncated: self.files_truncated.get(),
        }
    }
}
