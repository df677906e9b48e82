/// A fixed size bitmap over the slots `1..=cap` of a freezer file.
///
/// Slot 0 is reserved in the freezer file format, so bit `i - 1` stands for
/// slot `i`.
#[derive(Clone)]
pub(crate) struct SlotBitmap {
    cap: u32,
    len: u32,
    bits: Vec<u64>,
}

impl SlotBitmap {
    pub(crate) fn new(cap: u32) -> Self {
        let size = match cap % 64 {
            0 => cap / 64,
            _ => cap / 64 + 1,
        };
        SlotBitmap {
            cap,
            len: 0,
            bits: vec![0u64; size as usize],
        }
    }

    /// Marks `slot` as accounted for.
    ///
    /// Returns false if the slot is out of range or was already set.
    pub(crate) fn set(&mut self, slot: u32) -> bool {
        if slot == 0 || slot > self.cap {
            return false;
        }
        let (key, bit) = (key(slot), bit(slot));
        let old_w = self.bits[key];
        let new_w = old_w | 1 << bit;
        self.bits[key] = new_w;
        if old_w == new_w {
            return false;
        }
        self.len += 1;
        true
    }

    /// Test whether `slot` is set.
    pub(crate) fn test(&self, slot: u32) -> bool {
        if slot == 0 || slot > self.cap {
            return false;
        }
        self.bits[key(slot)] & (1 << bit(slot)) != 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len == self.cap
    }

    /// Returns the smallest slot that is not set.
    pub(crate) fn first_unset(&self) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        (1..=self.cap).find(|&slot| !self.test(slot))
    }
}

#[inline]
fn key(slot: u32) -> usize {
    (slot - 1) as usize / 64
}

#[inline]
fn bit(slot: u32) -> usize {
    (slot - 1) as usize % 64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bitmap_accounting() {
        let mut bitmap = SlotBitmap::new(130);
        assert!(!bitmap.set(0));
        assert!(!bitmap.set(131));
        for slot in 1..=130 {
            assert_eq!(bitmap.first_unset(), Some(slot));
            assert!(bitmap.set(slot));
            assert!(!bitmap.set(slot));
        }
        assert!(bitmap.is_full());
        assert!(bitmap.test(64));
        assert!(bitmap.test(65));
        assert_eq!(bitmap.first_unset(), None);
    }

    #[test]
    fn empty_slot_bitmap() {
        let bitmap = SlotBitmap::new(0);
        assert!(bitmap.is_full());
        assert_eq!(bitmap.first_unset(), None);
    }
}
