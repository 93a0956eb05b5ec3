//! Provides `PrioBitmap`, a bit array structure supporting constant-time
//! highest-bit scan operations.
use core::fmt;

use super::Init;

/// The maximum bit count supported by [`PrioBitmap`].
pub const PRIO_BITMAP_MAX_LEN: usize = u64::BITS as usize;

/// A bit array with up to [`PRIO_BITMAP_MAX_LEN`] entries, answering "which is
/// the highest set bit" in constant time.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u64,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIO_BITMAP_MAX_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.bits & (1 << i) != 0
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.bits &= !(1 << i);
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_MAX_LEN);
        self.bits |= 1 << i;
    }

    /// Get the position of the highest set bit.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some((u64::BITS - 1 - self.bits.leading_zeros()) as usize)
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}
