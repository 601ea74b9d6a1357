//! Channel bit pool.
//!
//! Every queue the container listens to is bound to one bit of a 32-bit
//! mask. The two top bits are reserved for the system and command queues;
//! the rest are handed out to ports and the satellite response queue.

/// Bit of the system (service registry) queue.
pub const SYSTEM_Q_BIT: u32 = 0x8000_0000;

/// Bit of the command queue.
pub const CMD_BIT: u32 = 0x4000_0000;

/// Bits that are never handed out by the pool.
pub const RESERVED_BITS: u32 = SYSTEM_Q_BIT | CMD_BIT;

/// Allocator over the free bits of the container's channel mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMaskPool {
    available: u32,
}

impl Default for BitMaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BitMaskPool {
    /// Pool with every non-reserved bit free.
    pub fn new() -> Self {
        Self {
            available: !RESERVED_BITS,
        }
    }

    /// Pool restricted to `mask`. Reserved bits are always removed.
    pub fn with_available(mask: u32) -> Self {
        Self {
            available: mask & !RESERVED_BITS,
        }
    }

    /// Hands out the lowest free bit, or `None` when the pool is exhausted.
    pub fn request(&mut self) -> Option<u32> {
        if self.available == 0 {
            return None;
        }
        let bit = self.available & self.available.wrapping_neg();
        self.available &= !bit;
        Some(bit)
    }

    /// Returns `bit` to the pool.
    ///
    /// Returns `false` (and changes nothing) when `bit` is not a single bit,
    /// is reserved, or is already free.
    pub fn release(&mut self, bit: u32) -> bool {
        if bit.count_ones() != 1 || bit & RESERVED_BITS != 0 || self.available & bit != 0 {
            return false;
        }
        self.available |= bit;
        true
    }

    /// Mask of currently free bits.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Returns `true` if `bit` is currently free.
    #[inline]
    pub fn is_available(&self, bit: u32) -> bool {
        self.available & bit == bit
    }

    /// Number of free bits.
    #[inline]
    pub fn count_available(&self) -> u32 {
        self.available.count_ones()
    }
}

/// Position of a single-bit mask, used in diagnostic names.
#[inline]
pub fn bit_index(bit: u32) -> u32 {
    bit.trailing_zeros()
}
