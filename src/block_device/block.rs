//! sdio-disk - Block addressing
//!
//! Sector indices, sector counts and the byte addresses the card host
//! actually consumes.

use core::convert::TryFrom;

/// The native sector size of an SDHC/SDXC card, in bytes.
pub const BLOCK_SIZE: u32 = 512;

/// The linear index of a block (sector) on the device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

/// A number of blocks (sectors).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

/// A 64-bit byte offset on the device.
///
/// The card host addresses data in bytes, but only ever at block
/// granularity, so every address built through this type is a multiple of
/// the block size it was built with.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockAddress(u64);

impl BlockIdx {
    /// The byte address of the first byte of this block.
    pub fn address(self) -> BlockAddress {
        BlockAddress(u64::from(self.0) * u64::from(BLOCK_SIZE))
    }
}

impl BlockCount {
    /// The number of whole blocks of `block_size` bytes in `bytes`.
    pub fn from_bytes(bytes: u64, block_size: u32) -> BlockCount {
        BlockCount((bytes / u64::from(block_size)) as u32)
    }

    /// The number of bytes covered by this many blocks of `block_size` bytes.
    pub fn bytes(self, block_size: u32) -> u64 {
        u64::from(self.0) * u64::from(block_size)
    }
}

impl BlockAddress {
    /// Build an address from a raw byte offset, truncated down to
    /// `block_size` granularity.
    ///
    /// A `block_size` of zero leaves the offset untouched.
    pub fn from_bytes(offset: u64, block_size: u32) -> BlockAddress {
        match u64::from(block_size) {
            0 => BlockAddress(offset),
            size => BlockAddress(offset - offset % size),
        }
    }

    /// The raw byte offset.
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// The block this address falls in, given `block_size` byte blocks.
    ///
    /// `None` if the index does not fit a [`BlockIdx`], or if `block_size`
    /// is zero.
    pub fn block(self, block_size: u32) -> Option<BlockIdx> {
        let idx = self.0.checked_div(u64::from(block_size))?;
        u32::try_from(idx).ok().map(BlockIdx)
    }
}

impl From<BlockIdx> for BlockAddress {
    fn from(idx: BlockIdx) -> BlockAddress {
        idx.address()
    }
}
