//! sdio-disk - Block Device support
//!
//! Generic code for handling block devices.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which moves whole blocks between a
/// memory buffer and a byte address on the device. Only supports devices
/// whose sector count fits in 32 bits (<= 2 TiB with 512 byte blocks).
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read `block_count` blocks of `block_size` bytes, starting at `address`,
    /// into `buffer`.
    fn read_blocks(
        &mut self,
        buffer: &mut [u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error>;
    /// Write `block_count` blocks of `block_size` bytes from `buffer`,
    /// starting at `address`.
    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_blocks(
        &mut self,
        buffer: &mut [u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        (*self).read_blocks(buffer, address, block_size, block_count)
    }

    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        (*self).write_blocks(buffer, address, block_size, block_count)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// The errors a `MemoryBlockDevice` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request runs past the end of the backing memory
    OutOfRange,
    /// The caller's buffer cannot hold the requested blocks
    BufferTooSmall,
}

/// A block device backed by a slice of RAM.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn span(
        &self,
        buffer_len: usize,
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(usize, usize), MemoryError> {
        let len = BlockCount(block_count).bytes(block_size);
        if (buffer_len as u64) < len {
            return Err(MemoryError::BufferTooSmall);
        }
        let end = address
            .bytes()
            .checked_add(len)
            .filter(|end| *end <= self.memory.len() as u64)
            .ok_or(MemoryError::OutOfRange)?;
        // Both bounds are now within `memory`, so they fit a usize.
        Ok((address.bytes() as usize, end as usize))
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read_blocks(
        &mut self,
        buffer: &mut [u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.span(buffer.len(), address, block_size, block_count)?;
        buffer[..end - start].copy_from_slice(&self.memory[start..end]);
        Ok(())
    }

    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.span(buffer.len(), address, block_size, block_count)?;
        self.memory[start..end].copy_from_slice(&buffer[..end - start]);
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount::from_bytes(self.memory.len() as u64, BLOCK_SIZE))
    }
}
