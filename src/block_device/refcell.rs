use crate::{BlockAddress, BlockDevice};

use super::BlockCount;

impl<T> BlockDevice for core::cell::RefCell<T>
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
        self.get_mut()
            .read_blocks(buffer, address, block_size, block_count)
    }

    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        self.get_mut()
            .write_blocks(buffer, address, block_size, block_count)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.get_mut().num_blocks()
    }
}

impl<T> BlockDevice for &core::cell::RefCell<T>
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
        let mut underlying = self.borrow_mut();
        underlying.read_blocks(buffer, address, block_size, block_count)
    }

    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write_blocks(buffer, address, block_size, block_count)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.num_blocks()
    }
}
