//! sdio-disk - Disk I/O bridge
//!
//! The disk interface a FAT filesystem driver expects from its block
//! device, implemented on top of any [`BlockDevice`].

use core::convert::TryInto;

use crate::{BlockDevice, BlockIdx, BLOCK_SIZE};

#[cfg(feature = "log")]
use log::debug;

#[cfg(feature = "defmt-log")]
use defmt::debug;

bitflags::bitflags! {
    /// Drive status flags. An empty set means the drive is ready.
    pub struct DiskStatus: u8 {
        /// The drive has not been initialised
        const NOINIT = 0x01;
        /// No medium in the drive
        const NODISK = 0x02;
        /// The medium is write protected
        const PROTECT = 0x04;
    }
}

/// Why a disk operation failed. Success is `Ok(())`, result code 0.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// Hard error during the read or write
    Error,
    /// The medium is write protected
    WriteProtected,
    /// The drive is not ready
    NotReady,
    /// Invalid command or buffer
    ParameterError,
}

impl DiskError {
    /// The numeric result code handed to the filesystem driver.
    pub fn code(self) -> u8 {
        match self {
            DiskError::Error => 1,
            DiskError::WriteProtected => 2,
            DiskError::NotReady => 3,
            DiskError::ParameterError => 4,
        }
    }
}

/// The outcome of a disk operation.
pub type DiskResult = Result<(), DiskError>;

/// Result code of a disk operation, 0 for success.
pub fn result_code(result: DiskResult) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Control commands understood by `DiskIo::ioctl`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    /// Complete any pending write
    Sync,
    /// Number of sectors on the drive (32-bit)
    GetSectorCount,
    /// Size of one sector in bytes (16-bit)
    GetSectorSize,
    /// Erase block size in sectors (32-bit)
    GetBlockSize,
    Unknown(u8),
}

impl IoctlCommand {
    const SYNC: u8 = 0;
    const GET_SECTOR_COUNT: u8 = 1;
    const GET_SECTOR_SIZE: u8 = 2;
    const GET_BLOCK_SIZE: u8 = 3;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::SYNC => Self::Sync,
            Self::GET_SECTOR_COUNT => Self::GetSectorCount,
            Self::GET_SECTOR_SIZE => Self::GetSectorSize,
            Self::GET_BLOCK_SIZE => Self::GetBlockSize,
            _ => Self::Unknown(value),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Sync => Self::SYNC,
            Self::GetSectorCount => Self::GET_SECTOR_COUNT,
            Self::GetSectorSize => Self::GET_SECTOR_SIZE,
            Self::GetBlockSize => Self::GET_BLOCK_SIZE,
            Self::Unknown(value) => value,
        }
    }
}

/// A disk as seen by a FAT filesystem driver.
///
/// `unit` selects the physical drive; single-drive implementations ignore
/// it. Sectors are addressed by index and moved whole.
pub trait DiskIo {
    /// Prepare the drive for use.
    fn initialize(&mut self, unit: u8) -> DiskStatus;
    /// Report whether the drive is usable.
    fn status(&mut self, unit: u8) -> DiskStatus;
    /// Read `count` sectors starting at `sector` into `buffer`.
    fn read(&mut self, unit: u8, buffer: &mut [u8], sector: u32, count: u32) -> DiskResult;
    /// Write `count` sectors starting at `sector` from `buffer`.
    fn write(&mut self, unit: u8, buffer: &[u8], sector: u32, count: u32) -> DiskResult;
    /// Run a control command. Values are returned in native byte order at
    /// the start of `buffer`.
    fn ioctl(&mut self, unit: u8, command: IoctlCommand, buffer: &mut [u8]) -> DiskResult;
}

impl<T> DiskIo for &mut T
where
    T: DiskIo,
{
    fn initialize(&mut self, unit: u8) -> DiskStatus {
        (*self).initialize(unit)
    }

    fn status(&mut self, unit: u8) -> DiskStatus {
        (*self).status(unit)
    }

    fn read(&mut self, unit: u8, buffer: &mut [u8], sector: u32, count: u32) -> DiskResult {
        (*self).read(unit, buffer, sector, count)
    }

    fn write(&mut self, unit: u8, buffer: &[u8], sector: u32, count: u32) -> DiskResult {
        (*self).write(unit, buffer, sector, count)
    }

    fn ioctl(&mut self, unit: u8, command: IoctlCommand, buffer: &mut [u8]) -> DiskResult {
        (*self).ioctl(unit, command, buffer)
    }
}

/// Exposes a block device through `DiskIo`.
///
/// The drive always reports itself ready: whoever mounts it is expected to
/// have started the card first. Every transfer failure is reported as
/// `DiskError::Error`; the underlying status only reaches the log.
#[derive(Debug)]
pub struct SdDisk<BD>
where
    BD: BlockDevice,
{
    device: BD,
}

impl<BD> SdDisk<BD>
where
    BD: BlockDevice,
{
    pub fn new(device: BD) -> Self {
        SdDisk { device }
    }

    pub fn device(&mut self) -> &mut BD {
        &mut self.device
    }

    pub fn release(self) -> BD {
        self.device
    }
}

fn put_bytes(buffer: &mut [u8], bytes: &[u8]) -> DiskResult {
    buffer
        .get_mut(..bytes.len())
        .ok_or(DiskError::ParameterError)?
        .copy_from_slice(bytes);
    Ok(())
}

/// Decode a 32-bit ioctl result.
pub fn ioctl_u32(buffer: &[u8]) -> Option<u32> {
    buffer.get(..4)?.try_into().ok().map(u32::from_ne_bytes)
}

/// Decode a 16-bit ioctl result.
pub fn ioctl_u16(buffer: &[u8]) -> Option<u16> {
    buffer.get(..2)?.try_into().ok().map(u16::from_ne_bytes)
}

impl<BD> DiskIo for SdDisk<BD>
where
    BD: BlockDevice,
{
    fn initialize(&mut self, _unit: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn status(&mut self, _unit: u8) -> DiskStatus {
        DiskStatus::empty()
    }

    fn read(&mut self, _unit: u8, buffer: &mut [u8], sector: u32, count: u32) -> DiskResult {
        self.device
            .read_blocks(buffer, BlockIdx(sector).address(), BLOCK_SIZE, count)
            .map_err(|_e| {
                debug!("disk read of {} sectors at {} failed", count, sector);
                DiskError::Error
            })
    }

    fn write(&mut self, _unit: u8, buffer: &[u8], sector: u32, count: u32) -> DiskResult {
        self.device
            .write_blocks(buffer, BlockIdx(sector).address(), BLOCK_SIZE, count)
            .map_err(|_e| {
                debug!("disk write of {} sectors at {} failed", count, sector);
                DiskError::Error
            })
    }

    fn ioctl(&mut self, _unit: u8, command: IoctlCommand, buffer: &mut [u8]) -> DiskResult {
        match command {
            IoctlCommand::Sync => Ok(()),
            IoctlCommand::GetSectorCount => {
                let count = self.device.num_blocks().map_err(|_e| {
                    debug!("sector count unavailable");
                    DiskError::Error
                })?;
                put_bytes(buffer, &count.0.to_ne_bytes())
            }
            IoctlCommand::GetSectorSize => put_bytes(buffer, &(BLOCK_SIZE as u16).to_ne_bytes()),
            IoctlCommand::GetBlockSize => put_bytes(buffer, &BLOCK_SIZE.to_ne_bytes()),
            IoctlCommand::Unknown(_) => Err(DiskError::ParameterError),
        }
    }
}
