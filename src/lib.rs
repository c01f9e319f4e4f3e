//! # sdio-disk
//!
//! > A DMA-backed SDIO card driver for Embedded Rust
//!
//! This crate drives an SD card over a 4-bit SDIO bus, moving block data
//! through two DMA streams, and exposes the card as the disk interface a FAT
//! filesystem driver expects. It is `#![no_std]` and does not use `alloc`.
//!
//! ## Using the crate
//!
//! You will need implementations of the peripheral traits in [`sdio`]: the
//! SDIO host, two DMA streams, the pin ports and the interrupt controller,
//! plus an `InputPin` wired to the card-detect switch. The filesystem itself
//! comes from anything that implements [`session::FatFs`].
//!
//! ```rust,ignore
//! let mut card = sdio_disk::CardController::new(host, dma_rx, dma_tx, detect, ports, nvic);
//! let mut session = sdio_disk::Session::new(card, fatfs);
//! match session.open_append(0, "log.txt") {
//!     Ok(mut file) => {
//!         session.write(&mut file, b"hello\n").unwrap();
//!         session.close(file).unwrap();
//!     }
//!     Err(e) => writeln!(uart, "Err: {:?} ({:?})", e, e.code()).unwrap(),
//! }
//! session.list_files(&mut uart).unwrap();
//! session.stop();
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `refcell-blockdevice`: Implement `BlockDevice` for `RefCell`s holding one.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]


#[macro_use]
mod structure;

pub mod block_device;
pub mod diskio;
pub mod sdio;
pub mod session;

pub use crate::block_device::{
    BlockAddress, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice, MemoryError, BLOCK_SIZE,
};
pub use crate::diskio::{DiskError, DiskIo, DiskStatus, IoctlCommand, SdDisk};
pub use crate::sdio::{CardConfig, CardController, CardState, Error as SdioError};
pub use crate::session::{CardSlot, FatFs, FsError, MountContext, Session, SessionError};
