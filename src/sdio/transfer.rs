//! sdio-disk - Transfer engine
//!
//! Owns the two DMA streams that move block data between memory and the
//! card host, one per direction, and drives a single transfer through the
//! host's start/poll primitives.

use super::hal::{DmaStream, HalError, SdError, SdioHost};
use crate::BlockAddress;

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// How long one completion poll may wait, in milliseconds.
pub const TRANSFER_TIMEOUT_MS: u32 = 100;

/// The direction of a block transfer, seen from the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Card to memory
    Read,
    /// Memory to card
    Write,
}

/// One block transfer: `block_count` blocks of `block_size` bytes between
/// `buffer` and the card, starting at `address`.
#[derive(Debug)]
pub struct TransferRequest<B> {
    pub buffer: B,
    pub address: BlockAddress,
    pub block_size: u32,
    pub block_count: u32,
}

/// An inbound transfer. The DMA stream fills `buffer`.
pub type ReadRequest<'a> = TransferRequest<&'a mut [u8]>;

/// An outbound transfer. The DMA stream drains `buffer`.
pub type WriteRequest<'a> = TransferRequest<&'a [u8]>;

impl<B> TransferRequest<B> {
    /// Number of bytes the request moves. Computed in 64 bits, as it can
    /// exceed a 32-bit `usize`.
    pub fn len(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The result of one completion poll.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every requested byte has been moved
    Success,
    /// The polling window closed with the data still in flight
    TransientTimeout,
    /// The host reported a fault; polling again will not help
    TerminalError(SdError),
}

impl From<Result<(), SdError>> for TransferOutcome {
    fn from(result: Result<(), SdError>) -> Self {
        match result.map_err(SdError::normalized) {
            Ok(()) => TransferOutcome::Success,
            Err(SdError::DataTimeout) => TransferOutcome::TransientTimeout,
            Err(e) => TransferOutcome::TerminalError(e),
        }
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    PeripheralToMemory,
    MemoryToPeripheral,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataAlignment {
    Byte,
    HalfWord,
    Word,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaMode {
    Normal,
    Circular,
    /// The peripheral decides when the transfer ends
    PeripheralFlowControl,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaPriority {
    Low,
    Medium,
    High,
    VeryHigh,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FifoThreshold {
    Quarter,
    Half,
    ThreeQuarters,
    Full,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Burst {
    Single,
    Incr4,
    Incr8,
    Incr16,
}

/// Configuration of one DMA stream.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    /// Request channel the stream listens to
    pub channel: u8,
    pub direction: DmaDirection,
    pub peripheral_increment: bool,
    pub memory_increment: bool,
    pub peripheral_alignment: DataAlignment,
    pub memory_alignment: DataAlignment,
    pub mode: DmaMode,
    pub priority: DmaPriority,
    pub fifo: bool,
    pub fifo_threshold: FifoThreshold,
    pub memory_burst: Burst,
    pub peripheral_burst: Burst,
}

impl DmaConfig {
    /// The SDIO request channel.
    pub const SDIO_CHANNEL: u8 = 4;

    /// Stream settings for SDIO block transfers in the given direction.
    ///
    /// Both directions share everything but the direction: word accesses on
    /// both sides, an incrementing memory pointer against the fixed data
    /// FIFO register, 4-beat bursts through a full-threshold FIFO, and the
    /// host controlling the transfer length.
    pub fn sdio(direction: Direction) -> DmaConfig {
        DmaConfig {
            channel: Self::SDIO_CHANNEL,
            direction: match direction {
                Direction::Read => DmaDirection::PeripheralToMemory,
                Direction::Write => DmaDirection::MemoryToPeripheral,
            },
            peripheral_increment: false,
            memory_increment: true,
            peripheral_alignment: DataAlignment::Word,
            memory_alignment: DataAlignment::Word,
            mode: DmaMode::PeripheralFlowControl,
            priority: DmaPriority::Low,
            fifo: true,
            fifo_threshold: FifoThreshold::Full,
            memory_burst: Burst::Incr4,
            peripheral_burst: Burst::Incr4,
        }
    }
}

/// The pair of DMA streams serving the card host.
pub struct TransferEngine<DMA>
where
    DMA: DmaStream,
{
    rx: DMA,
    tx: DMA,
    rx_config: DmaConfig,
    tx_config: DmaConfig,
}

impl<DMA> TransferEngine<DMA>
where
    DMA: DmaStream,
{
    /// Take ownership of the inbound and outbound streams.
    pub fn new(rx: DMA, tx: DMA) -> Self {
        TransferEngine {
            rx,
            tx,
            rx_config: DmaConfig::sdio(Direction::Read),
            tx_config: DmaConfig::sdio(Direction::Write),
        }
    }

    /// The configuration applied to the stream for `direction`.
    pub fn config(&self, direction: Direction) -> &DmaConfig {
        match direction {
            Direction::Read => &self.rx_config,
            Direction::Write => &self.tx_config,
        }
    }

    /// Configure the stream for `direction`.
    pub(crate) fn init_stream(&mut self, direction: Direction) -> Result<(), HalError> {
        match direction {
            Direction::Read => {
                self.rx.enable_controller_clock();
                self.rx.init(&self.rx_config)
            }
            Direction::Write => {
                self.tx.enable_controller_clock();
                self.tx.init(&self.tx_config)
            }
        }
    }

    /// Return the stream for `direction` to its reset configuration.
    pub(crate) fn deinit_stream(&mut self, direction: Direction) {
        match direction {
            Direction::Read => self.rx.deinit(),
            Direction::Write => self.tx.deinit(),
        }
    }

    /// Issue an inbound transfer on the host.
    pub(crate) fn start_read<H>(
        &mut self,
        host: &mut H,
        request: &mut ReadRequest<'_>,
    ) -> Result<(), SdError>
    where
        H: SdioHost,
    {
        trace!(
            "DMA read of {} x {} bytes at {}",
            request.block_count,
            request.block_size,
            request.address.bytes()
        );
        host.start_read(&mut self.rx, request)
    }

    /// Wait one polling window for an inbound transfer to finish.
    pub(crate) fn poll_read<H>(
        &mut self,
        host: &mut H,
        request: &mut ReadRequest<'_>,
    ) -> TransferOutcome
    where
        H: SdioHost,
    {
        host.poll_read(&mut self.rx, request, TRANSFER_TIMEOUT_MS)
            .into()
    }

    /// Issue an outbound transfer on the host.
    pub(crate) fn start_write<H>(
        &mut self,
        host: &mut H,
        request: &WriteRequest<'_>,
    ) -> Result<(), SdError>
    where
        H: SdioHost,
    {
        trace!(
            "DMA write of {} x {} bytes at {}",
            request.block_count,
            request.block_size,
            request.address.bytes()
        );
        host.start_write(&mut self.tx, request)
    }

    /// Wait one polling window for an outbound transfer to finish.
    pub(crate) fn poll_write<H>(&mut self, host: &mut H, request: &WriteRequest<'_>) -> TransferOutcome
    where
        H: SdioHost,
    {
        host.poll_write(&mut self.tx, request, TRANSFER_TIMEOUT_MS)
            .into()
    }

    /// Give back the streams.
    pub fn release(self) -> (DMA, DMA) {
        (self.rx, self.tx)
    }
}
