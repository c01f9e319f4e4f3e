//! sdio-disk - SDIO card controller
//!
//! Brings up a 4-bit SDIO bus with DMA-backed block transfers and exposes
//! the card as a byte-addressed block device.
//!
//! Transfers are synchronous: the controller starts a DMA transfer and then
//! busy-polls the host for completion. Only a data timeout is retried, and
//! only a bounded number of times; every other status ends the transfer.

mod hal;
pub mod status;
pub mod transfer;

pub use hal::*;
use status::SdStatusRegister;
use transfer::{Direction, ReadRequest, TransferEngine, TransferOutcome, WriteRequest};

use super::{BlockAddress, BlockCount, BlockDevice, BLOCK_SIZE};
use crate::session::CardSlot;

use core::convert::TryFrom;
use embedded_hal::digital::v2::InputPin;
#[cfg(feature = "log")]
use log::{debug, info, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, trace, warn};

/// Upper bound on completion polls for one transfer.
pub const MAX_POLL_ATTEMPTS: u8 = 255;

/// The alternate function that routes the bus pins to the SDIO peripheral.
pub const SDIO_ALTERNATE_FUNCTION: u8 = 12;

/// All four priority bits select the preemption level.
const PREEMPTION_BITS: u8 = 4;

/// Lifecycle of the card slot.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardState {
    /// No card in the slot, or not yet checked
    Absent,
    /// Bus and DMA are up; transfers may be issued
    Ready,
    /// A transfer is in flight
    Busy,
    /// Torn down by `stop()` or by a failed `start()`
    Stopped,
}

/// The bring-up step that failed, with the status the hardware reported.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Bus initialisation and card identification
    Bus(SdError),
    /// Switching to the wide bus
    WideBus(SdError),
    /// Reading back the SD Status register
    CardStatus(SdError),
    /// Configuring one of the DMA streams
    DmaStream(Direction, HalError),
}

/// Which half of a transfer failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    /// The host refused to start the transfer
    Start,
    /// The transfer started but did not complete
    Finish,
}

/// The possible errors `CardController` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The presence detect line says the slot is empty
    CardNotInserted,
    /// Bus or DMA bring-up failed
    Init(InitError),
    /// Can't perform this operation with the card in this state
    NotReady(CardState),
    /// Only the card's native block size is supported
    UnsupportedBlockSize(u32),
    /// The buffer cannot hold the requested blocks. `required` is in bytes.
    BufferTooSmall { required: u64, actual: usize },
    /// The request runs past the end of the card. `end` is one past the
    /// last block requested.
    OutOfRange { end: u64, capacity: BlockCount },
    /// A block transfer failed
    Transfer {
        direction: Direction,
        phase: TransferPhase,
        status: SdError,
    },
}

impl Error {
    /// The card host status behind this error, if there is one.
    pub fn status(&self) -> Option<SdError> {
        match *self {
            Error::Init(InitError::Bus(status))
            | Error::Init(InitError::WideBus(status))
            | Error::Init(InitError::CardStatus(status))
            | Error::Transfer { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl From<InitError> for Error {
    fn from(e: InitError) -> Self {
        Error::Init(e)
    }
}

/// Options for starting the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardConfig {
    /// Divisor between the peripheral kernel clock and the bus clock
    pub clock_div: u32,
    /// Bus width to negotiate once the card is identified
    pub bus_width: BusWidth,
    /// Stall the bus clock while the FIFO is full or empty, instead of
    /// flagging an overrun or underrun
    pub hardware_flow_control: bool,
    /// Priority of the bus interrupt. The DMA interrupts sit one
    /// preemption level below it.
    pub irq_priority: InterruptPriority,
    /// The detect switch pulls the line low when a card is present
    pub detect_active_low: bool,
    /// Alternate function number of the bus pins
    pub alternate_function: u8,
}

impl Default for CardConfig {
    fn default() -> Self {
        CardConfig {
            clock_div: 0,
            bus_width: BusWidth::Four,
            hardware_flow_control: true,
            irq_priority: InterruptPriority::new(5, 0),
            detect_active_low: true,
            alternate_function: SDIO_ALTERNATE_FUNCTION,
        }
    }
}

bitflags::bitflags! {
    /// Bring-up steps currently in effect, torn down in reverse.
    struct Applied: u8 {
        const PINS = 1 << 0;
        const BUS_CLOCK = 1 << 1;
        const BUS = 1 << 2;
        const SDIO_IRQ = 1 << 3;
        const DMA_RX = 1 << 4;
        const DMA_TX = 1 << 5;
        const DMA_IRQS = 1 << 6;
    }
}

/// Drives an SD card over an SDIO bus with one DMA stream per direction.
///
/// Built from the bus peripheral, the inbound and outbound DMA streams, the
/// card detect input, the two pin groups carrying the bus, and the
/// interrupt controller.
pub struct CardController<HOST, DMA, DET, PORT, IRQ>
where
    HOST: SdioHost,
    DMA: DmaStream,
    DET: InputPin,
    PORT: PinPort,
    IRQ: InterruptController,
{
    host: HOST,
    engine: TransferEngine<DMA>,
    detect: DET,
    ports: [PORT; 2],
    irq: IRQ,
    config: CardConfig,
    state: CardState,
    applied: Applied,
    info: Option<CardInfo>,
    status: Option<SdStatusRegister>,
    retries: u8,
}

impl<HOST, DMA, DET, PORT, IRQ> CardController<HOST, DMA, DET, PORT, IRQ>
where
    HOST: SdioHost,
    DMA: DmaStream,
    DET: InputPin,
    PORT: PinPort,
    IRQ: InterruptController,
{
    /// Create a controller. No hardware is touched until `start()`.
    pub fn new(host: HOST, rx: DMA, tx: DMA, detect: DET, ports: [PORT; 2], irq: IRQ) -> Self {
        CardController {
            host,
            engine: TransferEngine::new(rx, tx),
            detect,
            ports,
            irq,
            config: CardConfig::default(),
            state: CardState::Absent,
            applied: Applied::empty(),
            info: None,
            status: None,
            retries: 0,
        }
    }

    /// Is there a card in the slot? Only reads the detect line.
    pub fn is_card_inserted(&self) -> bool {
        self.card_present(self.config.detect_active_low)
    }

    fn card_present(&self, active_low: bool) -> bool {
        let level = if active_low {
            self.detect.is_low()
        } else {
            self.detect.is_high()
        };
        level.unwrap_or(false)
    }

    /// Park both pin groups as outputs driven high.
    pub fn clear_port(&mut self) {
        for port in self.ports.iter_mut() {
            port.set_mode(PinMode::OutputPushPull);
            port.set_high();
        }
    }

    /// Bring up the bus with the default options and the given clock
    /// divisor.
    pub fn start(&mut self, clock_div: u32) -> Result<(), Error> {
        self.start_with_config(CardConfig {
            clock_div,
            ..self.config
        })
    }

    /// Bring up the bus, identify the card, switch to the wide bus and
    /// configure both DMA streams and their interrupts.
    ///
    /// If any step fails, the steps already applied are undone before the
    /// error is returned.
    pub fn start_with_config(&mut self, config: CardConfig) -> Result<(), Error> {
        // The detect line is read with the polarity being applied.
        if self.card_present(config.detect_active_low) {
            debug!("starting card with config: {:?}", config);
        } else {
            warn!("SD card is not inserted");
            if !self.applied.is_empty() {
                self.teardown();
            }
            self.config = config;
            self.state = CardState::Absent;
            return Err(Error::CardNotInserted);
        }
        if !self.applied.is_empty() {
            debug!("card already started, restarting");
            self.teardown();
        }
        self.config = config;

        match self.bring_up() {
            Ok(()) => {
                self.state = CardState::Ready;
                self.log_card();
                Ok(())
            }
            Err(e) => {
                warn!("Can not start SD card: {:?}", e);
                self.teardown();
                self.state = CardState::Stopped;
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), Error> {
        let af = self.config.alternate_function;
        for port in self.ports.iter_mut() {
            port.set_mode(PinMode::AlternatePushPull);
            port.set_speed(PinSpeed::VeryHigh);
            port.set_alternate(af);
        }
        self.applied.insert(Applied::PINS);

        self.host.enable_clock();
        self.applied.insert(Applied::BUS_CLOCK);

        // Identification always runs on a single data line.
        let bus = BusConfig {
            rising_edge: true,
            clock_bypass: false,
            power_save: false,
            bus_width: BusWidth::One,
            hardware_flow_control: self.config.hardware_flow_control,
            clock_div: self.config.clock_div,
        };
        self.applied.insert(Applied::BUS);
        let info = self.host.init(&bus).map_err(InitError::Bus)?;

        if self.config.bus_width != BusWidth::One {
            self.host
                .configure_wide_bus(self.config.bus_width)
                .map_err(InitError::WideBus)?;
        }

        let status = self.host.read_status().map_err(InitError::CardStatus)?;

        let priority = self.config.irq_priority;
        self.irq.set_priority(InterruptLine::Sdio, priority);
        self.irq.enable(InterruptLine::Sdio);
        self.applied.insert(Applied::SDIO_IRQ);

        self.engine
            .init_stream(Direction::Read)
            .map_err(|e| InitError::DmaStream(Direction::Read, e))?;
        self.applied.insert(Applied::DMA_RX);

        self.engine
            .init_stream(Direction::Write)
            .map_err(|e| InitError::DmaStream(Direction::Write, e))?;
        self.applied.insert(Applied::DMA_TX);

        self.irq.set_priority_grouping(PREEMPTION_BITS);
        self.irq.set_priority(InterruptLine::DmaRx, priority.below());
        self.irq.enable(InterruptLine::DmaRx);
        self.irq.set_priority(InterruptLine::DmaTx, priority.below());
        self.irq.enable(InterruptLine::DmaTx);
        self.applied.insert(Applied::DMA_IRQS);

        self.info = Some(info);
        self.status = Some(status);
        Ok(())
    }

    fn log_card(&self) {
        if let (Some(info), Some(status)) = (self.info, self.status) {
            info!(
                "Card successfully initialized: type = {:?}, capacity = {} MiB, block size = {}, bus width = {}, SD card type = {}, speed class = {}, irq priority = {},{}",
                info.card_type,
                info.capacity / 1024 / 1024,
                info.block_size,
                status.dat_bus_width(),
                status.sd_card_type(),
                status.speed_class(),
                self.config.irq_priority.preemption,
                self.config.irq_priority.sub
            );
        }
    }

    /// Disable the interrupts, release both DMA streams, power down the bus
    /// and disable its clock. Calling it again does nothing.
    pub fn stop(&mut self) {
        if !self.applied.is_empty() {
            debug!("stopping card");
            self.teardown();
        }
        self.state = CardState::Stopped;
    }

    fn teardown(&mut self) {
        if self.applied.contains(Applied::DMA_IRQS) {
            self.irq.disable(InterruptLine::DmaTx);
            self.irq.disable(InterruptLine::DmaRx);
        }
        if self.applied.contains(Applied::DMA_TX) {
            self.engine.deinit_stream(Direction::Write);
        }
        if self.applied.contains(Applied::DMA_RX) {
            self.engine.deinit_stream(Direction::Read);
        }
        if self.applied.contains(Applied::SDIO_IRQ) {
            self.irq.disable(InterruptLine::Sdio);
        }
        if self.applied.contains(Applied::BUS) {
            self.host.deinit();
        }
        if self.applied.contains(Applied::BUS_CLOCK) {
            self.host.disable_clock();
        }
        if self.applied.contains(Applied::PINS) {
            self.clear_port();
        }
        self.applied = Applied::empty();
        self.info = None;
        self.status = None;
    }

    /// Read `block_count` blocks of `block_size` bytes starting at
    /// `address` into `buffer`. `address` is truncated down to a block
    /// boundary.
    pub fn read_blocks(
        &mut self,
        buffer: &mut [u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Error> {
        let (address, len) = match self.prepare(buffer.len(), address, block_size, block_count)? {
            Some(span) => span,
            None => return Ok(()),
        };
        let mut request = ReadRequest {
            buffer: &mut buffer[..len],
            address,
            block_size,
            block_count,
        };

        self.state = CardState::Busy;
        let result = match self.engine.start_read(&mut self.host, &mut request) {
            Ok(()) => {
                let engine = &mut self.engine;
                let host = &mut self.host;
                let (result, retries) = complete(|| engine.poll_read(host, &mut request));
                self.retries = retries;
                result.map_err(|status| {
                    warn!("Error at reading blocks (operation finish): {:?}", status);
                    Error::Transfer {
                        direction: Direction::Read,
                        phase: TransferPhase::Finish,
                        status,
                    }
                })
            }
            Err(status) => {
                warn!("Error at reading blocks (operation start): {:?}", status);
                Err(Error::Transfer {
                    direction: Direction::Read,
                    phase: TransferPhase::Start,
                    status,
                })
            }
        };
        self.state = CardState::Ready;
        result
    }

    /// Write `block_count` blocks of `block_size` bytes from `buffer`
    /// starting at `address`. `address` is truncated down to a block
    /// boundary.
    pub fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Error> {
        let (address, len) = match self.prepare(buffer.len(), address, block_size, block_count)? {
            Some(span) => span,
            None => return Ok(()),
        };
        let request = WriteRequest {
            buffer: &buffer[..len],
            address,
            block_size,
            block_count,
        };

        self.state = CardState::Busy;
        let result = match self.engine.start_write(&mut self.host, &request) {
            Ok(()) => {
                let engine = &mut self.engine;
                let host = &mut self.host;
                let (result, retries) = complete(|| engine.poll_write(host, &request));
                self.retries = retries;
                result.map_err(|status| {
                    warn!("Error at writing blocks (operation finish): {:?}", status);
                    Error::Transfer {
                        direction: Direction::Write,
                        phase: TransferPhase::Finish,
                        status,
                    }
                })
            }
            Err(status) => {
                warn!("Error at writing blocks (operation start): {:?}", status);
                Err(Error::Transfer {
                    direction: Direction::Write,
                    phase: TransferPhase::Start,
                    status,
                })
            }
        };
        self.state = CardState::Ready;
        result
    }

    /// Check a transfer request against the controller state and the card.
    ///
    /// Returns the block-aligned start address and the number of buffer
    /// bytes the transfer covers, or `None` when there is nothing to
    /// transfer.
    fn prepare(
        &mut self,
        buffer_len: usize,
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<Option<(BlockAddress, usize)>, Error> {
        if self.state != CardState::Ready {
            return Err(Error::NotReady(self.state));
        }
        if block_size != BLOCK_SIZE {
            return Err(Error::UnsupportedBlockSize(block_size));
        }
        // Sizes are compared in 64 bits; `usize` may be 32 bits wide.
        let required = BlockCount(block_count).bytes(block_size);
        let len = match usize::try_from(required) {
            Ok(len) if len <= buffer_len => len,
            _ => {
                return Err(Error::BufferTooSmall {
                    required,
                    actual: buffer_len,
                })
            }
        };
        if block_count == 0 {
            return Ok(None);
        }
        if !self.is_card_inserted() {
            warn!("SD card removed");
            self.stop();
            self.state = CardState::Absent;
            return Err(Error::CardNotInserted);
        }

        let address = BlockAddress::from_bytes(address.bytes(), block_size);
        let capacity = self.capacity();
        let end = address.bytes() / u64::from(block_size) + u64::from(block_count);
        if end > u64::from(capacity.0) {
            return Err(Error::OutOfRange { end, capacity });
        }
        Ok(Some((address, len)))
    }

    fn capacity(&self) -> BlockCount {
        self.info
            .map(|info| BlockCount::from_bytes(info.capacity, BLOCK_SIZE))
            .unwrap_or(BlockCount(0))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CardState {
        self.state
    }

    /// Parameters negotiated by the last successful `start()`.
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.info.as_ref()
    }

    /// The SD Status register read back by the last successful `start()`.
    pub fn card_status(&self) -> Option<&SdStatusRegister> {
        self.status.as_ref()
    }

    /// The options in effect.
    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// The DMA streams and their configuration.
    pub fn engine(&self) -> &TransferEngine<DMA> {
        &self.engine
    }

    /// How many data-timeout retries the last completed transfer consumed.
    pub fn last_retries(&self) -> u8 {
        self.retries
    }
}

/// Poll until the transfer succeeds or fails for good, retrying a data
/// timeout until `MAX_POLL_ATTEMPTS` polls have been made.
///
/// Returns the final status and the number of retries consumed.
fn complete<F>(mut poll: F) -> (Result<(), SdError>, u8)
where
    F: FnMut() -> TransferOutcome,
{
    let mut retries: u8 = 0;
    loop {
        match poll() {
            TransferOutcome::Success => return (Ok(()), retries),
            TransferOutcome::TerminalError(status) => return (Err(status), retries),
            TransferOutcome::TransientTimeout => {
                if retries >= MAX_POLL_ATTEMPTS - 1 {
                    return (Err(SdError::DataTimeout), retries);
                }
                retries += 1;
                trace!("data timeout, polling again (retry {})", retries);
            }
        }
    }
}

impl<HOST, DMA, DET, PORT, IRQ> BlockDevice for CardController<HOST, DMA, DET, PORT, IRQ>
where
    HOST: SdioHost,
    DMA: DmaStream,
    DET: InputPin,
    PORT: PinPort,
    IRQ: InterruptController,
{
    type Error = Error;

    fn read_blocks(
        &mut self,
        buffer: &mut [u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        CardController::read_blocks(self, buffer, address, block_size, block_count)
    }

    fn write_blocks(
        &mut self,
        buffer: &[u8],
        address: BlockAddress,
        block_size: u32,
        block_count: u32,
    ) -> Result<(), Self::Error> {
        CardController::write_blocks(self, buffer, address, block_size, block_count)
    }

    /// Determine how many blocks this card can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        match self.state {
            CardState::Ready | CardState::Busy => Ok(self.capacity()),
            state => Err(Error::NotReady(state)),
        }
    }
}

impl<HOST, DMA, DET, PORT, IRQ> CardSlot for CardController<HOST, DMA, DET, PORT, IRQ>
where
    HOST: SdioHost,
    DMA: DmaStream,
    DET: InputPin,
    PORT: PinPort,
    IRQ: InterruptController,
{
    fn is_card_inserted(&self) -> bool {
        CardController::is_card_inserted(self)
    }

    fn start(&mut self, clock_div: u32) -> Result<(), Self::Error> {
        CardController::start(self, clock_div)
    }

    fn stop(&mut self) {
        CardController::stop(self)
    }
}
