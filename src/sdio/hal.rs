//! sdio-disk - Hardware collaborators
//!
//! The card controller never touches registers itself. Board support code
//! provides the bus peripheral, the DMA streams, the pin ports and the
//! interrupt controller through the traits below.

use super::status::SdStatusRegister;
use super::transfer::{DmaConfig, ReadRequest, WriteRequest};

/// Status codes the card host reports for a failed operation. Success is
/// carried by `Ok(())` and has no variant here.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdError {
    /// Command response received, but the CRC check failed
    CmdCrcFail,
    /// Data block sent or received, but the CRC check failed
    DataCrcFail,
    /// No command response within the command timeout
    CmdResponseTimeout,
    /// The data transfer did not complete within the polling window
    DataTimeout,
    /// Transmit FIFO underrun
    TxUnderrun,
    /// Receive FIFO overrun
    RxOverrun,
    /// Start bit not detected on all data signals in wide bus mode
    StartBitError,
    /// Command argument was out of range
    CmdOutOfRange,
    /// Misaligned address
    AddressMisaligned,
    /// Transferred block length is not allowed for the card
    BlockLengthError,
    /// An error in the sequence of erase commands occurred
    EraseSequenceError,
    /// An invalid selection of write-blocks for erase occurred
    BadEraseParameter,
    /// Attempt to program a write protected block
    WriteProtectViolation,
    /// Sequence or password error in the lock/unlock card command
    LockUnlockFailed,
    /// CRC check of the previous command failed
    ComCrcFailed,
    /// Command is not legal for the card state
    IllegalCommand,
    /// Card internal ECC was applied but failed to correct the data
    CardEccFailed,
    /// Internal card controller error
    CardControllerError,
    /// General or unknown error
    GeneralUnknownError,
    /// The card could not sustain data transfer in stream read mode
    StreamReadUnderrun,
    /// The card could not sustain data programming in stream mode
    StreamWriteOverrun,
    /// CID/CSD overwrite error
    CidCsdOverwrite,
    /// Only part of the address space was erased
    WriteProtectEraseSkip,
    /// Command executed without using the internal ECC
    CardEccDisabled,
    /// Erase sequence was cleared before executing
    EraseReset,
    /// Error in the sequence of authentication
    AkeSequenceError,
    /// The card does not support the supplied voltage range
    InvalidVoltageRange,
    /// The address is beyond the card's capacity
    AddressOutOfRange,
    /// The card refused to switch function
    SwitchError,
    /// Internal host error
    InternalError,
    /// The host has not been configured
    NotConfigured,
    /// A request is still pending
    RequestPending,
    /// The request is not applicable in the current state
    RequestNotApplicable,
    /// An invalid parameter was passed to the host
    InvalidParameter,
    /// The feature is not supported by the card
    UnsupportedFeature,
    /// The host hardware does not support the operation
    UnsupportedHardware,
    /// Unclassified host error
    Error,
    /// A status code this driver does not know about. Hosts should build
    /// errors through [`SdError::from_code`]; a known code wrapped in
    /// `Other` is folded back by [`SdError::normalized`].
    Other(u8),
}

impl SdError {
    /// The numeric status code, as the host reports it. Success is code 0.
    pub fn code(self) -> u8 {
        match self {
            SdError::CmdCrcFail => 1,
            SdError::DataCrcFail => 2,
            SdError::CmdResponseTimeout => 3,
            SdError::DataTimeout => 4,
            SdError::TxUnderrun => 5,
            SdError::RxOverrun => 6,
            SdError::StartBitError => 7,
            SdError::CmdOutOfRange => 8,
            SdError::AddressMisaligned => 9,
            SdError::BlockLengthError => 10,
            SdError::EraseSequenceError => 11,
            SdError::BadEraseParameter => 12,
            SdError::WriteProtectViolation => 13,
            SdError::LockUnlockFailed => 14,
            SdError::ComCrcFailed => 15,
            SdError::IllegalCommand => 16,
            SdError::CardEccFailed => 17,
            SdError::CardControllerError => 18,
            SdError::GeneralUnknownError => 19,
            SdError::StreamReadUnderrun => 20,
            SdError::StreamWriteOverrun => 21,
            SdError::CidCsdOverwrite => 22,
            SdError::WriteProtectEraseSkip => 23,
            SdError::CardEccDisabled => 24,
            SdError::EraseReset => 25,
            SdError::AkeSequenceError => 26,
            SdError::InvalidVoltageRange => 27,
            SdError::AddressOutOfRange => 28,
            SdError::SwitchError => 29,
            SdError::InternalError => 34,
            SdError::NotConfigured => 35,
            SdError::RequestPending => 36,
            SdError::RequestNotApplicable => 37,
            SdError::InvalidParameter => 38,
            SdError::UnsupportedFeature => 39,
            SdError::UnsupportedHardware => 40,
            SdError::Error => 41,
            SdError::Other(code) => code,
        }
    }

    /// The same status with a known code wrapped in `Other` decoded to
    /// its own variant.
    pub fn normalized(self) -> SdError {
        match self {
            SdError::Other(code) => SdError::from_code(code).unwrap_or(self),
            known => known,
        }
    }

    /// Decode a raw status code. Returns `None` for the success code.
    pub fn from_code(code: u8) -> Option<SdError> {
        let error = match code {
            0 => return None,
            1 => SdError::CmdCrcFail,
            2 => SdError::DataCrcFail,
            3 => SdError::CmdResponseTimeout,
            4 => SdError::DataTimeout,
            5 => SdError::TxUnderrun,
            6 => SdError::RxOverrun,
            7 => SdError::StartBitError,
            8 => SdError::CmdOutOfRange,
            9 => SdError::AddressMisaligned,
            10 => SdError::BlockLengthError,
            11 => SdError::EraseSequenceError,
            12 => SdError::BadEraseParameter,
            13 => SdError::WriteProtectViolation,
            14 => SdError::LockUnlockFailed,
            15 => SdError::ComCrcFailed,
            16 => SdError::IllegalCommand,
            17 => SdError::CardEccFailed,
            18 => SdError::CardControllerError,
            19 => SdError::GeneralUnknownError,
            20 => SdError::StreamReadUnderrun,
            21 => SdError::StreamWriteOverrun,
            22 => SdError::CidCsdOverwrite,
            23 => SdError::WriteProtectEraseSkip,
            24 => SdError::CardEccDisabled,
            25 => SdError::EraseReset,
            26 => SdError::AkeSequenceError,
            27 => SdError::InvalidVoltageRange,
            28 => SdError::AddressOutOfRange,
            29 => SdError::SwitchError,
            34 => SdError::InternalError,
            35 => SdError::NotConfigured,
            36 => SdError::RequestPending,
            37 => SdError::RequestNotApplicable,
            38 => SdError::InvalidParameter,
            39 => SdError::UnsupportedFeature,
            40 => SdError::UnsupportedHardware,
            41 => SdError::Error,
            other => SdError::Other(other),
        };
        Some(error)
    }
}

/// Status codes from the generic peripheral layer (DMA streams).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HalError {
    Error,
    Busy,
    Timeout,
}

impl HalError {
    pub fn code(self) -> u8 {
        match self {
            HalError::Error => 1,
            HalError::Busy => 2,
            HalError::Timeout => 3,
        }
    }
}

/// Number of data lines used per bus clock.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl BusWidth {
    pub fn lines(self) -> u8 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

/// Bus peripheral settings for the identification phase.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Sample on the rising clock edge
    pub rising_edge: bool,
    /// Feed the bus clock straight from the kernel clock
    pub clock_bypass: bool,
    /// Gate the bus clock while idle
    pub power_save: bool,
    /// Width used for identification. Cards always start on one line.
    pub bus_width: BusWidth,
    /// Stop the bus clock when the FIFO cannot keep up
    pub hardware_flow_control: bool,
    /// Divisor applied to the kernel clock
    pub clock_div: u32,
}

/// The kinds of card the host can identify.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// Standard capacity, physical layer 1.x
    Sd1,
    /// Standard capacity, physical layer 2.0
    Sd2,
    /// High or extended capacity (SDHC/SDXC)
    Sdhc,
    Mmc,
    Sdio,
    HighSpeedMmc,
    SdioCombo,
    HighCapacityMmc,
}

/// What the host learned about the card during identification.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub card_type: CardType,
    /// Usable capacity in bytes
    pub capacity: u64,
    /// Native block size in bytes
    pub block_size: u32,
    /// Relative card address
    pub rca: u16,
}

/// The bus peripheral of an SDIO card host.
///
/// Transfers are started against one of the DMA streams owned by the
/// transfer engine and then polled for completion. The request buffer must
/// stay untouched between the start call and the final poll.
pub trait SdioHost {
    /// Enable the peripheral clock.
    fn enable_clock(&mut self);
    /// Disable the peripheral clock.
    fn disable_clock(&mut self);
    /// Power up the bus and identify the card.
    fn init(&mut self, config: &BusConfig) -> Result<CardInfo, SdError>;
    /// Switch the card and the host to a wider data bus.
    fn configure_wide_bus(&mut self, width: BusWidth) -> Result<(), SdError>;
    /// Read the SD Status register.
    fn read_status(&mut self) -> Result<SdStatusRegister, SdError>;
    /// Power down the bus.
    fn deinit(&mut self);
    /// Issue a DMA read.
    fn start_read<D: DmaStream>(
        &mut self,
        dma: &mut D,
        request: &mut ReadRequest<'_>,
    ) -> Result<(), SdError>;
    /// Wait up to `timeout_ms` for an issued read to complete.
    fn poll_read<D: DmaStream>(
        &mut self,
        dma: &mut D,
        request: &mut ReadRequest<'_>,
        timeout_ms: u32,
    ) -> Result<(), SdError>;
    /// Issue a DMA write.
    fn start_write<D: DmaStream>(
        &mut self,
        dma: &mut D,
        request: &WriteRequest<'_>,
    ) -> Result<(), SdError>;
    /// Wait up to `timeout_ms` for an issued write to complete.
    fn poll_write<D: DmaStream>(
        &mut self,
        dma: &mut D,
        request: &WriteRequest<'_>,
        timeout_ms: u32,
    ) -> Result<(), SdError>;
}

/// One stream of a DMA controller.
pub trait DmaStream {
    /// Enable the clock of the DMA controller this stream belongs to.
    fn enable_controller_clock(&mut self);
    /// Configure the stream.
    fn init(&mut self, config: &DmaConfig) -> Result<(), HalError>;
    /// Return the stream to its reset configuration.
    fn deinit(&mut self);
}

/// Electrical mode of a group of pins.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PinMode {
    Input,
    OutputPushPull,
    AlternatePushPull,
    Analog,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PinSpeed {
    Low,
    Medium,
    High,
    VeryHigh,
}

/// A group of pins on one port, configured together.
pub trait PinPort {
    fn set_mode(&mut self, mode: PinMode);
    /// Route the pins to an alternate (peripheral) function.
    fn set_alternate(&mut self, function: u8);
    fn set_speed(&mut self, speed: PinSpeed);
    /// Drive all pins of the group high.
    fn set_high(&mut self);
}

/// Interrupt lines raised by the card host.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptLine {
    /// The bus peripheral
    Sdio,
    /// The inbound DMA stream
    DmaRx,
    /// The outbound DMA stream
    DmaTx,
}

/// A (preemption, sub-priority) pair. Lower numbers preempt higher ones.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InterruptPriority {
    pub preemption: u8,
    pub sub: u8,
}

impl InterruptPriority {
    pub const fn new(preemption: u8, sub: u8) -> InterruptPriority {
        InterruptPriority { preemption, sub }
    }

    /// The priority one preemption level below this one.
    pub fn below(self) -> InterruptPriority {
        InterruptPriority {
            preemption: self.preemption.saturating_add(1),
            sub: self.sub,
        }
    }
}

/// The platform's interrupt controller.
pub trait InterruptController {
    /// Split the priority bits into preemption and sub-priority bits.
    fn set_priority_grouping(&mut self, preemption_bits: u8);
    fn set_priority(&mut self, line: InterruptLine, priority: InterruptPriority);
    fn enable(&mut self, line: InterruptLine);
    fn disable(&mut self, line: InterruptLine);
}
