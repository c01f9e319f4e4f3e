//! A simulated board: an SDIO host backed by a sparse sector store, DMA
//! streams, pins and an interrupt controller that all record what they are
//! asked to do into one shared journal. Plus a tiny filesystem that speaks
//! `DiskIo`, good enough to mount and append to files.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::convert::{Infallible, TryInto};
use std::rc::Rc;

use embedded_hal::digital::v2::InputPin;
use sdio_disk::diskio::DiskIo;
use sdio_disk::sdio::status::SdStatusRegister;
use sdio_disk::sdio::transfer::{DmaConfig, ReadRequest, WriteRequest};
use sdio_disk::sdio::{
    BusConfig, BusWidth, CardInfo, CardType, DmaStream, HalError, InterruptController,
    InterruptLine, InterruptPriority, PinMode, PinPort, PinSpeed, SdError, SdioHost,
};
use sdio_disk::session::{
    Attributes, DirPath, DrivePath, FatFs, FileInfo, FsError, OpenMode, VolumeLabel,
};
use sdio_disk::CardController;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a fixed-capacity string, panicking if it does not fit.
pub fn hstr<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    out.push_str(s).expect("string too long");
    out
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stream {
    Rx,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DetectRead,
    PortMode(usize, PinMode),
    PortSpeed(usize, PinSpeed),
    PortAlternate(usize, u8),
    PortHigh(usize),
    HostClock(bool),
    HostInit(BusConfig),
    WideBus(BusWidth),
    ReadStatus,
    HostDeinit,
    StartRead { address: u64, blocks: u32 },
    StartWrite { address: u64, blocks: u32 },
    Poll { timeout_ms: u32 },
    DmaClock(Stream),
    DmaInit(Stream, DmaConfig),
    DmaDeinit(Stream),
    Grouping(u8),
    Priority(InterruptLine, InterruptPriority),
    IrqEnable(InterruptLine),
    IrqDisable(InterruptLine),
}

pub type Journal = Rc<RefCell<Vec<Event>>>;

/// The card and the faults the host will report.
#[derive(Default)]
pub struct SimCard {
    pub sectors: HashMap<u64, [u8; 512]>,
    pub capacity: u64,
    /// Statuses returned by successive completion polls. An empty queue
    /// means the transfer completes.
    pub polls: VecDeque<Result<(), SdError>>,
    pub fail_start: Option<SdError>,
    pub fail_init: Option<SdError>,
    pub fail_wide_bus: Option<SdError>,
    pub fail_dma_init: Option<(Stream, HalError)>,
}

impl SimCard {
    pub fn sector(&self, index: u64) -> [u8; 512] {
        self.sectors.get(&index).copied().unwrap_or([0u8; 512])
    }

    pub fn put(&mut self, index: u64, offset: usize, bytes: &[u8]) {
        let sector = self.sectors.entry(index).or_insert([0u8; 512]);
        sector[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

pub struct SimHost {
    journal: Journal,
    card: Rc<RefCell<SimCard>>,
}

impl SimHost {
    fn log(&self, event: Event) {
        self.journal.borrow_mut().push(event);
    }

    fn next_poll(&self, timeout_ms: u32) -> Result<(), SdError> {
        self.log(Event::Poll { timeout_ms });
        self.card.borrow_mut().polls.pop_front().unwrap_or(Ok(()))
    }
}

impl SdioHost for SimHost {
    fn enable_clock(&mut self) {
        self.log(Event::HostClock(true));
    }

    fn disable_clock(&mut self) {
        self.log(Event::HostClock(false));
    }

    fn init(&mut self, config: &BusConfig) -> Result<CardInfo, SdError> {
        self.log(Event::HostInit(*config));
        let card = self.card.borrow();
        match card.fail_init {
            Some(e) => Err(e),
            None => Ok(CardInfo {
                card_type: CardType::Sdhc,
                capacity: card.capacity,
                block_size: 512,
                rca: 0xAAAA,
            }),
        }
    }

    fn configure_wide_bus(&mut self, width: BusWidth) -> Result<(), SdError> {
        self.log(Event::WideBus(width));
        match self.card.borrow().fail_wide_bus {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_status(&mut self) -> Result<SdStatusRegister, SdError> {
        self.log(Event::ReadStatus);
        let mut data = [0u8; 64];
        // 4-bit bus, SD memory card, class 10
        data[0] = 0x80;
        data[8] = 0x04;
        Ok(SdStatusRegister::new(data))
    }

    fn deinit(&mut self) {
        self.log(Event::HostDeinit);
    }

    fn start_read<D: DmaStream>(
        &mut self,
        _dma: &mut D,
        request: &mut ReadRequest<'_>,
    ) -> Result<(), SdError> {
        self.log(Event::StartRead {
            address: request.address.bytes(),
            blocks: request.block_count,
        });
        match self.card.borrow().fail_start {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn poll_read<D: DmaStream>(
        &mut self,
        _dma: &mut D,
        request: &mut ReadRequest<'_>,
        timeout_ms: u32,
    ) -> Result<(), SdError> {
        self.next_poll(timeout_ms)?;
        let card = self.card.borrow();
        let first = request.address.bytes() / 512;
        for (i, chunk) in request.buffer.chunks_mut(512).enumerate() {
            chunk.copy_from_slice(&card.sector(first + i as u64));
        }
        Ok(())
    }

    fn start_write<D: DmaStream>(
        &mut self,
        _dma: &mut D,
        request: &WriteRequest<'_>,
    ) -> Result<(), SdError> {
        self.log(Event::StartWrite {
            address: request.address.bytes(),
            blocks: request.block_count,
        });
        match self.card.borrow().fail_start {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn poll_write<D: DmaStream>(
        &mut self,
        _dma: &mut D,
        request: &WriteRequest<'_>,
        timeout_ms: u32,
    ) -> Result<(), SdError> {
        self.next_poll(timeout_ms)?;
        let mut card = self.card.borrow_mut();
        let first = request.address.bytes() / 512;
        for (i, chunk) in request.buffer.chunks(512).enumerate() {
            card.sectors
                .insert(first + i as u64, chunk.try_into().unwrap());
        }
        Ok(())
    }
}

pub struct SimDma {
    stream: Stream,
    journal: Journal,
    card: Rc<RefCell<SimCard>>,
}

impl DmaStream for SimDma {
    fn enable_controller_clock(&mut self) {
        self.journal.borrow_mut().push(Event::DmaClock(self.stream));
    }

    fn init(&mut self, config: &DmaConfig) -> Result<(), HalError> {
        self.journal
            .borrow_mut()
            .push(Event::DmaInit(self.stream, *config));
        match self.card.borrow().fail_dma_init {
            Some((stream, e)) if stream == self.stream => Err(e),
            _ => Ok(()),
        }
    }

    fn deinit(&mut self) {
        self.journal.borrow_mut().push(Event::DmaDeinit(self.stream));
    }
}

/// Card detect switch, active low unless `active_high` is set.
pub struct SimDetect {
    journal: Journal,
    present: Rc<Cell<bool>>,
    active_high: Rc<Cell<bool>>,
}

impl InputPin for SimDetect {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.journal.borrow_mut().push(Event::DetectRead);
        Ok(self.present.get() == self.active_high.get())
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.journal.borrow_mut().push(Event::DetectRead);
        Ok(self.present.get() != self.active_high.get())
    }
}

pub struct SimPort {
    index: usize,
    journal: Journal,
}

impl PinPort for SimPort {
    fn set_mode(&mut self, mode: PinMode) {
        self.journal
            .borrow_mut()
            .push(Event::PortMode(self.index, mode));
    }

    fn set_alternate(&mut self, function: u8) {
        self.journal
            .borrow_mut()
            .push(Event::PortAlternate(self.index, function));
    }

    fn set_speed(&mut self, speed: PinSpeed) {
        self.journal
            .borrow_mut()
            .push(Event::PortSpeed(self.index, speed));
    }

    fn set_high(&mut self) {
        self.journal.borrow_mut().push(Event::PortHigh(self.index));
    }
}

/// Interrupt controller. Enabling a line that is already enabled is a bug
/// in the driver and panics.
pub struct SimNvic {
    journal: Journal,
    enabled: Rc<RefCell<Vec<InterruptLine>>>,
}

impl InterruptController for SimNvic {
    fn set_priority_grouping(&mut self, preemption_bits: u8) {
        self.journal
            .borrow_mut()
            .push(Event::Grouping(preemption_bits));
    }

    fn set_priority(&mut self, line: InterruptLine, priority: InterruptPriority) {
        self.journal
            .borrow_mut()
            .push(Event::Priority(line, priority));
    }

    fn enable(&mut self, line: InterruptLine) {
        let mut enabled = self.enabled.borrow_mut();
        assert!(!enabled.contains(&line), "{:?} enabled twice", line);
        enabled.push(line);
        self.journal.borrow_mut().push(Event::IrqEnable(line));
    }

    fn disable(&mut self, line: InterruptLine) {
        self.enabled.borrow_mut().retain(|l| *l != line);
        self.journal.borrow_mut().push(Event::IrqDisable(line));
    }
}

pub type Controller = CardController<SimHost, SimDma, SimDetect, SimPort, SimNvic>;

/// Handles onto the simulated hardware, kept by the test after the
/// controller takes ownership of the peripherals.
pub struct Board {
    pub journal: Journal,
    pub card: Rc<RefCell<SimCard>>,
    pub present: Rc<Cell<bool>>,
    /// The detect line reads high while a card is present
    pub active_high: Rc<Cell<bool>>,
    pub enabled: Rc<RefCell<Vec<InterruptLine>>>,
}

impl Board {
    /// A board with a card of `capacity` bytes in the slot.
    pub fn new(capacity: u64) -> (Board, Controller) {
        init_logger();
        let journal: Journal = Rc::new(RefCell::new(Vec::new()));
        let card = Rc::new(RefCell::new(SimCard {
            capacity,
            ..SimCard::default()
        }));
        let present = Rc::new(Cell::new(true));
        let active_high = Rc::new(Cell::new(false));
        let enabled = Rc::new(RefCell::new(Vec::new()));

        let controller = CardController::new(
            SimHost {
                journal: journal.clone(),
                card: card.clone(),
            },
            SimDma {
                stream: Stream::Rx,
                journal: journal.clone(),
                card: card.clone(),
            },
            SimDma {
                stream: Stream::Tx,
                journal: journal.clone(),
                card: card.clone(),
            },
            SimDetect {
                journal: journal.clone(),
                present: present.clone(),
                active_high: active_high.clone(),
            },
            [
                SimPort {
                    index: 0,
                    journal: journal.clone(),
                },
                SimPort {
                    index: 1,
                    journal: journal.clone(),
                },
            ],
            SimNvic {
                journal: journal.clone(),
                enabled: enabled.clone(),
            },
        );
        (
            Board {
                journal,
                card,
                present,
                active_high,
                enabled,
            },
            controller,
        )
    }

    pub fn events(&self) -> Vec<Event> {
        self.journal.borrow().clone()
    }

    pub fn clear(&self) {
        self.journal.borrow_mut().clear();
    }

    /// Number of completion polls since the journal was last cleared.
    pub fn polls(&self) -> usize {
        self.journal
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Poll { .. }))
            .count()
    }

    pub fn script_polls(&self, statuses: &[Result<(), SdError>]) {
        self.card.borrow_mut().polls.extend(statuses.iter().copied());
    }
}

// ****************************************************************************
//
// A toy filesystem
//
// Sector 0 holds a header: "TOYF", an 11 byte label, a 32-bit serial number
// and up to 15 directory entries of 32 bytes from offset 32. An entry is a
// NUL padded name (20 bytes), an attribute byte and a 32-bit size at offset
// 24. The data of entry `i` lives in the 16 sectors starting at 1 + 16 * i.
//
// ****************************************************************************

pub const TOY_MAGIC: &[u8; 4] = b"TOYF";
pub const TOY_ENTRIES: usize = 15;
pub const TOY_FILE_SECTORS: u32 = 16;

/// Write an empty toy volume onto the card.
pub fn format_toy(card: &mut SimCard, label: &str, serial: u32) {
    card.put(0, 0, TOY_MAGIC);
    let mut padded = [b' '; 11];
    padded[..label.len()].copy_from_slice(label.as_bytes());
    card.put(0, 4, &padded);
    card.put(0, 15, &serial.to_le_bytes());
}

/// Add an entry to a toy volume written by `format_toy`.
pub fn add_toy_entry(card: &mut SimCard, slot: usize, name: &str, dir: bool, contents: &[u8]) {
    let base = 32 + slot * 32;
    card.put(0, base, name.as_bytes());
    let attributes = if dir {
        Attributes::DIRECTORY
    } else {
        Attributes::ARCHIVE
    };
    card.put(0, base + 20, &[attributes.bits()]);
    card.put(0, base + 24, &(contents.len() as u32).to_le_bytes());
    let first = 1 + u64::from(TOY_FILE_SECTORS) * slot as u64;
    for (i, chunk) in contents.chunks(512).enumerate() {
        card.put(first + i as u64, 0, chunk);
    }
}

#[derive(Debug)]
pub struct ToyFile {
    slot: usize,
    size: u64,
    pos: u64,
}

#[derive(Debug)]
pub struct ToyDir {
    entries: VecDeque<FileInfo>,
}

#[derive(Default)]
pub struct ToyFs {
    pub linked: Vec<String>,
    pub mounted: Option<String>,
    pub unmounts: usize,
    pub closed: usize,
    pub dirs_closed: usize,
    pub fail_link: Option<FsError>,
    pub fail_label: Option<FsError>,
    pub fail_current_dir: Option<FsError>,
    pub fail_seek: Option<FsError>,
    pub fail_unmount: Option<FsError>,
    pub fail_close: Option<FsError>,
    pub fail_close_dir: Option<FsError>,
    /// Fail `read_dir` once this many entries have been returned
    pub fail_read_dir_after: Option<usize>,
    next_drive: u8,
}

fn load_header<D: DiskIo>(disk: &mut D) -> Result<[u8; 512], FsError> {
    let mut header = [0u8; 512];
    disk.read(0, &mut header, 0, 1)
        .map_err(|_| FsError::DiskError)?;
    if &header[..4] != TOY_MAGIC {
        return Err(FsError::NoFilesystem);
    }
    Ok(header)
}

fn entry_name(header: &[u8; 512], slot: usize) -> &str {
    let raw = &header[32 + slot * 32..32 + slot * 32 + 20];
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).unwrap()
}

fn entry_size(header: &[u8; 512], slot: usize) -> u64 {
    let base = 32 + slot * 32 + 24;
    u64::from(u32::from_le_bytes(header[base..base + 4].try_into().unwrap()))
}

fn first_sector(slot: usize) -> u32 {
    1 + TOY_FILE_SECTORS * slot as u32
}

impl ToyFs {
    pub fn new() -> ToyFs {
        ToyFs::default()
    }

    fn update_size<D: DiskIo>(&self, disk: &mut D, slot: usize, size: u64) -> Result<(), FsError> {
        let mut header = load_header(disk)?;
        let base = 32 + slot * 32 + 24;
        header[base..base + 4].copy_from_slice(&(size as u32).to_le_bytes());
        disk.write(0, &header, 0, 1).map_err(|_| FsError::DiskError)
    }
}

impl FatFs for ToyFs {
    type File = ToyFile;
    type Dir = ToyDir;

    fn link_driver(&mut self) -> Result<DrivePath, FsError> {
        if let Some(e) = self.fail_link {
            return Err(e);
        }
        let drive = format!("{}:/", self.next_drive);
        self.next_drive += 1;
        self.linked.push(drive.clone());
        Ok(hstr(&drive))
    }

    fn unlink_driver(&mut self, drive: &str) {
        self.linked.retain(|d| d != drive);
    }

    fn mount<D: DiskIo>(&mut self, disk: &mut D, drive: &str) -> Result<(), FsError> {
        if !self.linked.iter().any(|d| d == drive) {
            return Err(FsError::InvalidDrive);
        }
        load_header(disk)?;
        self.mounted = Some(drive.to_string());
        Ok(())
    }

    fn unmount(&mut self, _drive: &str) -> Result<(), FsError> {
        self.mounted = None;
        self.unmounts += 1;
        match self.fail_unmount {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn label<D: DiskIo>(
        &mut self,
        disk: &mut D,
        _drive: &str,
    ) -> Result<(VolumeLabel, u32), FsError> {
        if let Some(e) = self.fail_label {
            return Err(e);
        }
        let header = load_header(disk)?;
        let label = std::str::from_utf8(&header[4..15]).unwrap().trim_end();
        let serial = u32::from_le_bytes(header[15..19].try_into().unwrap());
        Ok((hstr(label), serial))
    }

    fn current_dir<D: DiskIo>(&mut self, _disk: &mut D) -> Result<DirPath, FsError> {
        match self.fail_current_dir {
            Some(e) => Err(e),
            None => Ok(hstr("/")),
        }
    }

    fn open<D: DiskIo>(
        &mut self,
        disk: &mut D,
        path: &str,
        mode: OpenMode,
    ) -> Result<ToyFile, FsError> {
        let name = path.trim_start_matches('/');
        let mut header = load_header(disk)?;
        if let Some(slot) = (0..TOY_ENTRIES).find(|slot| entry_name(&header, *slot) == name) {
            return Ok(ToyFile {
                slot,
                size: entry_size(&header, slot),
                pos: 0,
            });
        }
        if !mode.contains(OpenMode::OPEN_ALWAYS) {
            return Err(FsError::NoFile);
        }
        let slot = (0..TOY_ENTRIES)
            .find(|slot| entry_name(&header, *slot).is_empty())
            .ok_or(FsError::Denied)?;
        let base = 32 + slot * 32;
        header[base..base + name.len()].copy_from_slice(name.as_bytes());
        header[base + 20] = Attributes::ARCHIVE.bits();
        disk.write(0, &header, 0, 1)
            .map_err(|_| FsError::DiskError)?;
        Ok(ToyFile {
            slot,
            size: 0,
            pos: 0,
        })
    }

    fn size(&self, file: &ToyFile) -> u64 {
        file.size
    }

    fn seek<D: DiskIo>(
        &mut self,
        _disk: &mut D,
        file: &mut ToyFile,
        offset: u64,
    ) -> Result<(), FsError> {
        if let Some(e) = self.fail_seek {
            return Err(e);
        }
        file.pos = offset;
        Ok(())
    }

    fn read<D: DiskIo>(
        &mut self,
        disk: &mut D,
        file: &mut ToyFile,
        buffer: &mut [u8],
    ) -> Result<usize, FsError> {
        let len = buffer.len().min((file.size - file.pos.min(file.size)) as usize);
        if len == 0 {
            return Ok(0);
        }
        let first = (file.pos / 512) as u32;
        let last = ((file.pos + len as u64 + 511) / 512) as u32;
        let mut data = vec![0u8; ((last - first) * 512) as usize];
        disk.read(0, &mut data, first_sector(file.slot) + first, last - first)
            .map_err(|_| FsError::DiskError)?;
        let skip = (file.pos % 512) as usize;
        buffer[..len].copy_from_slice(&data[skip..skip + len]);
        file.pos += len as u64;
        Ok(len)
    }

    fn write<D: DiskIo>(
        &mut self,
        disk: &mut D,
        file: &mut ToyFile,
        data: &[u8],
    ) -> Result<usize, FsError> {
        let end = file.pos + data.len() as u64;
        if end > u64::from(TOY_FILE_SECTORS) * 512 {
            return Err(FsError::Denied);
        }
        let first = (file.pos / 512) as u32;
        let last = ((end + 511) / 512) as u32;
        let count = last - first;
        let mut sectors = vec![0u8; (count * 512) as usize];
        disk.read(0, &mut sectors, first_sector(file.slot) + first, count)
            .map_err(|_| FsError::DiskError)?;
        let skip = (file.pos % 512) as usize;
        sectors[skip..skip + data.len()].copy_from_slice(data);
        disk.write(0, &sectors, first_sector(file.slot) + first, count)
            .map_err(|_| FsError::DiskError)?;
        file.pos = end;
        if end > file.size {
            file.size = end;
            self.update_size(disk, file.slot, end)?;
        }
        Ok(data.len())
    }

    fn close<D: DiskIo>(&mut self, _disk: &mut D, _file: ToyFile) -> Result<(), FsError> {
        self.closed += 1;
        match self.fail_close {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn open_dir<D: DiskIo>(&mut self, disk: &mut D, path: &str) -> Result<ToyDir, FsError> {
        if path != "/" {
            return Err(FsError::NoPath);
        }
        let header = load_header(disk)?;
        let entries = (0..TOY_ENTRIES)
            .filter(|slot| !entry_name(&header, *slot).is_empty())
            .map(|slot| FileInfo {
                name: hstr(entry_name(&header, slot)),
                size: entry_size(&header, slot),
                attributes: Attributes::from_bits_truncate(header[32 + slot * 32 + 20]),
            })
            .collect();
        Ok(ToyDir { entries })
    }

    fn read_dir<D: DiskIo>(
        &mut self,
        _disk: &mut D,
        dir: &mut ToyDir,
    ) -> Result<Option<FileInfo>, FsError> {
        match self.fail_read_dir_after {
            Some(0) => return Err(FsError::DiskError),
            Some(n) => self.fail_read_dir_after = Some(n - 1),
            None => {}
        }
        Ok(dir.entries.pop_front())
    }

    fn close_dir(&mut self, _dir: ToyDir) -> Result<(), FsError> {
        self.dirs_closed += 1;
        match self.fail_close_dir {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
