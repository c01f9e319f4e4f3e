//! sdio-disk - Mount and session helpers
//!
//! Links a card into a FAT filesystem driver through [`SdDisk`], mounts the
//! volume and offers a few conveniences on top of the mounted filesystem.
//!
//! The filesystem itself is external: anything implementing [`FatFs`]
//! against the [`DiskIo`] interface can be mounted.

use core::fmt::Write;

use crate::diskio::{DiskIo, SdDisk};
use crate::BlockDevice;

#[cfg(feature = "log")]
use log::{debug, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

/// Longest volume label a FAT volume can carry.
pub const VOLUME_LABEL_LEN: usize = 11;
/// Longest logical drive path, e.g. `"0:/"`.
pub const DRIVE_PATH_LEN: usize = 4;
/// Longest directory path tracked as the current directory.
pub const PATH_LEN: usize = 128;
/// Longest file name reported by a directory listing.
pub const NAME_LEN: usize = 255;

pub type VolumeLabel = heapless::String<VOLUME_LABEL_LEN>;
pub type DrivePath = heapless::String<DRIVE_PATH_LEN>;
pub type DirPath = heapless::String<PATH_LEN>;
pub type FileName = heapless::String<NAME_LEN>;

/// Result codes of a FAT filesystem driver. Success is `Ok`, code 0.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsError {
    /// A hard error occurred in the disk I/O layer
    DiskError,
    /// Assertion failed inside the driver
    InternalError,
    /// The physical drive cannot work
    NotReady,
    /// Could not find the file
    NoFile,
    /// Could not find the path
    NoPath,
    /// The path name format is invalid
    InvalidName,
    /// Access denied or directory full
    Denied,
    /// The object already exists
    Exists,
    /// The file or directory object is invalid
    InvalidObject,
    /// The drive is write protected
    WriteProtected,
    /// The logical drive number is invalid
    InvalidDrive,
    /// The volume has no work area
    NotEnabled,
    /// No valid FAT volume
    NoFilesystem,
    /// Formatting was aborted
    MkfsAborted,
    /// Could not get a grant to access the volume in time
    Timeout,
    /// The operation is rejected by the file sharing policy
    Locked,
    /// Working buffer could not be allocated
    NotEnoughCore,
    /// Too many files are open
    TooManyOpenFiles,
    /// A parameter is invalid
    InvalidParameter,
}

impl FsError {
    /// The numeric result code, as a C caller would see it.
    pub fn code(self) -> u8 {
        match self {
            FsError::DiskError => 1,
            FsError::InternalError => 2,
            FsError::NotReady => 3,
            FsError::NoFile => 4,
            FsError::NoPath => 5,
            FsError::InvalidName => 6,
            FsError::Denied => 7,
            FsError::Exists => 8,
            FsError::InvalidObject => 9,
            FsError::WriteProtected => 10,
            FsError::InvalidDrive => 11,
            FsError::NotEnabled => 12,
            FsError::NoFilesystem => 13,
            FsError::MkfsAborted => 14,
            FsError::Timeout => 15,
            FsError::Locked => 16,
            FsError::NotEnoughCore => 17,
            FsError::TooManyOpenFiles => 18,
            FsError::InvalidParameter => 19,
        }
    }
}

bitflags::bitflags! {
    /// How a file is opened.
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Create a new file, failing if it exists
        const CREATE_NEW = 0x04;
        /// Create a new file, truncating any existing one
        const CREATE_ALWAYS = 0x08;
        /// Open the file, creating it if needed
        const OPEN_ALWAYS = 0x10;
        /// As `OPEN_ALWAYS`, with the file pointer at the end
        const OPEN_APPEND = 0x30;
    }
}

bitflags::bitflags! {
    /// Attributes of a directory entry.
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
    }
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: FileName,
    /// File size in bytes, zero for directories
    pub size: u64,
    pub attributes: Attributes,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }
}

/// A FAT filesystem driver that reaches its volumes through `DiskIo`.
///
/// Every operation that may touch the medium is handed the disk to use.
pub trait FatFs {
    /// An open file.
    type File;
    /// An open directory.
    type Dir;

    /// Register a disk driver and get back the logical drive it serves.
    fn link_driver(&mut self) -> Result<DrivePath, FsError>;
    /// Release a logical drive obtained from `link_driver`.
    fn unlink_driver(&mut self, drive: &str);
    /// Mount the volume on `drive`, reading it through `disk`.
    fn mount<D: DiskIo>(&mut self, disk: &mut D, drive: &str) -> Result<(), FsError>;
    /// Forget the volume on `drive`.
    fn unmount(&mut self, drive: &str) -> Result<(), FsError>;
    /// The volume label and serial number.
    fn label<D: DiskIo>(&mut self, disk: &mut D, drive: &str)
        -> Result<(VolumeLabel, u32), FsError>;
    /// The current directory.
    fn current_dir<D: DiskIo>(&mut self, disk: &mut D) -> Result<DirPath, FsError>;
    /// Open or create a file.
    fn open<D: DiskIo>(
        &mut self,
        disk: &mut D,
        path: &str,
        mode: OpenMode,
    ) -> Result<Self::File, FsError>;
    /// The size of an open file in bytes.
    fn size(&self, file: &Self::File) -> u64;
    /// Move the file pointer to `offset` bytes from the start of the file.
    fn seek<D: DiskIo>(
        &mut self,
        disk: &mut D,
        file: &mut Self::File,
        offset: u64,
    ) -> Result<(), FsError>;
    /// Read from the file pointer, returning the number of bytes read.
    fn read<D: DiskIo>(
        &mut self,
        disk: &mut D,
        file: &mut Self::File,
        buffer: &mut [u8],
    ) -> Result<usize, FsError>;
    /// Write at the file pointer, returning the number of bytes written.
    fn write<D: DiskIo>(
        &mut self,
        disk: &mut D,
        file: &mut Self::File,
        data: &[u8],
    ) -> Result<usize, FsError>;
    /// Flush and close the file.
    fn close<D: DiskIo>(&mut self, disk: &mut D, file: Self::File) -> Result<(), FsError>;
    /// Open a directory for listing.
    fn open_dir<D: DiskIo>(&mut self, disk: &mut D, path: &str) -> Result<Self::Dir, FsError>;
    /// The next entry, or `None` at the end of the directory.
    fn read_dir<D: DiskIo>(
        &mut self,
        disk: &mut D,
        dir: &mut Self::Dir,
    ) -> Result<Option<FileInfo>, FsError>;
    fn close_dir(&mut self, dir: Self::Dir) -> Result<(), FsError>;
}

/// A removable card behind a block device.
pub trait CardSlot: BlockDevice {
    fn is_card_inserted(&self) -> bool;
    /// Bring up the card with the given bus clock divisor.
    fn start(&mut self, clock_div: u32) -> Result<(), Self::Error>;
    /// Tear the card down. Calling it twice is harmless.
    fn stop(&mut self);
}

/// A mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountContext {
    /// The logical drive the card is linked to
    pub drive: DrivePath,
    pub label: VolumeLabel,
    pub serial: u32,
    pub current_dir: DirPath,
}

/// Which mount step failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MountError {
    /// The filesystem driver refused the disk driver
    Link(FsError),
    /// No filesystem could be mounted
    Mount(FsError),
    /// The volume label could not be read
    Label(FsError),
    /// The current directory could not be read
    CurrentDir(FsError),
}

impl MountError {
    /// The filesystem result behind this error.
    pub fn error(self) -> FsError {
        match self {
            MountError::Link(e)
            | MountError::Mount(e)
            | MountError::Label(e)
            | MountError::CurrentDir(e) => e,
        }
    }
}

/// Which step of `Session::open_append` failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionError<E> {
    /// The card could not be started
    Card(E),
    /// The volume could not be mounted
    Mount(MountError),
    /// The file could not be opened
    Open(FsError),
    /// The file was opened but could not be positioned; it has been closed
    Seek(FsError),
}

impl<E> SessionError<E> {
    /// The filesystem result code a C caller would have seen.
    pub fn code(&self) -> FsError {
        match *self {
            SessionError::Card(_) => FsError::NotReady,
            SessionError::Mount(_) => FsError::NoFilesystem,
            SessionError::Open(e) | SessionError::Seek(e) => e,
        }
    }
}

/// A card together with the filesystem mounted from it.
pub struct Session<C, F>
where
    C: CardSlot,
    F: FatFs,
{
    card: C,
    fs: F,
    mount: Option<MountContext>,
}

impl<C, F> Session<C, F>
where
    C: CardSlot,
    F: FatFs,
{
    pub fn new(card: C, fs: F) -> Self {
        Session {
            card,
            fs,
            mount: None,
        }
    }

    pub fn card(&self) -> &C {
        &self.card
    }

    pub fn card_mut(&mut self) -> &mut C {
        &mut self.card
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// The mounted volume, if any.
    pub fn mount_context(&self) -> Option<&MountContext> {
        self.mount.as_ref()
    }

    /// Link the card into the filesystem driver, mount the volume and read
    /// back its label, serial number and current directory.
    ///
    /// The card must already be started. A volume mounted earlier is
    /// unmounted first. On failure nothing stays linked or mounted.
    pub fn mount_fat_fs(&mut self) -> Result<&MountContext, MountError> {
        self.unmount();

        let drive = self.fs.link_driver().map_err(|e| {
            warn!("Can not link FAT FS driver: {:?}", e);
            MountError::Link(e)
        })?;

        let mut disk = SdDisk::new(&mut self.card);
        if let Err(e) = self.fs.mount(&mut disk, &drive) {
            warn!("Can not mount FAT FS volume: {:?}", e);
            self.fs.unlink_driver(&drive);
            return Err(MountError::Mount(e));
        }

        let metadata = match self.fs.label(&mut disk, &drive) {
            Ok((label, serial)) => match self.fs.current_dir(&mut disk) {
                Ok(current_dir) => Ok((label, serial, current_dir)),
                Err(e) => {
                    warn!("Can not retrieve FAT FS current directory: {:?}", e);
                    Err(MountError::CurrentDir(e))
                }
            },
            Err(e) => {
                warn!("Can not retrieve FAT FS volume label: {:?}", e);
                Err(MountError::Label(e))
            }
        };
        let (label, serial, current_dir) = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                if let Err(e) = self.fs.unmount(&drive) {
                    warn!("Can not unmount FAT FS volume: {:?}", e);
                }
                self.fs.unlink_driver(&drive);
                return Err(e);
            }
        };

        info!(
            "FAT FS successfully initialized: label = {}, serial number = {}, current directory = {}",
            label.as_str(),
            serial,
            current_dir.as_str()
        );
        Ok(&*self.mount.insert(MountContext {
            drive,
            label,
            serial,
            current_dir,
        }))
    }

    /// Start the card, mount the volume and open `path` for appending,
    /// creating it if it does not exist.
    ///
    /// Writes through the returned file land after the existing contents.
    pub fn open_append(
        &mut self,
        clock_div: u32,
        path: &str,
    ) -> Result<F::File, SessionError<C::Error>> {
        self.card.start(clock_div).map_err(SessionError::Card)?;
        self.mount_fat_fs().map_err(SessionError::Mount)?;

        let mut disk = SdDisk::new(&mut self.card);
        let mut file = self
            .fs
            .open(&mut disk, path, OpenMode::WRITE | OpenMode::OPEN_ALWAYS)
            .map_err(SessionError::Open)?;

        let size = self.fs.size(&file);
        if let Err(e) = self.fs.seek(&mut disk, &mut file, size) {
            warn!("Can not seek to end of {}: {:?}", path, e);
            if let Err(close_err) = self.fs.close(&mut disk, file) {
                warn!("Can not close {}: {:?}", path, close_err);
            }
            return Err(SessionError::Seek(e));
        }
        debug!("{} opened for append at offset {}", path, size);
        Ok(file)
    }

    /// Open a file on the mounted volume.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<F::File, FsError> {
        let mut disk = SdDisk::new(&mut self.card);
        self.fs.open(&mut disk, path, mode)
    }

    pub fn write(&mut self, file: &mut F::File, data: &[u8]) -> Result<usize, FsError> {
        let mut disk = SdDisk::new(&mut self.card);
        self.fs.write(&mut disk, file, data)
    }

    pub fn read(&mut self, file: &mut F::File, buffer: &mut [u8]) -> Result<usize, FsError> {
        let mut disk = SdDisk::new(&mut self.card);
        self.fs.read(&mut disk, file, buffer)
    }

    pub fn close(&mut self, file: F::File) -> Result<(), FsError> {
        let mut disk = SdDisk::new(&mut self.card);
        self.fs.close(&mut disk, file)
    }

    /// Write one line per entry of the current directory to `out`: the
    /// name followed by `<DIR>` for directories, or by the size in
    /// parentheses for files.
    ///
    /// Stops at the end of the directory or at the first error, and
    /// returns the number of entries listed.
    pub fn list_files<W>(&mut self, out: &mut W) -> Result<usize, FsError>
    where
        W: Write,
    {
        let path = match &self.mount {
            Some(context) => context.current_dir.clone(),
            None => return Err(FsError::NotEnabled),
        };

        let mut disk = SdDisk::new(&mut self.card);
        let mut dir = self.fs.open_dir(&mut disk, &path)?;
        let mut listed = 0;
        let result = loop {
            let entry = match self.fs.read_dir(&mut disk, &mut dir) {
                Ok(Some(entry)) => entry,
                Ok(None) => break Ok(listed),
                Err(e) => {
                    warn!("Can not read directory {}: {:?}", path.as_str(), e);
                    break Err(e);
                }
            };
            let line = if entry.is_dir() {
                writeln!(out, "  {} <DIR>", entry.name)
            } else {
                writeln!(out, "  {} ({})", entry.name, entry.size)
            };
            if line.is_err() {
                break Err(FsError::InternalError);
            }
            listed += 1;
        };
        if let Err(e) = self.fs.close_dir(dir) {
            warn!("Can not close directory: {:?}", e);
        }
        result
    }

    /// Unmount the volume and unlink the card from the filesystem driver.
    pub fn unmount(&mut self) {
        if let Some(context) = self.mount.take() {
            debug!("unmounting {}", context.drive.as_str());
            if let Err(e) = self.fs.unmount(&context.drive) {
                warn!("Can not unmount FAT FS volume: {:?}", e);
            }
            self.fs.unlink_driver(&context.drive);
        }
    }

    /// Unmount the volume and stop the card.
    pub fn stop(&mut self) {
        self.unmount();
        self.card.stop();
    }

    /// Give back the card and the filesystem driver.
    pub fn release(self) -> (C, F) {
        (self.card, self.fs)
    }
}
