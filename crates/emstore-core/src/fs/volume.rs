//! Record files on a mounted FAT volume.
//!
//! Owns the `embedded-sdmmc` volume manager for as long as the card is
//! mounted. Directories are opened along the record path and closed again
//! right away; only the root directory and the per-class read handles stay
//! open between calls.
//!
//! Every volume manager call that can touch the card is followed by a yield,
//! so a long operation such as creating a file from its template is spread
//! over many executor turns, one or a few sectors each.

use embassy_futures::yield_now;
use embedded_sdmmc::{
    Error, Mode, RawDirectory, RawFile, RawVolume, TimeSource, VolumeIdx, VolumeManager,
};
use log::{debug, warn};

use super::{FsError, FsGlue};
use crate::record::{HEADER_LEN, NewFileTemplate, RecordClass, RecordKey, path_for};
use crate::sdmmc::{BLOCK_LEN, BlockTransport, SdError};

/// Root, year, month and day directory
pub const MAX_DIRS: usize = 4;
/// One cached reader per class plus one writer and a spare
pub const MAX_FILES: usize = 6;

/// Handle ids start here so stale handles from an earlier mount never match
const HANDLE_ID_OFFSET: u32 = 5000;

pub const BOOT_COUNT_FILE: &str = "BOOT_CNT";
pub const CONFIG_DIR: &str = "STORAGE";

/// Bytes per configuration page
pub const CONFIG_PAGE_LEN: usize = 64;

type FsResult<T> = Result<T, Error<SdError>>;

type Manager<B, T> = VolumeManager<FsGlue<B>, T, MAX_DIRS, MAX_FILES, 1>;

/// Buffered read handle: the file most recently read for one class.
struct ReadHandle {
    key: RecordKey,
    file: RawFile,
}

/// A failed mount hands the transport and clock back to the caller.
pub struct MountFailure<B, T> {
    pub error: FsError,
    pub transport: B,
    pub clock: T,
}

pub struct Volume<B, T>
where
    B: BlockTransport,
    T: TimeSource,
{
    manager: Manager<B, T>,
    volume: RawVolume,
    root: RawDirectory,
    readers: [Option<ReadHandle>; 4],
}

fn ignore_exists(result: FsResult<()>) -> FsResult<()> {
    match result {
        Err(Error::DirAlreadyExists) | Err(Error::FileAlreadyExists) => Ok(()),
        other => other,
    }
}

impl<B, T> Volume<B, T>
where
    B: BlockTransport,
    T: TimeSource,
{
    /// Opens the first partition of an initialized card.
    pub async fn mount(transport: B, clock: T) -> Result<Self, MountFailure<B, T>> {
        let manager: Manager<B, T> =
            VolumeManager::new_with_limits(FsGlue::new(transport), clock, HANDLE_ID_OFFSET);

        let opened = manager.open_raw_volume(VolumeIdx(0)).and_then(|volume| {
            match manager.open_root_dir(volume) {
                Ok(root) => Ok((volume, root)),
                Err(e) => {
                    let _ = manager.close_volume(volume);
                    Err(e)
                }
            }
        });
        yield_now().await;

        match opened {
            Ok((volume, root)) => Ok(Self {
                manager,
                volume,
                root,
                readers: [None, None, None, None],
            }),
            Err(e) => {
                let (glue, clock) = manager.free();
                Err(MountFailure {
                    error: e.into(),
                    transport: glue.into_inner(),
                    clock,
                })
            }
        }
    }

    /// Closes every handle and gives the transport back.
    pub async fn unmount(mut self) -> (B, T) {
        for class in RecordClass::ALL {
            self.close_reader(class);
        }
        if let Err(e) = self.manager.close_dir(self.root) {
            debug!("fs: closing root failed: {:?}", e);
        }
        if let Err(e) = self.manager.close_volume(self.volume) {
            debug!("fs: closing volume failed: {:?}", e);
        }
        yield_now().await;
        let (glue, clock) = self.manager.free();
        (glue.into_inner(), clock)
    }

    /// Runs one volume manager call, then lets the other tasks run.
    async fn call<R>(&self, op: impl FnOnce(&Manager<B, T>) -> FsResult<R>) -> FsResult<R> {
        let result = op(&self.manager);
        yield_now().await;
        result
    }

    fn close_subdir(&self, dir: RawDirectory) {
        if let Err(e) = self.manager.close_dir(dir) {
            debug!("fs: closing directory failed: {:?}", e);
        }
    }

    /// Walks from the root to the directory of `key`, creating missing
    /// directories when `create` is set. The returned handle is never the
    /// root and must be closed.
    async fn open_key_dir(&self, key: &RecordKey, create: bool) -> FsResult<RawDirectory> {
        let mut current = self.root;
        for (depth, name) in key.directories().iter().enumerate() {
            let step = if create {
                ignore_exists(self.call(|m| m.make_dir_in_dir(current, name.as_str())).await)
            } else {
                Ok(())
            };
            let opened = match step {
                Ok(()) => self.call(|m| m.open_dir(current, name.as_str())).await,
                Err(e) => Err(e),
            };
            if depth > 0 {
                self.close_subdir(current);
            }
            current = opened?;
        }
        Ok(current)
    }

    /// Creates the directories for `key`. Existing directories are fine.
    pub async fn ensure_directories(&self, key: &RecordKey) -> Result<(), FsError> {
        let dir = self.open_key_dir(key, true).await?;
        self.close_subdir(dir);
        Ok(())
    }

    async fn read_fully(&self, file: RawFile, buf: &mut [u8]) -> FsResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.call(|m| m.read(file, &mut buf[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// A record file is usable if it is complete and carries our header.
    async fn file_is_valid(&self, file: RawFile, class: RecordClass) -> FsResult<bool> {
        if self.manager.file_length(file)? as usize != class.file_len() {
            return Ok(false);
        }
        self.manager.file_seek_from_start(file, 0)?;
        let mut header = [0u8; HEADER_LEN];
        let n = self.read_fully(file, &mut header).await?;
        Ok(n == HEADER_LEN && class.header_matches(&header))
    }

    /// Streams the new-file template, one sector per write.
    async fn write_template(&self, file: RawFile, class: RecordClass) -> FsResult<()> {
        let mut template = NewFileTemplate::new(class);
        let mut buf = [0u8; BLOCK_LEN];
        loop {
            let n = template.read(&mut buf);
            if n == 0 {
                return Ok(());
            }
            self.call(|m| m.write(file, &buf[..n])).await?;
        }
    }

    /// Opens a record file for writing, creating or repairing it from the template.
    async fn open_for_update(
        &self,
        dir: RawDirectory,
        key: &RecordKey,
        class: RecordClass,
    ) -> FsResult<RawFile> {
        let name = key.file_name(class);
        let existing = self
            .call(|m| m.open_file_in_dir(dir, name.as_str(), Mode::ReadWriteAppend))
            .await;
        match existing {
            Ok(file) => {
                match self.file_is_valid(file, class).await {
                    Ok(true) => return Ok(file),
                    Ok(false) => warn!("fs: rewriting damaged {}", path_for(key, class)),
                    Err(e) => {
                        let _ = self.manager.close_file(file);
                        return Err(e);
                    }
                }
                self.call(|m| m.close_file(file)).await?;
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let file = self
            .call(|m| m.open_file_in_dir(dir, name.as_str(), Mode::ReadWriteCreateOrTruncate))
            .await?;
        if let Err(e) = self.write_template(file, class).await {
            let _ = self.manager.close_file(file);
            return Err(e);
        }
        debug!("fs: created {}", path_for(key, class));
        Ok(file)
    }

    /// Writes one slot, creating the directories and the file on first use.
    pub async fn write_slot(
        &mut self,
        class: RecordClass,
        key: &RecordKey,
        slot: u16,
        bytes: &[u8],
    ) -> Result<(), FsError> {
        // The reader may hold the same file open
        if self.readers[class.index()].as_ref().is_some_and(|r| r.key == *key) {
            self.close_reader(class);
        }

        let dir = self.open_key_dir(key, true).await?;
        let opened = self.open_for_update(dir, key, class).await;
        self.close_subdir(dir);
        let file = opened?;

        let offset = HEADER_LEN + usize::from(slot) * class.slot_len();
        let written = match self.manager.file_seek_from_start(file, offset as u32) {
            Ok(()) => self.call(|m| m.write(file, &bytes[..class.slot_len()])).await,
            Err(e) => Err(e),
        };
        let closed = self.call(|m| m.close_file(file)).await;
        written?;
        closed?;
        Ok(())
    }

    /// Returns the cached reader for `class`, reopening it if the key changed.
    /// `None` means there is no usable file for `key`.
    async fn reader(&mut self, class: RecordClass, key: &RecordKey) -> FsResult<Option<RawFile>> {
        if let Some(reader) = &self.readers[class.index()] {
            if reader.key == *key {
                return Ok(Some(reader.file));
            }
        }
        self.close_reader(class);

        let dir = match self.open_key_dir(key, false).await {
            Ok(dir) => dir,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let name = key.file_name(class);
        let opened = self
            .call(|m| m.open_file_in_dir(dir, name.as_str(), Mode::ReadOnly))
            .await;
        self.close_subdir(dir);
        let file = match opened {
            Ok(file) => file,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        match self.file_is_valid(file, class).await {
            Ok(true) => {
                self.readers[class.index()] = Some(ReadHandle { key: *key, file });
                Ok(Some(file))
            }
            Ok(false) => {
                debug!("fs: ignoring damaged {}", path_for(key, class));
                let _ = self.manager.close_file(file);
                Ok(None)
            }
            Err(e) => {
                let _ = self.manager.close_file(file);
                Err(e)
            }
        }
    }

    /// Reads `count` consecutive slots into `out`.
    ///
    /// Missing or damaged files read as "no data" slots.
    pub async fn read_slots(
        &mut self,
        class: RecordClass,
        key: &RecordKey,
        first_slot: u16,
        count: u16,
        out: &mut [u8],
    ) -> Result<(), FsError> {
        let slot_len = class.slot_len();
        let out = &mut out[..usize::from(count) * slot_len];

        let filled = match self.reader(class, key).await? {
            Some(file) => {
                let offset = HEADER_LEN + usize::from(first_slot) * slot_len;
                let read = match self.manager.file_seek_from_start(file, offset as u32) {
                    Ok(()) => self.read_fully(file, out).await,
                    Err(e) => Err(e),
                };
                match read {
                    Ok(n) => n,
                    Err(e) => {
                        self.close_reader(class);
                        return Err(e.into());
                    }
                }
            }
            None => 0,
        };

        // Whatever the file could not provide is reported as no data
        let first_missing = filled.div_ceil(slot_len) * slot_len;
        if filled % slot_len != 0 {
            class.write_no_data(&mut out[first_missing - slot_len..first_missing]);
        }
        for slot in out[first_missing..].chunks_mut(slot_len) {
            class.write_no_data(slot);
        }
        Ok(())
    }

    /// Closes the buffered read handle of `class`, if any.
    pub fn close_reader(&mut self, class: RecordClass) {
        if let Some(reader) = self.readers[class.index()].take() {
            if let Err(e) = self.manager.close_file(reader.file) {
                debug!("fs: closing reader failed: {:?}", e);
            }
        }
    }

    /// Reads, increments and writes back the boot counter.
    pub async fn increment_boot_count(&mut self) -> Result<u32, FsError> {
        let root = self.root;
        let existing = self
            .call(|m| m.open_file_in_dir(root, BOOT_COUNT_FILE, Mode::ReadOnly))
            .await;
        let previous = match existing {
            Ok(file) => {
                let mut buf = [0u8; 4];
                let read = self.read_fully(file, &mut buf).await;
                self.manager.close_file(file)?;
                if read? == buf.len() {
                    u32::from_le_bytes(buf)
                } else {
                    0
                }
            }
            Err(Error::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };

        let count = previous.wrapping_add(1);
        let file = self
            .call(|m| m.open_file_in_dir(root, BOOT_COUNT_FILE, Mode::ReadWriteCreateOrTruncate))
            .await?;
        let written = self.call(|m| m.write(file, &count.to_le_bytes())).await;
        let closed = self.call(|m| m.close_file(file)).await;
        written?;
        closed?;
        Ok(count)
    }

    fn config_file_name(page: usize) -> heapless::String<12> {
        use core::fmt::Write;
        let mut name = heapless::String::new();
        let _ = write!(name, "{}.SP", page);
        name
    }

    /// Reads a persisted configuration page. `Ok(false)` if it was never written.
    pub async fn read_config_page(
        &mut self,
        page: usize,
        out: &mut [u8; CONFIG_PAGE_LEN],
    ) -> Result<bool, FsError> {
        let root = self.root;
        let dir = match self.call(|m| m.open_dir(root, CONFIG_DIR)).await {
            Ok(dir) => dir,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let name = Self::config_file_name(page);
        let opened = self
            .call(|m| m.open_file_in_dir(dir, name.as_str(), Mode::ReadOnly))
            .await;
        self.close_subdir(dir);
        let file = match opened {
            Ok(file) => file,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let read = self.read_fully(file, out).await;
        self.manager.close_file(file)?;
        Ok(read? == CONFIG_PAGE_LEN)
    }

    pub async fn write_config_page(
        &mut self,
        page: usize,
        data: &[u8; CONFIG_PAGE_LEN],
    ) -> Result<(), FsError> {
        let root = self.root;
        ignore_exists(self.call(|m| m.make_dir_in_dir(root, CONFIG_DIR)).await)?;
        let dir = self.call(|m| m.open_dir(root, CONFIG_DIR)).await?;
        let name = Self::config_file_name(page);
        let opened = self
            .call(|m| m.open_file_in_dir(dir, name.as_str(), Mode::ReadWriteCreateOrTruncate))
            .await;
        self.close_subdir(dir);
        let file = opened?;
        let written = self.call(|m| m.write(file, data)).await;
        let closed = self.call(|m| m.close_file(file)).await;
        written?;
        closed?;
        Ok(())
    }
}
