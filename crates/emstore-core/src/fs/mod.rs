//! FAT filesystem on top of the block transport.
//!
//! `embedded-sdmmc` drives the FAT layer. [`FsGlue`] hands it the transport
//! as a synchronous block device, one SD sector per filesystem block. FAT
//! rewrites sectors in place, so there is no erase step and no wear leveling
//! beyond what the card controller does.

pub mod format;
pub mod volume;

use core::cell::RefCell;
use core::fmt::Write;

use embassy_futures::block_on;
use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx, TimeSource, Timestamp};
use thiserror_no_std::Error;

use crate::sdmmc::{BlockTransport, SdError};

pub use format::{FormatError, format_card};
pub use volume::{MountFailure, Volume};

/// Filesystem level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("device error: {0}")]
    Device(SdError),
    #[error("no usable FAT volume: {0}")]
    Format(&'static str),
    #[error("not found")]
    NotFound,
    #[error("filesystem error: {0}")]
    Other(heapless::String<48>),
}

impl FsError {
    /// True if the card stopped answering while the volume was accessed.
    pub fn is_unresponsive(&self) -> bool {
        matches!(self, FsError::Device(e) if e.is_unresponsive())
    }
}

impl From<embedded_sdmmc::Error<SdError>> for FsError {
    fn from(e: embedded_sdmmc::Error<SdError>) -> Self {
        match e {
            embedded_sdmmc::Error::DeviceError(e) => FsError::Device(e),
            embedded_sdmmc::Error::FormatError(msg) => FsError::Format(msg),
            embedded_sdmmc::Error::NotFound => FsError::NotFound,
            other => {
                let mut msg = heapless::String::new();
                // Truncated on overflow, good enough for a log line
                let _ = write!(msg, "{:?}", other);
                FsError::Other(msg)
            }
        }
    }
}

/// Presents a [`BlockTransport`] as an `embedded-sdmmc` block device.
///
/// `embedded-sdmmc` is synchronous, so every sector transfer is driven to
/// completion in place. The transport checks its deadlines between polls and
/// never arms a timer, which keeps this safe inside an embassy task. A dead
/// card still ends in an error instead of a hang. [`Volume`] gives up the
/// executor after every volume manager call, which is a handful of sectors.
pub struct FsGlue<B: BlockTransport> {
    transport: RefCell<B>,
}

impl<B: BlockTransport> FsGlue<B> {
    pub fn new(transport: B) -> Self {
        Self {
            transport: RefCell::new(transport),
        }
    }

    pub fn into_inner(self) -> B {
        self.transport.into_inner()
    }
}

impl<B: BlockTransport> BlockDevice for FsGlue<B> {
    type Error = SdError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut transport = self.transport.borrow_mut();
        for (i, block) in blocks.iter_mut().enumerate() {
            let sector = start_block_idx.0 + i as u32;
            block_on(transport.read_block(sector, &mut block.contents))?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut transport = self.transport.borrow_mut();
        for (i, block) in blocks.iter().enumerate() {
            let sector = start_block_idx.0 + i as u32;
            block_on(transport.write_block(sector, &block.contents))?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.transport.borrow().sector_count()))
    }
}

/// Time source stamping every file with the same date.
///
/// The RTC is not part of the storage subsystem and record files carry their
/// date in the path, so directory entry timestamps are informational only.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            year: 2024,
            month: 1,
            day: 1,
        }
    }
}

impl TimeSource for FixedClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: self.year.saturating_sub(1970).min(255) as u8,
            zero_indexed_month: self.month.saturating_sub(1),
            zero_indexed_day: self.day.saturating_sub(1),
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdmmc::ram::RamCard;

    #[test]
    fn test_glue_reads_and_writes_through() {
        let card = RamCard::new(128);
        let mut transport = card.clone();
        block_on(transport.initialize()).expect("card is present");
        let glue = FsGlue::new(transport);

        let mut blocks = [Block::new(), Block::new()];
        blocks[0].contents[0] = 0x11;
        blocks[1].contents[511] = 0x22;
        glue.write(&blocks, BlockIdx(10)).expect("write should succeed");

        assert_eq!(card.block(10)[0], 0x11);
        assert_eq!(card.block(11)[511], 0x22);

        let mut back = [Block::new()];
        glue.read(&mut back, BlockIdx(11)).expect("read should succeed");
        assert_eq!(back[0].contents[511], 0x22);
        assert_eq!(glue.num_blocks().map(|c| c.0), Ok(128));
    }

    #[test]
    fn test_transport_errors_surface() {
        let card = RamCard::new(16);
        let glue = FsGlue::new(card.clone());
        let mut blocks = [Block::new()];
        assert_eq!(
            glue.read(&mut blocks, BlockIdx(0)),
            Err(SdError::NotInitialized)
        );
    }

    #[test]
    fn test_error_conversion() {
        let e: FsError = embedded_sdmmc::Error::DeviceError(SdError::Bus).into();
        assert_eq!(e, FsError::Device(SdError::Bus));
        assert!(!e.is_unresponsive());
        let e: FsError = embedded_sdmmc::Error::DeviceError(SdError::ReadTokenTimeout).into();
        assert!(e.is_unresponsive());
        let e: FsError = embedded_sdmmc::Error::<SdError>::NotFound.into();
        assert_eq!(e, FsError::NotFound);
    }
}
