//! SD card block transport.
//!
//! The transport speaks the SPI-mode SD protocol one 512-byte sector at a
//! time. Everything above it (filesystem glue, supervisor) only sees the
//! [`BlockTransport`] trait so the card can be swapped for an in-memory
//! stand-in on the host.

pub mod command;
#[cfg(any(test, feature = "ram-card"))]
pub mod ram;
pub mod registers;
pub mod spi;

use thiserror_no_std::Error;

pub use registers::{CardInfo, CardType};
pub use spi::{ChipSelect, SdBus, SdSpi};

/// Size of one SD sector and of one filesystem block
pub const BLOCK_LEN: usize = 512;

/// One raw sector
pub type Sector = [u8; BLOCK_LEN];

/// Transport level failures.
///
/// Bring-up failures carry the step that failed so "no card in the slot"
/// (`NoResponse`) can be told apart from "a card answered and then misbehaved".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    #[error("no response to CMD0, card missing")]
    NoResponse,
    #[error("CMD0 did not enter idle state (r1 = {0:#04x})")]
    GoIdle(u8),
    #[error("CMD8 interface condition mismatch")]
    InterfaceCondition,
    #[error("card stayed busy during ACMD41/CMD1")]
    OpCondTimeout,
    #[error("CMD58 OCR read failed")]
    ReadOcr,
    #[error("CMD16 set block length failed")]
    SetBlockLen,
    #[error("CMD9 CSD read failed")]
    ReadCsd,
    #[error("CMD10 CID read failed")]
    ReadCid,
    #[error("unsupported card or CSD layout")]
    UnsupportedCard,
    #[error("CMD17 rejected (r1 = {0:#04x})")]
    ReadCommand(u8),
    #[error("timed out waiting for the start-of-data token")]
    ReadTokenTimeout,
    #[error("unexpected data token {0:#04x}")]
    ReadToken(u8),
    #[error("CMD24 rejected (r1 = {0:#04x})")]
    WriteCommand(u8),
    #[error("data response rejected the block ({0:#04x})")]
    WriteRejected(u8),
    #[error("card stayed busy after a block write")]
    WriteBusyTimeout,
    #[error("SPI transfer timed out")]
    TransferTimeout,
    #[error("SPI bus error")]
    Bus,
    #[error("chip select pin error")]
    ChipSelect,
    #[error("card not initialized")]
    NotInitialized,
    #[error("sector {0} outside of the card")]
    OutOfRange(u32),
}

impl SdError {
    /// True if the card stopped answering, as opposed to answering with an error.
    pub fn is_unresponsive(&self) -> bool {
        matches!(
            self,
            SdError::NoResponse
                | SdError::OpCondTimeout
                | SdError::ReadTokenTimeout
                | SdError::WriteBusyTimeout
                | SdError::TransferTimeout
        )
    }
}

/// Block level access to an SD card.
///
/// Exactly one caller (the storage supervisor) owns the transport, so the
/// methods take `&mut self` and there is never more than one block operation
/// in flight.
#[allow(async_fn_in_trait)]
pub trait BlockTransport {
    /// Runs the card bring-up sequence and reports what was found.
    async fn initialize(&mut self) -> Result<CardInfo, SdError>;

    /// Reads one sector.
    async fn read_block(&mut self, sector: u32, buf: &mut Sector) -> Result<(), SdError>;

    /// Writes one sector and waits until the card finished programming it.
    async fn write_block(&mut self, sector: u32, buf: &Sector) -> Result<(), SdError>;

    /// Tears the card down and puts the bus into a safe idle state.
    async fn deinitialize(&mut self);

    /// Sector count of the initialized card, zero before `initialize`.
    fn sector_count(&self) -> u32;
}
