//! SD card over an asynchronous SPI bus.
//!
//! Every byte exchange goes through the async [`SpiBus`], so the storage task
//! is suspended while a block is shifted out and other tasks keep running.
//! Each exchange and every polling loop has its own deadline; running past it
//! turns into an [`SdError`] instead of a hang.
//!
//! Deadlines are checked between polls rather than armed as embassy timers.
//! The filesystem glue drives block transfers from synchronous code, where
//! no executor waker is available to register with a timer queue.

use core::future::{Future, poll_fn};
use core::pin::pin;
use core::task::Poll;

use embassy_futures::yield_now;
use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::spi::SpiBus;
use log::{debug, info, warn};

use super::command::*;
use super::registers::{identity_from_cid, sector_count_from_csd};
use super::{BLOCK_LEN, BlockTransport, CardInfo, CardType, SdError, Sector};
use crate::config::SpiTimings;

/// Number of bytes polled for an R1 response after a command
const R1_POLL_BYTES: usize = 10;

/// CMD0 is repeated this often before the slot is declared empty
const GO_IDLE_ATTEMPTS: usize = 4;

/// An SPI bus that the card driver owns exclusively.
///
/// On top of plain transfers the driver needs to slow the clock down for
/// bring-up and to park the pins when the card is torn down.
pub trait SdBus: SpiBus<u8> {
    /// Switches the clock. A released bus reclaims its pins here.
    fn set_frequency(&mut self, hz: u32);

    /// Puts the bus pins into a safe state while no card is initialized.
    fn release(&mut self) {}
}

/// Chip select line of the card slot.
pub trait ChipSelect: OutputPin {
    /// Parks the line while no card is initialized. The next `set_low` or
    /// `set_high` drives it again.
    fn release(&mut self) {}
}

/// Polls `fut` until it completes or `timeout` has passed.
///
/// The task wakes itself after every pending poll, so this works under any
/// waker, including the no-op waker of `block_on`.
async fn with_deadline<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    let deadline = Instant::now() + timeout;
    let mut fut = pin!(fut);
    poll_fn(|cx| {
        if let Poll::Ready(output) = fut.as_mut().poll(cx) {
            return Poll::Ready(Some(output));
        }
        if Instant::now() >= deadline {
            return Poll::Ready(None);
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}

pub struct SdSpi<BUS, CS>
where
    BUS: SdBus,
    CS: ChipSelect,
{
    bus: BUS,
    cs: CS,
    timings: SpiTimings,
    card_type: Option<CardType>,
    sectors: u32,
}

impl<BUS, CS> SdSpi<BUS, CS>
where
    BUS: SdBus,
    CS: ChipSelect,
{
    pub fn new(bus: BUS, cs: CS, timings: SpiTimings) -> Self {
        Self {
            bus,
            cs,
            timings,
            card_type: None,
            sectors: 0,
        }
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    /// Gives the bus and chip select back, e.g. to share the bus after shutdown.
    pub fn release(self) -> (BUS, CS) {
        (self.bus, self.cs)
    }

    fn select(&mut self) -> Result<(), SdError> {
        self.cs.set_low().map_err(|_| SdError::ChipSelect)
    }

    async fn deselect(&mut self) -> Result<(), SdError> {
        self.cs.set_high().map_err(|_| SdError::ChipSelect)?;
        // One extra byte so the card releases MISO
        self.read_byte().await.map(|_| ())
    }

    async fn transfer(&mut self, buf: &mut [u8]) -> Result<(), SdError> {
        match with_deadline(self.timings.transfer, self.bus.transfer_in_place(buf)).await {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(SdError::Bus),
            None => Err(SdError::TransferTimeout),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), SdError> {
        match with_deadline(self.timings.transfer, self.bus.write(buf)).await {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(SdError::Bus),
            None => Err(SdError::TransferTimeout),
        }
    }

    async fn read_byte(&mut self) -> Result<u8, SdError> {
        let mut buf = [0xFF];
        self.transfer(&mut buf).await?;
        Ok(buf[0])
    }

    /// Polls until the card stops holding the bus low. Returns false on timeout.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<bool, SdError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_byte().await? == 0xFF {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            yield_now().await;
        }
    }

    /// Sends a command and returns its R1 byte, 0xFF if the card never answered.
    async fn command(&mut self, cmd: u8, arg: u32) -> Result<u8, SdError> {
        if !self.wait_ready(self.timings.response).await? && cmd != CMD0 {
            debug!("sd: card busy before CMD{}", cmd);
        }
        self.write(&frame(cmd, arg)).await?;
        for _ in 0..R1_POLL_BYTES {
            let r1 = self.read_byte().await?;
            if r1 & R1_START_MASK == 0 {
                return Ok(r1);
            }
        }
        Ok(0xFF)
    }

    async fn app_command(&mut self, cmd: u8, arg: u32) -> Result<u8, SdError> {
        self.command(CMD55, 0).await?;
        self.command(cmd, arg).await
    }

    /// Repeats ACMD41 (or CMD1 for MMC) until the card leaves the idle state.
    async fn wait_op_cond(&mut self, app: bool, arg: u32) -> Result<(), SdError> {
        let deadline = Instant::now() + self.timings.op_cond;
        loop {
            let r1 = if app {
                self.app_command(ACMD41, arg).await?
            } else {
                self.command(CMD1, arg).await?
            };
            if r1 == 0 {
                return Ok(());
            }
            if r1 & !R1_IDLE != 0 || Instant::now() >= deadline {
                return Err(SdError::OpCondTimeout);
            }
            yield_now().await;
        }
    }

    async fn wait_data_token(&mut self) -> Result<(), SdError> {
        let deadline = Instant::now() + self.timings.data_token;
        loop {
            match self.read_byte().await? {
                0xFF => {}
                DATA_START_BLOCK => return Ok(()),
                token => return Err(SdError::ReadToken(token)),
            }
            if Instant::now() >= deadline {
                return Err(SdError::ReadTokenTimeout);
            }
            yield_now().await;
        }
    }

    async fn read_register(&mut self, cmd: u8) -> Result<[u8; 16], SdError> {
        if self.command(cmd, 0).await? != 0 {
            return Err(SdError::ReadCommand(cmd));
        }
        self.wait_data_token().await?;
        let mut reg = [0xFF; 16];
        self.transfer(&mut reg).await?;
        let mut crc = [0xFF; 2];
        self.transfer(&mut crc).await?;
        Ok(reg)
    }

    async fn bring_up(&mut self) -> Result<CardInfo, SdError> {
        let mut r1 = 0xFF;
        for _ in 0..GO_IDLE_ATTEMPTS {
            r1 = self.command(CMD0, 0).await?;
            if r1 == R1_IDLE {
                break;
            }
        }
        match r1 {
            R1_IDLE => {}
            0xFF => return Err(SdError::NoResponse),
            other => return Err(SdError::GoIdle(other)),
        }

        let card_type = if self.command(CMD8, IF_COND_ARG).await? & R1_ILLEGAL_COMMAND != 0 {
            // Version 1 card or MMC, both byte addressed
            let card_type = if self.wait_op_cond(true, 0).await.is_ok() {
                CardType::SdV1
            } else {
                self.wait_op_cond(false, 0).await?;
                CardType::Mmc
            };
            if self.command(CMD16, BLOCK_LEN as u32).await? != 0 {
                return Err(SdError::SetBlockLen);
            }
            card_type
        } else {
            let mut r7 = [0xFF; 4];
            self.transfer(&mut r7).await?;
            if r7[2] & 0x0F != 0x01 || r7[3] != 0xAA {
                return Err(SdError::InterfaceCondition);
            }
            self.wait_op_cond(true, HCS).await?;
            if self.command(CMD58, 0).await? != 0 {
                return Err(SdError::ReadOcr);
            }
            let mut ocr = [0xFF; 4];
            self.transfer(&mut ocr).await?;
            if ocr[0] & OCR_CCS != 0 {
                CardType::SdHc
            } else {
                CardType::SdV2
            }
        };

        let csd = self.read_register(CMD9).await.map_err(|_| SdError::ReadCsd)?;
        let sector_count = sector_count_from_csd(&csd)?;
        let cid = self.read_register(CMD10).await.map_err(|_| SdError::ReadCid)?;
        let (manufacturer_id, product_rev, product_name) = identity_from_cid(&cid);

        Ok(CardInfo {
            sector_size: BLOCK_LEN as u16,
            sector_count,
            card_type,
            manufacturer_id,
            product_rev,
            product_name,
        })
    }

    fn address(&self, sector: u32) -> Result<u32, SdError> {
        let card_type = self.card_type.ok_or(SdError::NotInitialized)?;
        if sector >= self.sectors {
            return Err(SdError::OutOfRange(sector));
        }
        Ok(if card_type.block_addressed() {
            sector
        } else {
            sector << 9
        })
    }

    async fn read_selected(&mut self, address: u32, buf: &mut Sector) -> Result<(), SdError> {
        let r1 = self.command(CMD17, address).await?;
        if r1 != 0 {
            return Err(SdError::ReadCommand(r1));
        }
        self.wait_data_token().await?;
        buf.fill(0xFF);
        self.transfer(buf).await?;
        let mut crc = [0xFF; 2];
        self.transfer(&mut crc).await
    }

    async fn write_selected(&mut self, address: u32, buf: &Sector) -> Result<(), SdError> {
        let r1 = self.command(CMD24, address).await?;
        if r1 != 0 {
            return Err(SdError::WriteCommand(r1));
        }
        self.write(&[DATA_START_BLOCK]).await?;
        self.write(buf).await?;
        self.write(&[0xFF, 0xFF]).await?;

        let response = self.read_byte().await?;
        if response & DATA_RESPONSE_MASK != DATA_RESPONSE_ACCEPTED {
            return Err(SdError::WriteRejected(response));
        }

        let deadline = Instant::now() + self.timings.write_busy;
        while self.read_byte().await? == 0x00 {
            if Instant::now() >= deadline {
                return Err(SdError::WriteBusyTimeout);
            }
            yield_now().await;
        }
        Ok(())
    }
}

impl<BUS, CS> BlockTransport for SdSpi<BUS, CS>
where
    BUS: SdBus,
    CS: ChipSelect,
{
    async fn initialize(&mut self) -> Result<CardInfo, SdError> {
        self.card_type = None;
        self.sectors = 0;
        self.bus.set_frequency(self.timings.init_hz);

        // 80 clocks with CS high so the card enters SPI mode
        self.cs.set_high().map_err(|_| SdError::ChipSelect)?;
        let mut dummy = [0xFF; 10];
        self.transfer(&mut dummy).await?;

        self.select()?;
        let result = self.bring_up().await;
        self.deselect().await?;

        match result {
            Ok(info) => {
                self.card_type = Some(info.card_type);
                self.sectors = info.sector_count;
                self.bus.set_frequency(self.timings.data_hz);
                info!(
                    "sd: {} card, {} sectors, mid {:#04x}",
                    info.card_type.label(),
                    info.sector_count,
                    info.manufacturer_id
                );
                Ok(info)
            }
            Err(e) => {
                warn!("sd: bring-up failed: {}", e);
                Err(e)
            }
        }
    }

    async fn read_block(&mut self, sector: u32, buf: &mut Sector) -> Result<(), SdError> {
        let address = self.address(sector)?;
        self.select()?;
        let result = self.read_selected(address, buf).await;
        self.deselect().await?;
        result
    }

    async fn write_block(&mut self, sector: u32, buf: &Sector) -> Result<(), SdError> {
        let address = self.address(sector)?;
        self.select()?;
        let result = self.write_selected(address, buf).await;
        self.deselect().await?;
        result
    }

    async fn deinitialize(&mut self) {
        self.card_type = None;
        self.sectors = 0;
        let _ = self.cs.set_high();
        self.cs.release();
        self.bus.release();
    }

    fn sector_count(&self) -> u32 {
        self.sectors
    }
}
