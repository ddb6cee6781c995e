//! In-memory card for the simulator and the tests.
//!
//! The card, its card-detect switch and the test code all share one state
//! cell, so a test can pull the card or make writes fail while the
//! supervisor owns the transport.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::RefCell;
use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin};

use super::{BLOCK_LEN, BlockTransport, CardInfo, CardType, SdError, Sector};

struct RamCardState {
    sectors: u32,
    blocks: BTreeMap<u32, Box<Sector>>,
    present: bool,
    initialized: bool,
    failing_reads: u32,
    read_error: SdError,
    failing_writes: u32,
    initializations: u32,
    block_reads: u32,
    block_writes: u32,
}

/// Sparse in-memory card, blocks that were never written read as zero.
#[derive(Clone)]
pub struct RamCard {
    state: Rc<RefCell<RamCardState>>,
}

impl RamCard {
    pub fn new(sectors: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(RamCardState {
                sectors,
                blocks: BTreeMap::new(),
                present: true,
                initialized: false,
                failing_reads: 0,
                read_error: SdError::ReadTokenTimeout,
                failing_writes: 0,
                initializations: 0,
                block_reads: 0,
                block_writes: 0,
            })),
        }
    }

    /// Card-detect switch wired to this card, active low.
    pub fn detect_pin(&self) -> RamCardDetect {
        RamCardDetect {
            state: self.state.clone(),
        }
    }

    /// Inserts or removes the card. Removal loses the SPI-mode state.
    pub fn set_present(&self, present: bool) {
        let mut state = self.state.borrow_mut();
        state.present = present;
        if !present {
            state.initialized = false;
        }
    }

    /// The next `count` block reads time out.
    pub fn fail_reads(&self, count: u32) {
        self.fail_reads_with(count, SdError::ReadTokenTimeout);
    }

    /// The next `count` block reads fail with `error`.
    pub fn fail_reads_with(&self, count: u32, error: SdError) {
        let mut state = self.state.borrow_mut();
        state.failing_reads = count;
        state.read_error = error;
    }

    /// The next `count` block writes fail.
    pub fn fail_writes(&self, count: u32) {
        self.state.borrow_mut().failing_writes = count;
    }

    pub fn initializations(&self) -> u32 {
        self.state.borrow().initializations
    }

    pub fn block_reads(&self) -> u32 {
        self.state.borrow().block_reads
    }

    pub fn block_writes(&self) -> u32 {
        self.state.borrow().block_writes
    }

    /// Wipes every block, like a card fresh out of the package.
    pub fn erase_all(&self) {
        self.state.borrow_mut().blocks.clear();
    }

    /// Copy of one block, for inspecting what was written.
    pub fn block(&self, sector: u32) -> Sector {
        self.state
            .borrow()
            .blocks
            .get(&sector)
            .map(|b| **b)
            .unwrap_or([0u8; BLOCK_LEN])
    }

    fn check(state: &RamCardState, sector: u32) -> Result<(), SdError> {
        if !state.present {
            return Err(SdError::NoResponse);
        }
        if !state.initialized {
            return Err(SdError::NotInitialized);
        }
        if sector >= state.sectors {
            return Err(SdError::OutOfRange(sector));
        }
        Ok(())
    }
}

impl BlockTransport for RamCard {
    async fn initialize(&mut self) -> Result<CardInfo, SdError> {
        let mut state = self.state.borrow_mut();
        if !state.present {
            return Err(SdError::NoResponse);
        }
        state.initialized = true;
        state.initializations += 1;
        Ok(CardInfo {
            sector_size: BLOCK_LEN as u16,
            sector_count: state.sectors,
            card_type: CardType::SdHc,
            manufacturer_id: 0x00,
            product_rev: 0x10,
            product_name: *b"RAMSD",
        })
    }

    async fn read_block(&mut self, sector: u32, buf: &mut Sector) -> Result<(), SdError> {
        let mut state = self.state.borrow_mut();
        Self::check(&state, sector)?;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(state.read_error);
        }
        state.block_reads += 1;
        match state.blocks.get(&sector) {
            Some(block) => buf.copy_from_slice(&block[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_block(&mut self, sector: u32, buf: &Sector) -> Result<(), SdError> {
        let mut state = self.state.borrow_mut();
        Self::check(&state, sector)?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(SdError::WriteRejected(0x0D));
        }
        state.block_writes += 1;
        if buf.iter().all(|&b| b == 0) {
            state.blocks.remove(&sector);
        } else {
            state.blocks.insert(sector, Box::new(*buf));
        }
        Ok(())
    }

    async fn deinitialize(&mut self) {
        self.state.borrow_mut().initialized = false;
    }

    fn sector_count(&self) -> u32 {
        let state = self.state.borrow();
        if state.initialized { state.sectors } else { 0 }
    }
}

/// Card-detect input of a [`RamCard`], low while the card is inserted.
pub struct RamCardDetect {
    state: Rc<RefCell<RamCardState>>,
}

impl ErrorType for RamCardDetect {
    type Error = Infallible;
}

impl InputPin for RamCardDetect {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.state.borrow().present)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.state.borrow().present)
    }
}
