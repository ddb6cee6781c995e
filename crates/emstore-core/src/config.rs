//! Tunables of the storage subsystem.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Timing and threshold settings.
///
/// All durations are plain milliseconds so the struct can be stored and
/// shipped around without caring about the time driver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Minimum spacing between two card initialization attempts
    pub init_retry_ms: u64,
    /// How long a posted chunk may stay unacknowledged before the read session aborts
    pub chunk_ack_timeout_ms: u64,
    /// Time after the last RAM change before a config page is written
    pub config_flush_delay_ms: u64,
    /// Read/write error count above which the card is torn down and re-initialized
    pub error_threshold: u32,
    /// Sleep between two supervisor turns when nothing woke it up
    pub tick_period_ms: u64,
    /// SPI clock during bring-up
    pub init_spi_hz: u32,
    /// SPI clock once the card is initialized
    pub data_spi_hz: u32,
    /// Wait for the card to release the bus before a command
    pub response_timeout_ms: u64,
    /// Wait for the start-of-data token of a read
    pub data_token_timeout_ms: u64,
    /// ACMD41/CMD1 polling window
    pub op_cond_timeout_ms: u64,
    /// Busy wait after a block write
    pub write_busy_timeout_ms: u64,
    /// Upper bound for one SPI exchange
    pub transfer_timeout_ms: u64,
    /// Card detect switch pulls the pin low when a card is inserted
    pub card_detect_active_low: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            init_retry_ms: 1000,
            chunk_ack_timeout_ms: 1000,
            config_flush_delay_ms: 10 * 60 * 1000,
            error_threshold: 10,
            tick_period_ms: 1,
            init_spi_hz: 400_000,
            data_spi_hz: 12_000_000,
            response_timeout_ms: 100,
            data_token_timeout_ms: 100,
            op_cond_timeout_ms: 1000,
            write_busy_timeout_ms: 500,
            transfer_timeout_ms: 100,
            card_detect_active_low: true,
        }
    }
}

impl StorageConfig {
    pub fn init_retry(&self) -> Duration {
        Duration::from_millis(self.init_retry_ms)
    }

    pub fn chunk_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_ack_timeout_ms)
    }

    pub fn config_flush_delay(&self) -> Duration {
        Duration::from_millis(self.config_flush_delay_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

/// The subset of [`StorageConfig`] the SPI engine needs.
#[derive(Debug, Clone, Copy)]
pub struct SpiTimings {
    pub init_hz: u32,
    pub data_hz: u32,
    pub response: Duration,
    pub data_token: Duration,
    pub op_cond: Duration,
    pub write_busy: Duration,
    pub transfer: Duration,
}

impl From<&StorageConfig> for SpiTimings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            init_hz: config.init_spi_hz,
            data_hz: config.data_spi_hz,
            response: Duration::from_millis(config.response_timeout_ms),
            data_token: Duration::from_millis(config.data_token_timeout_ms),
            op_cond: Duration::from_millis(config.op_cond_timeout_ms),
            write_busy: Duration::from_millis(config.write_busy_timeout_ms),
            transfer: Duration::from_millis(config.transfer_timeout_ms),
        }
    }
}
