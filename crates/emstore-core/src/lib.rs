//! Hardware-independent core of the energy manager storage subsystem
//!
//! This crate owns everything between the SD card and the protocol layer:
//! the SPI card driver, the FAT volume, the on-disk record model, the
//! write-behind queues, the chunked read sessions and the supervisor task
//! that drives them.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod calendar;
pub mod config;
pub mod config_pages;
pub mod fs;
pub mod health;
pub mod link;
pub mod queue;
pub mod record;
pub mod sdmmc;
pub mod session;
pub mod status;
pub mod supervisor;

pub use calendar::{Date, SampleTime};
pub use config::StorageConfig;
pub use link::{FORMAT_PASSWORD, StorageLink};
pub use record::{
    EnergyManager5MinSlot, EnergyManagerDailySlot, RecordClass, SlotRecord, Wallbox5MinSlot,
    WallboxDailySlot,
};
pub use session::Chunk;
pub use status::{CardStatus, DataStatus, FilesystemStatus, FormatStatus, StorageStatus};
pub use supervisor::StorageSubsystem;
