//! ESP32-S3 firmware-specific modules for the emstore storage subsystem
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: the esp-hal SPI binding of the SD card driver and the concrete
//! types of the storage task.

#![no_std]

pub mod sd_bus;

use esp_hal::gpio::Input;

use emstore_core::fs::FixedClock;
use emstore_core::sdmmc::SdSpi;
use emstore_core::StorageSubsystem;

use crate::sd_bus::{EspChipSelect, EspSdBus};

/// The storage task as wired on the board.
pub type BoardStorage = StorageSubsystem<
    'static,
    SdSpi<EspSdBus, EspChipSelect>,
    Input<'static>,
    FixedClock,
>;
