#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Flex, Input, InputConfig, Pull};
use esp_hal::timer::timg::TimerGroup;
use log::{LevelFilter, error, info};

use emstore_core::config::SpiTimings;
use emstore_core::fs::FixedClock;
use emstore_core::sdmmc::SdSpi;
use emstore_core::{RecordClass, StorageConfig, StorageLink, StorageSubsystem};
use emstore_firmware::BoardStorage;
use emstore_firmware::sd_bus::{EspChipSelect, EspSdBus};

/// Interval between two status lines on the log
const HEARTBEAT: Duration = Duration::from_secs(10);

/// Shared with the protocol layer, which pushes samples and pulls chunks
static STORAGE: StorageLink = StorageLink::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[embassy_executor::task]
async fn storage_task(mut storage: BoardStorage) {
    storage.run().await
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!(LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 32768);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    let storage_config = StorageConfig::default();

    // SD SPI wiring: CS=GPIO10, MOSI=GPIO11, SCK=GPIO12, MISO=GPIO13, CD=GPIO9
    let bus = EspSdBus::new(
        peripherals.SPI2,
        peripherals.GPIO12,
        peripherals.GPIO11,
        peripherals.GPIO13,
        storage_config.init_spi_hz,
    );
    let cs = EspChipSelect::new(Flex::new(peripherals.GPIO10));
    let card_detect = Input::new(
        peripherals.GPIO9,
        InputConfig::default().with_pull(Pull::Up),
    );

    let card = SdSpi::new(bus, cs, SpiTimings::from(&storage_config));
    let storage: BoardStorage = StorageSubsystem::new(
        &STORAGE,
        storage_config,
        card,
        card_detect,
        FixedClock::default(),
    );
    match storage_task(storage) {
        Ok(token) => spawner.spawn(token),
        Err(e) => error!("storage task not spawned: {:?}", e),
    }

    loop {
        let status = STORAGE.status();
        let queued: usize = RecordClass::ALL
            .iter()
            .map(|&class| STORAGE.queued(class))
            .sum();
        info!(
            "storage: card {:?}, fs {:?}, errors {}, boots {:?}, queued {}",
            status.card,
            status.filesystem,
            STORAGE.error_count(),
            STORAGE.boot_count(),
            queued
        );
        Timer::after(HEARTBEAT).await;
    }
}
