//! Desktop simulator for the emstore storage subsystem.
//!
//! Runs the real supervisor against an in-memory SD card. A producer pushes
//! one synthetic day of wallbox and meter samples, then a consumer reads the
//! day back through the chunk mailboxes the way the protocol layer would.
//! Halfway through, the card is pulled and re-inserted to exercise recovery.
//!
//! # Options
//!
//! | Argument      | Effect                                          |
//! |---------------|-------------------------------------------------|
//! | `--formatted` | Start from a card that already carries a volume |
//!
//! Set `RUST_LOG=debug` to see every slot write.

use embassy_futures::block_on;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use log::{info, warn};

use emstore_core::fs::{FixedClock, FormatError, format_card};
use emstore_core::record::NO_DATA;
use emstore_core::sdmmc::BlockTransport;
use emstore_core::sdmmc::ram::RamCard;
use emstore_core::{
    DataStatus, Date, EnergyManager5MinSlot, EnergyManagerDailySlot, RecordClass, SampleTime,
    SlotRecord, StorageConfig, StorageLink, StorageSubsystem, Wallbox5MinSlot,
};

/// 32 MiB card, formatted as FAT16
const CARD_SECTORS: u32 = 64 * 1024;

const WALLBOX_ID: u32 = 0x2A1B;

/// Day the synthetic samples belong to
const DAY: Date = Date::new(2024, 6, 21);

/// Give up on a step after this long
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Charging power of a wallbox that charges from 18:00 to 22:00.
fn wallbox_power(hour: u8, minute: u8) -> u16 {
    match hour {
        18..=21 => 11_000 - u16::from(minute) * 10,
        _ => 0,
    }
}

/// Grid power: a midday solar dip below zero and an evening peak.
fn grid_power(hour: u8, minute: u8) -> i32 {
    let t = i32::from(hour) * 60 + i32::from(minute);
    match hour {
        10..=15 => -2_000 - (t - 600) * 5,
        18..=21 => 12_000,
        _ => 400,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            warn!("simulator: timed out waiting for {}", what);
            return false;
        }
        Timer::after_millis(1).await;
    }
    true
}

/// Pushes until the queue accepts the sample.
async fn push_with_backpressure(mut push: impl FnMut() -> DataStatus) -> DataStatus {
    loop {
        match push() {
            DataStatus::QueueFull => Timer::after_millis(1).await,
            status => return status,
        }
    }
}

async fn produce_day(link: &StorageLink) -> usize {
    let mut pushed = 0;
    for slot in 0..288u16 {
        let (hour, minute) = ((slot / 12) as u8, (slot % 12 * 5) as u8);
        let at: SampleTime = DAY.at(hour, minute);

        let wallbox = Wallbox5MinSlot {
            flags: u8::from((18..22).contains(&hour)),
            power: wallbox_power(hour, minute),
        };
        let meter = EnergyManager5MinSlot {
            flags: 0,
            power_grid: grid_power(hour, minute),
            power_general: [0, 0, 0, 0, 0, i32::from(wallbox.power)],
        };

        for status in [
            push_with_backpressure(|| link.push_wallbox_5min(WALLBOX_ID, at, wallbox)).await,
            push_with_backpressure(|| link.push_energy_manager_5min(at, meter)).await,
        ] {
            if status == DataStatus::Ok {
                pushed += 1;
            } else {
                warn!("simulator: sample at {:02}:{:02} rejected: {:?}", hour, minute, status);
            }
        }
    }

    let charged: u32 = (0..288u16)
        .map(|slot| u32::from(wallbox_power((slot / 12) as u8, (slot % 12 * 5) as u8)) / 12)
        .sum();
    let totals = EnergyManagerDailySlot {
        energy_grid_in: 31_500,
        energy_grid_out: 9_800,
        energy_general_in: [0, 0, 0, 0, 0, charged],
        energy_general_out: [0; 6],
    };
    if push_with_backpressure(|| link.push_wallbox_daily(WALLBOX_ID, DAY, charged)).await
        == DataStatus::Ok
    {
        pushed += 1;
    }
    if push_with_backpressure(|| link.push_energy_manager_daily(DAY, totals)).await
        == DataStatus::Ok
    {
        pushed += 1;
    }
    pushed
}

/// Issues a read request and collects its chunks the way the protocol layer does.
async fn read_back(
    link: &StorageLink,
    class: RecordClass,
    request: impl FnOnce() -> DataStatus,
) -> Option<Vec<u8>> {
    let status = request();
    if status != DataStatus::Ok {
        warn!("simulator: {} request rejected: {:?}", class.label(), status);
        return None;
    }

    let mut bytes = Vec::new();
    let mut chunks = 0;
    let deadline = Instant::now() + STEP_TIMEOUT;
    while link.is_reading(class) && Instant::now() < deadline {
        if let Some(chunk) = link.poll_chunk(class) {
            if chunk.offset as usize != bytes.len() {
                warn!("simulator: chunk at {} out of order", chunk.offset);
                return None;
            }
            bytes.extend_from_slice(&chunk.payload);
            chunks += 1;
            link.acknowledge_chunk(class);
        }
        Timer::after_millis(1).await;
    }
    info!(
        "simulator: {} read back in {} chunks, {} bytes",
        class.label(),
        chunks,
        bytes.len()
    );
    Some(bytes)
}

async fn scenario(link: &StorageLink, card: &RamCard) -> bool {
    if !wait_until("the card to mount", || link.status().is_ok()).await {
        return false;
    }
    if let Some(info) = link.card_info() {
        info!(
            "simulator: {} card {:?}, {} sectors, boot {:?}",
            info.card_type.label(),
            std::str::from_utf8(&info.product_name).unwrap_or("?"),
            info.sector_count,
            link.boot_count()
        );
    }

    let mut settings = [0u8; 64];
    settings[..8].copy_from_slice(b"EMSTORE1");
    link.set_config_page(0, &settings);

    let started = Instant::now();
    let pushed = produce_day(link).await;
    let drained = wait_until("the queues to drain", || {
        RecordClass::ALL.iter().all(|&class| link.queued(class) == 0)
    })
    .await;
    info!(
        "simulator: {} samples pushed and written in {} ms",
        pushed,
        started.elapsed().as_millis()
    );
    if !drained {
        return false;
    }

    info!("simulator: pulling the card");
    card.set_present(false);
    wait_until("the removal to be noticed", || !link.status().is_ok()).await;
    info!("simulator: status {:?}", link.status());
    card.set_present(true);
    if !wait_until("the card to come back", || link.status().is_ok()).await {
        return false;
    }
    info!("simulator: card back, boot {:?}", link.boot_count());

    let Some(wallbox) = read_back(link, RecordClass::Wallbox5Min, || {
        link.request_wallbox_5min(WALLBOX_ID, DAY.at(0, 0), 288)
    })
    .await
    else {
        return false;
    };
    let slot_len = RecordClass::Wallbox5Min.slot_len();
    let mut mismatches = 0;
    for (slot, raw) in wallbox.chunks(slot_len).enumerate() {
        let record = Wallbox5MinSlot::read_from(raw);
        let (hour, minute) = ((slot / 12) as u8, (slot % 12 * 5) as u8);
        if record.flags & NO_DATA != 0 || record.power != wallbox_power(hour, minute) {
            mismatches += 1;
        }
    }

    let Some(months) = read_back(link, RecordClass::EnergyManagerDaily, || {
        link.request_energy_manager_daily(Date::new(DAY.year, DAY.month, 1), 30)
    })
    .await
    else {
        return false;
    };
    let days_with_data = months
        .chunks(RecordClass::EnergyManagerDaily.slot_len())
        .filter(|raw| EnergyManagerDailySlot::read_from(raw).has_data())
        .count();

    info!(
        "simulator: {} wallbox slots differ, {} day(s) of meter totals in June",
        mismatches, days_with_data
    );
    info!(
        "simulator: config page 0 = {:?}, errors {}",
        link.config_page(0).map(|p| std::str::from_utf8(&p[..8]).unwrap_or("?").to_owned()),
        link.error_count()
    );
    mismatches == 0 && days_with_data == 1
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let preformat = std::env::args().any(|arg| arg == "--formatted");
    let card = RamCard::new(CARD_SECTORS);
    if preformat {
        let mut transport = card.clone();
        let formatted: Result<_, FormatError> = block_on(async {
            transport.initialize().await?;
            format_card(&mut transport).await
        });
        match formatted {
            Ok(layout) => info!("simulator: card preformatted: {:?}", layout),
            Err(e) => warn!("simulator: preformat failed: {}", e),
        }
    }

    let link = StorageLink::new();
    let config = StorageConfig {
        config_flush_delay_ms: 2_000,
        ..StorageConfig::default()
    };
    let clock = FixedClock {
        year: DAY.year,
        month: DAY.month,
        day: DAY.day,
    };
    let mut storage = StorageSubsystem::new(&link, config, card.clone(), card.detect_pin(), clock);

    let passed = match block_on(select(storage.run(), scenario(&link, &card))) {
        Either::First(never) => never,
        Either::Second(passed) => passed,
    };

    if passed {
        info!("simulator: all data read back intact");
    } else {
        warn!("simulator: scenario failed");
        std::process::exit(1);
    }
}
