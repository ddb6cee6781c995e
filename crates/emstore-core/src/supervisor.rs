//! The storage task.
//!
//! [`StorageSubsystem`] owns the card transport, the mounted volume and the
//! paging state of the read sessions. Each [`StorageSubsystem::tick`] checks
//! card presence, escalates or retries initialization, and then does a
//! bounded amount of work: one queued sample and one read chunk per record
//! class plus any due configuration page. The volume yields after every
//! filesystem call, so the rest of the firmware keeps running in between.

use embassy_futures::select::select;
use embassy_time::{Instant, Timer};
use embedded_hal::digital::InputPin;
use embedded_sdmmc::TimeSource;
use log::{debug, info, warn};

use crate::config::StorageConfig;
use crate::config_pages::{CONFIG_PAGE_LEN, CONFIG_PAGES};
use crate::fs::{FsError, MountFailure, Volume, format_card};
use crate::health::Health;
use crate::link::{
    ENERGY_MANAGER_5MIN_QUEUE, ENERGY_MANAGER_DAILY_QUEUE, LinkState, StorageLink,
    WALLBOX_5MIN_QUEUE, WALLBOX_DAILY_QUEUE,
};
use crate::queue::WriteQueue;
use crate::record::{
    EnergyManager5MinSlot, EnergyManagerDailySlot, MAX_CHUNK_LEN, RecordClass, SlotRecord,
    Wallbox5MinSlot, WallboxDailySlot, path_for,
};
use crate::sdmmc::{BlockTransport, CardInfo};
use crate::session::{Chunk, GetState, PagingSession};
use crate::status::{CardStatus, FilesystemStatus, StorageStatus};

/// Large enough for the biggest slot
const SLOT_BUF_LEN: usize = 64;

/// What the supervisor currently holds the card as.
enum Medium<B: BlockTransport, T: TimeSource> {
    Unmounted { transport: B, clock: T },
    Mounted(Volume<B, T>),
}

fn wallbox_5min(s: &mut LinkState) -> &mut WriteQueue<Wallbox5MinSlot, WALLBOX_5MIN_QUEUE> {
    &mut s.wallbox_5min
}

fn wallbox_daily(s: &mut LinkState) -> &mut WriteQueue<WallboxDailySlot, WALLBOX_DAILY_QUEUE> {
    &mut s.wallbox_daily
}

fn energy_manager_5min(
    s: &mut LinkState,
) -> &mut WriteQueue<EnergyManager5MinSlot, ENERGY_MANAGER_5MIN_QUEUE> {
    &mut s.energy_manager_5min
}

fn energy_manager_daily(
    s: &mut LinkState,
) -> &mut WriteQueue<EnergyManagerDailySlot, ENERGY_MANAGER_DAILY_QUEUE> {
    &mut s.energy_manager_daily
}

pub struct StorageSubsystem<'a, B, D, T>
where
    B: BlockTransport,
    D: InputPin,
    T: TimeSource,
{
    link: &'a StorageLink,
    config: StorageConfig,
    card_detect: D,
    health: Health,
    /// Only `None` while a transition is in progress
    medium: Option<Medium<B, T>>,
    sessions: [Option<PagingSession>; 4],
    next_init_at: Instant,
}

impl<'a, B, D, T> StorageSubsystem<'a, B, D, T>
where
    B: BlockTransport,
    D: InputPin,
    T: TimeSource,
{
    pub fn new(
        link: &'a StorageLink,
        config: StorageConfig,
        transport: B,
        card_detect: D,
        clock: T,
    ) -> Self {
        Self {
            link,
            config,
            card_detect,
            health: Health::Ready,
            medium: Some(Medium::Unmounted { transport, clock }),
            sessions: [None; 4],
            next_init_at: Instant::from_ticks(0),
        }
    }

    /// Runs the supervisor forever, one turn per tick period or wake-up.
    pub async fn run(&mut self) -> ! {
        info!("storage: supervisor started");
        loop {
            self.tick().await;
            select(Timer::after(self.config.tick_period()), self.link.wake.wait()).await;
        }
    }

    /// One supervisor turn.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let present = self.card_present();

        if self.link.status().is_ok() && !present {
            warn!("storage: card removed");
            self.health.force_reinit();
        }
        if self.is_mounted() && self.link.with(|s| s.format_requested) {
            info!("storage: format requested");
            self.health.force_reinit();
        }

        if self.health.take_reinit() {
            self.tear_down().await;
            self.next_init_at = now;
        }

        if !self.is_mounted() && now >= self.next_init_at {
            self.next_init_at = now + self.config.init_retry();
            self.bring_up(present).await;
        }

        if self.link.status().is_ok() {
            self.service(now).await;
        }

        let errors = self.health.error_count(self.config.error_threshold);
        self.link.with(|s| s.error_count = errors);
    }

    fn card_present(&mut self) -> bool {
        let level = if self.config.card_detect_active_low {
            self.card_detect.is_low()
        } else {
            self.card_detect.is_high()
        };
        // An unreadable switch should not lock the card out
        level.unwrap_or(true)
    }

    fn is_mounted(&self) -> bool {
        matches!(self.medium, Some(Medium::Mounted(_)))
    }

    fn publish(&self, card: CardStatus, filesystem: FilesystemStatus, info: Option<CardInfo>) {
        self.link.with(|s| {
            s.status = StorageStatus { card, filesystem };
            s.card_info = info;
        });
    }

    /// Parks the transport until the next initialization attempt.
    async fn park(&mut self, mut transport: B, clock: T) {
        transport.deinitialize().await;
        self.medium = Some(Medium::Unmounted { transport, clock });
    }

    /// Unmounts, shuts the transport down and drops every read session.
    async fn tear_down(&mut self) {
        info!("storage: tearing down the card");
        self.sessions = [None; 4];
        match self.medium.take() {
            Some(Medium::Mounted(volume)) => {
                let (transport, clock) = volume.unmount().await;
                self.park(transport, clock).await;
            }
            Some(Medium::Unmounted { transport, clock }) => self.park(transport, clock).await,
            None => {}
        }
        self.link.with(|s| {
            s.abort_reads();
            s.status = StorageStatus::new();
            s.card_info = None;
        });
    }

    /// Card bring-up, optional format, mount and the boot counter check.
    /// The combined status is only published once all of it is done.
    async fn bring_up(&mut self, present: bool) {
        let (mut transport, clock) = match self.medium.take() {
            Some(Medium::Unmounted { transport, clock }) => (transport, clock),
            other => {
                self.medium = other;
                return;
            }
        };

        if !present {
            debug!("storage: no card in the slot");
            self.publish(CardStatus::NotPresent, FilesystemStatus::Unmounted, None);
            self.medium = Some(Medium::Unmounted { transport, clock });
            return;
        }

        let info = match transport.initialize().await {
            Ok(info) => info,
            Err(e) => {
                warn!("storage: card initialization failed: {}", e);
                self.publish(CardStatus::Failed(e), FilesystemStatus::Unmounted, None);
                self.park(transport, clock).await;
                return;
            }
        };
        info!(
            "storage: {} card, {} sectors",
            info.card_type.label(),
            info.sector_count
        );

        if self.link.with(|s| s.format_requested) {
            info!("storage: formatting card");
            if let Err(e) = format_card(&mut transport).await {
                warn!("storage: format failed: {}", e);
                self.publish(CardStatus::Ok, FilesystemStatus::FormatFailed, Some(info));
                self.park(transport, clock).await;
                return;
            }
            self.link.with(|s| s.format_requested = false);
        }

        let mut volume = match Volume::mount(transport, clock).await {
            Ok(volume) => volume,
            Err(MountFailure {
                error,
                transport,
                clock,
            }) if error.is_unresponsive() => {
                // Formatting a card that stopped answering cannot succeed
                warn!("storage: card stopped answering during mount: {}", error);
                let card = match error {
                    FsError::Device(e) => CardStatus::Failed(e),
                    _ => CardStatus::Ok,
                };
                self.publish(card, FilesystemStatus::MountFailed, Some(info));
                self.park(transport, clock).await;
                return;
            }
            Err(MountFailure {
                error,
                mut transport,
                clock,
            }) => {
                warn!("storage: mount failed ({}), formatting", error);
                if let Err(e) = format_card(&mut transport).await {
                    warn!("storage: format failed: {}", e);
                    self.publish(CardStatus::Ok, FilesystemStatus::FormatFailed, Some(info));
                    self.park(transport, clock).await;
                    return;
                }
                match Volume::mount(transport, clock).await {
                    Ok(volume) => volume,
                    Err(failure) => {
                        warn!("storage: mount after format failed: {}", failure.error);
                        self.publish(CardStatus::Ok, FilesystemStatus::MountFailed, Some(info));
                        self.park(failure.transport, failure.clock).await;
                        return;
                    }
                }
            }
        };

        let boot_count = match volume.increment_boot_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("storage: boot counter update failed: {}", e);
                let (transport, clock) = volume.unmount().await;
                self.publish(CardStatus::Ok, FilesystemStatus::BootCountFailed, Some(info));
                self.park(transport, clock).await;
                return;
            }
        };
        info!("storage: mounted, boot {}", boot_count);

        self.medium = Some(Medium::Mounted(volume));
        self.link.with(|s| {
            s.status = StorageStatus {
                card: CardStatus::Ok,
                filesystem: FilesystemStatus::Ok,
            };
            s.card_info = Some(info);
            s.boot_count = Some(boot_count);
            s.pages.remounted();
        });
    }

    fn record_failure(&mut self) {
        if self.health.record_failure(self.config.error_threshold) {
            warn!(
                "storage: more than {} read/write errors, re-initializing",
                self.config.error_threshold
            );
        }
    }

    fn escalating(&self) -> bool {
        self.health == Health::Reinitializing
    }

    /// Queue, session and config page work of one turn.
    async fn service(&mut self, now: Instant) {
        let mut volume = match self.medium.take() {
            Some(Medium::Mounted(volume)) => volume,
            other => {
                self.medium = other;
                return;
            }
        };

        self.drain_one(&mut volume, wallbox_5min).await;
        self.drain_one(&mut volume, wallbox_daily).await;
        self.drain_one(&mut volume, energy_manager_5min).await;
        self.drain_one(&mut volume, energy_manager_daily).await;

        for class in RecordClass::ALL {
            self.step_session(&mut volume, class, now).await;
        }

        self.sync_config_pages(&mut volume, now).await;

        self.medium = Some(Medium::Mounted(volume));
    }

    /// Writes the oldest queued sample of one class.
    async fn drain_one<R: SlotRecord, const N: usize>(
        &mut self,
        volume: &mut Volume<B, T>,
        queue: fn(&mut LinkState) -> &mut WriteQueue<R, N>,
    ) {
        if self.escalating() {
            return;
        }
        let Some(sample) = self.link.with(|s| queue(s).pop()) else {
            return;
        };

        let mut bytes = [0u8; SLOT_BUF_LEN];
        sample.record.write_to(&mut bytes[..R::CLASS.slot_len()]);
        match volume.write_slot(R::CLASS, &sample.key, sample.slot, &bytes).await {
            Ok(()) => {
                debug!(
                    "storage: wrote slot {} of {}",
                    sample.slot,
                    path_for(&sample.key, R::CLASS)
                );
                self.health.record_success();
            }
            Err(e) => {
                warn!("storage: writing {} failed: {}", R::CLASS.label(), e);
                if !self.link.with(|s| queue(s).requeue(sample)) {
                    warn!("storage: {} queue full, sample dropped", R::CLASS.label());
                }
                self.record_failure();
            }
        }
    }

    fn abort_session(&mut self, volume: &mut Volume<B, T>, class: RecordClass) {
        let i = class.index();
        self.sessions[i] = None;
        volume.close_reader(class);
        self.link.with(|s| {
            s.gets[i] = GetState::Idle;
            s.mailboxes[i].clear();
        });
    }

    /// Advances the read session of one class by at most one chunk.
    async fn step_session(&mut self, volume: &mut Volume<B, T>, class: RecordClass, now: Instant) {
        if self.escalating() {
            return;
        }
        let i = class.index();

        if self.sessions[i].is_none() {
            let request = self.link.with(|s| match s.gets[i] {
                GetState::Requested(request) => {
                    s.gets[i] = GetState::Paging;
                    Some(request)
                }
                _ => None,
            });
            let Some(request) = request else {
                return;
            };
            debug!(
                "storage: paging {} slots of {} from slot {}",
                request.amount,
                path_for(&request.key, class),
                request.first_slot
            );
            self.sessions[i] = Some(PagingSession::new(class, request));
        }
        let Some(mut session) = self.sessions[i] else {
            return;
        };

        if session.awaiting_ack() {
            if !self.link.with(|s| s.mailboxes[i].is_ready()) {
                session.acknowledged();
            } else if session.expired(now) {
                warn!("storage: {} chunk not acknowledged, aborting read", class.label());
                self.abort_session(volume, class);
                self.record_failure();
                return;
            } else {
                return;
            }
        }

        if session.is_complete() {
            debug!("storage: {} read finished", class.label());
            self.abort_session(volume, class);
            return;
        }

        let (first, count) = session.next_range();
        let len = usize::from(count) * class.slot_len();
        if len > MAX_CHUNK_LEN {
            warn!(
                "storage: {} chunk of {} bytes does not fit a message, aborting read",
                class.label(),
                len
            );
            self.abort_session(volume, class);
            return;
        }

        let mut buf = [0u8; MAX_CHUNK_LEN];
        if let Err(e) = volume
            .read_slots(class, &session.request.key, first, count, &mut buf)
            .await
        {
            warn!("storage: reading {} failed: {}", class.label(), e);
            self.abort_session(volume, class);
            self.record_failure();
            return;
        }
        self.health.record_success();

        let Ok(payload) = heapless::Vec::from_slice(&buf[..len]) else {
            warn!("storage: {} chunk of {} bytes does not fit a message", class.label(), len);
            self.abort_session(volume, class);
            return;
        };
        let chunk = Chunk {
            class,
            offset: session.next_offset(),
            total: session.total_len(),
            payload,
        };
        if self.link.with(|s| s.mailboxes[i].post(chunk)) {
            session.posted(count, now + self.config.chunk_ack_timeout());
            self.sessions[i] = Some(session);
        } else {
            // Session stays where it was, the range is read again next turn
            debug!("storage: {} mailbox still occupied", class.label());
        }
    }

    /// Loads pages after a mount and writes back the ones that are due.
    async fn sync_config_pages(&mut self, volume: &mut Volume<B, T>, now: Instant) {
        let delay = self.config.config_flush_delay();
        for page in 0..CONFIG_PAGES {
            if self.escalating() {
                return;
            }

            if self.link.with(|s| s.pages.needs_load(page)) {
                let mut data = [0u8; CONFIG_PAGE_LEN];
                match volume.read_config_page(page, &mut data).await {
                    Ok(found) => {
                        self.health.record_success();
                        self.link
                            .with(|s| s.pages.loaded(page, found.then_some(&data)));
                    }
                    Err(e) => {
                        warn!("storage: reading config page {} failed: {}", page, e);
                        self.record_failure();
                    }
                }
            }

            let Some((data, changed_at)) = self.link.with(|s| s.pages.due(page, now, delay)) else {
                continue;
            };
            match volume.write_config_page(page, &data).await {
                Ok(()) => {
                    debug!("storage: config page {} written", page);
                    self.health.record_success();
                    self.link.with(|s| s.pages.flushed(page, changed_at));
                }
                Err(e) => {
                    warn!("storage: writing config page {} failed: {}", page, e);
                    self.record_failure();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Date;
    use crate::fs::FixedClock;
    use crate::link::FORMAT_PASSWORD;
    use crate::record::{NO_DATA, NO_ENERGY};
    use crate::sdmmc::SdError;
    use crate::sdmmc::ram::{RamCard, RamCardDetect};
    use crate::status::DataStatus;
    use alloc::vec::Vec;
    use embassy_futures::block_on;

    const SECTORS: u32 = 64 * 1024;

    type TestSubsystem<'a> = StorageSubsystem<'a, RamCard, RamCardDetect, FixedClock>;

    fn test_config() -> StorageConfig {
        StorageConfig {
            init_retry_ms: 0,
            chunk_ack_timeout_ms: 20,
            config_flush_delay_ms: 0,
            ..StorageConfig::default()
        }
    }

    fn start<'a>(card: &RamCard, link: &'a StorageLink) -> TestSubsystem<'a> {
        let mut storage = StorageSubsystem::new(
            link,
            test_config(),
            card.clone(),
            card.detect_pin(),
            FixedClock::default(),
        );
        block_on(storage.tick());
        assert!(link.status().is_ok(), "card should come up: {:?}", link.status());
        storage
    }

    fn settle(storage: &mut TestSubsystem<'_>, ticks: usize) {
        for _ in 0..ticks {
            block_on(storage.tick());
        }
    }

    /// Ticks and acknowledges until the read of `class` is over.
    fn collect(storage: &mut TestSubsystem<'_>, link: &StorageLink, class: RecordClass) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for _ in 0..200 {
            block_on(storage.tick());
            if !link.is_reading(class) {
                return chunks;
            }
            if let Some(chunk) = link.poll_chunk(class) {
                chunks.push(chunk);
                assert!(link.acknowledge_chunk(class));
            }
        }
        panic!("read of {} did not finish", class.label());
    }

    #[test]
    fn test_blank_card_is_formatted_and_mounted() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let _storage = start(&card, &link);
        assert_eq!(link.boot_count(), Some(1));
        let info = link.card_info().expect("card info is published");
        assert_eq!(info.sector_count, SECTORS);
        assert_eq!(&info.product_name, b"RAMSD");
    }

    #[test]
    fn test_samples_read_back_in_chunks() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);
        let day = Date::new(2024, 5, 1);

        for (hour, minute, power) in [(0, 0, 1000u16), (0, 5, 1100), (1, 0, 2200)] {
            let record = Wallbox5MinSlot { flags: 0x03, power };
            assert_eq!(link.push_wallbox_5min(42, day.at(hour, minute), record), DataStatus::Ok);
        }
        settle(&mut storage, 3);
        assert_eq!(link.queued(RecordClass::Wallbox5Min), 0);

        assert_eq!(link.request_wallbox_5min(42, day.at(0, 0), 100), DataStatus::Ok);
        assert_eq!(
            link.request_wallbox_5min(42, day.at(0, 0), 100),
            DataStatus::QueueFull
        );
        let chunks = collect(&mut storage, &link, RecordClass::Wallbox5Min);

        assert_eq!(chunks.len(), 5);
        let offsets: Vec<u32> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, [0, 60, 120, 180, 240]);
        assert!(chunks.iter().all(|c| c.total == 300));

        let bytes: Vec<u8> = chunks.iter().flat_map(|c| c.payload.iter().copied()).collect();
        assert_eq!(bytes.len(), 300);
        let slot = |i: usize| Wallbox5MinSlot::read_from(&bytes[i * 3..i * 3 + 3]);
        assert_eq!(slot(0), Wallbox5MinSlot { flags: 0x03, power: 1000 });
        assert_eq!(slot(1).power, 1100);
        assert_eq!(slot(12).power, 2200);
        assert_eq!(slot(2).flags, NO_DATA);
        assert!(!slot(99).has_data());
        assert_eq!(link.error_count(), 0);
    }

    #[test]
    fn test_missing_month_reads_as_no_data() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);

        assert_eq!(
            link.request_energy_manager_daily(Date::new(2023, 1, 1), 31),
            DataStatus::Ok
        );
        let chunks = collect(&mut storage, &link, RecordClass::EnergyManagerDaily);
        assert_eq!(chunks.len(), 31);
        for chunk in &chunks {
            let slot = EnergyManagerDailySlot::read_from(&chunk.payload);
            assert_eq!(slot.energy_grid_in, NO_ENERGY);
            assert!(!slot.has_data());
        }
        assert_eq!(chunks.last().map(|c| c.offset), Some(30 * 56));
    }

    #[test]
    fn test_daily_samples_round_trip() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);

        assert_eq!(link.push_wallbox_daily(3, Date::new(2024, 2, 29), 12_345), DataStatus::Ok);
        let totals = EnergyManagerDailySlot {
            energy_grid_in: 1,
            energy_grid_out: 2,
            energy_general_in: [3; 6],
            energy_general_out: [4; 6],
        };
        assert_eq!(link.push_energy_manager_daily(Date::new(2024, 2, 1), totals), DataStatus::Ok);
        settle(&mut storage, 1);

        link.request_wallbox_daily(3, Date::new(2024, 2, 28), 2);
        let chunks = collect(&mut storage, &link, RecordClass::WallboxDaily);
        assert_eq!(chunks.len(), 1);
        assert_eq!(WallboxDailySlot::read_from(&chunks[0].payload[4..]).energy, 12_345);

        link.request_energy_manager_daily(Date::new(2024, 2, 1), 1);
        let chunks = collect(&mut storage, &link, RecordClass::EnergyManagerDaily);
        assert_eq!(EnergyManagerDailySlot::read_from(&chunks[0].payload), totals);
    }

    #[test]
    fn test_write_errors_escalate_to_reinit() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);
        assert_eq!(card.initializations(), 1);

        card.fail_writes(u32::MAX);
        let record = Wallbox5MinSlot { flags: 0, power: 7 };
        assert_eq!(
            link.push_wallbox_5min(1, Date::new(2024, 5, 1).at(8, 0), record),
            DataStatus::Ok
        );

        let mut highest = 0;
        for _ in 0..50 {
            block_on(storage.tick());
            highest = highest.max(link.error_count());
            if card.initializations() > 1 {
                break;
            }
        }
        assert_eq!(highest, 11, "the 11th failure crosses the threshold");
        assert_eq!(card.initializations(), 2, "transport was re-initialized");
        assert_eq!(link.queued(RecordClass::Wallbox5Min), 1, "sample survives");

        card.fail_writes(0);
        settle(&mut storage, 2);
        assert!(link.status().is_ok());
        assert_eq!(link.queued(RecordClass::Wallbox5Min), 0);
        assert_eq!(link.error_count(), 0);
    }

    #[test]
    fn test_card_removal_and_recovery() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);

        link.request_wallbox_5min(1, Date::new(2024, 5, 1).at(0, 0), 288);
        block_on(storage.tick());
        assert!(link.poll_chunk(RecordClass::Wallbox5Min).is_some());

        card.set_present(false);
        block_on(storage.tick());
        assert_eq!(link.status().card, CardStatus::NotPresent);
        assert!(!link.is_reading(RecordClass::Wallbox5Min));
        assert!(link.poll_chunk(RecordClass::Wallbox5Min).is_none());
        let record = Wallbox5MinSlot { flags: 0, power: 1 };
        assert_eq!(
            link.push_wallbox_5min(1, Date::new(2024, 5, 1).at(0, 0), record),
            DataStatus::SdError
        );

        card.set_present(true);
        block_on(storage.tick());
        assert!(link.status().is_ok());
        assert_eq!(link.boot_count(), Some(2), "volume survived the removal");
    }

    #[test]
    fn test_format_request_wipes_card() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);

        let record = Wallbox5MinSlot { flags: 0, power: 500 };
        let at = Date::new(2024, 5, 1).at(10, 0);
        link.push_wallbox_5min(9, at, record);
        settle(&mut storage, 1);

        assert_eq!(link.request_format(0), crate::status::FormatStatus::PasswordError);
        assert_eq!(link.request_format(FORMAT_PASSWORD), crate::status::FormatStatus::Ok);
        block_on(storage.tick());
        assert!(link.status().is_ok());
        assert_eq!(link.boot_count(), Some(1), "boot counter starts over");
        assert_eq!(card.initializations(), 2);

        link.request_wallbox_5min(9, at, 1);
        let chunks = collect(&mut storage, &link, RecordClass::Wallbox5Min);
        assert!(!Wallbox5MinSlot::read_from(&chunks[0].payload).has_data());
    }

    #[test]
    fn test_unacknowledged_chunk_aborts_read() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let config = StorageConfig {
            chunk_ack_timeout_ms: 0,
            ..test_config()
        };
        let mut storage = StorageSubsystem::new(
            &link,
            config,
            card.clone(),
            card.detect_pin(),
            FixedClock::default(),
        );
        block_on(storage.tick());
        assert!(link.status().is_ok());

        link.request_energy_manager_5min(Date::new(2024, 5, 1).at(0, 0), 10);
        block_on(storage.tick());
        assert!(link.poll_chunk(RecordClass::EnergyManager5Min).is_some());

        // Nobody acknowledges, the deadline has passed by the next turn
        block_on(storage.tick());
        assert!(!link.is_reading(RecordClass::EnergyManager5Min));
        assert!(link.poll_chunk(RecordClass::EnergyManager5Min).is_none());
        assert_eq!(link.error_count(), 1);

        // The caller may retry right away
        assert_eq!(
            link.request_energy_manager_5min(Date::new(2024, 5, 1).at(0, 0), 10),
            DataStatus::Ok
        );
    }

    #[test]
    fn test_config_pages_persist_across_boots() {
        let card = RamCard::new(SECTORS);
        {
            let link = StorageLink::new();
            let mut storage = start(&card, &link);
            assert!(link.set_config_page(1, &[5; CONFIG_PAGE_LEN]));
            settle(&mut storage, 1);
        }

        let link = StorageLink::new();
        let _storage = start(&card, &link);
        assert_eq!(link.config_page(1), Some([5; CONFIG_PAGE_LEN]));
        assert_eq!(link.config_page(0), Some([0; CONFIG_PAGE_LEN]), "never written");
    }

    /// Brings a card up once so it carries a volume and one boot.
    fn formatted_card() -> RamCard {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let _storage = start(&card, &link);
        card
    }

    fn subsystem<'a>(card: &RamCard, link: &'a StorageLink) -> TestSubsystem<'a> {
        StorageSubsystem::new(
            link,
            test_config(),
            card.clone(),
            card.detect_pin(),
            FixedClock::default(),
        )
    }

    #[test]
    fn test_unresponsive_card_is_not_formatted() {
        let card = formatted_card();
        let link = StorageLink::new();
        let mut storage = subsystem(&card, &link);

        card.fail_reads(1);
        block_on(storage.tick());
        assert_eq!(link.status().filesystem, FilesystemStatus::MountFailed);
        assert_eq!(link.status().card, CardStatus::Failed(SdError::ReadTokenTimeout));
        assert_eq!(link.boot_count(), None);

        block_on(storage.tick());
        assert!(link.status().is_ok());
        assert_eq!(link.boot_count(), Some(2), "volume was left alone");
    }

    #[test]
    fn test_unreadable_volume_is_formatted() {
        let card = formatted_card();
        let link = StorageLink::new();
        let mut storage = subsystem(&card, &link);

        card.fail_reads_with(1, SdError::ReadToken(0x0b));
        block_on(storage.tick());
        assert!(link.status().is_ok(), "formatted and remounted: {:?}", link.status());
        assert_eq!(link.boot_count(), Some(1), "boot counter starts over");
        assert_eq!(card.initializations(), 2);
    }

    #[test]
    fn test_boot_count_failure_is_retried() {
        let card = formatted_card();
        let link = StorageLink::new();
        let mut storage = subsystem(&card, &link);

        card.fail_writes(u32::MAX);
        block_on(storage.tick());
        assert_eq!(link.status().card, CardStatus::Ok);
        assert_eq!(link.status().filesystem, FilesystemStatus::BootCountFailed);
        assert_eq!(link.boot_count(), None);
        let record = Wallbox5MinSlot { flags: 0, power: 1 };
        assert_eq!(
            link.push_wallbox_5min(1, Date::new(2024, 5, 1).at(0, 0), record),
            DataStatus::FilesystemError
        );

        card.fail_writes(0);
        block_on(storage.tick());
        assert!(link.status().is_ok());
        assert!(link.boot_count().is_some());
        assert_eq!(card.initializations(), 3, "transport was parked in between");
    }

    #[test]
    fn test_read_failure_while_paging_aborts_read() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);
        let day = Date::new(2024, 5, 1);
        let record = Wallbox5MinSlot { flags: 0, power: 300 };
        assert_eq!(link.push_wallbox_5min(4, day.at(23, 55), record), DataStatus::Ok);
        settle(&mut storage, 1);

        link.request_wallbox_5min(4, day.at(0, 0), 288);
        for offset in [0, 60] {
            block_on(storage.tick());
            let chunk = link.poll_chunk(RecordClass::Wallbox5Min).expect("chunk posted");
            assert_eq!(chunk.offset, offset);
            assert!(link.acknowledge_chunk(RecordClass::Wallbox5Min));
        }

        // The rest of the day spills into a sector not read so far
        card.fail_reads(u32::MAX);
        let mut delivered = 2;
        for _ in 0..20 {
            block_on(storage.tick());
            if !link.is_reading(RecordClass::Wallbox5Min) {
                break;
            }
            if link.poll_chunk(RecordClass::Wallbox5Min).is_some() {
                delivered += 1;
                assert!(link.acknowledge_chunk(RecordClass::Wallbox5Min));
            }
        }
        assert!(!link.is_reading(RecordClass::Wallbox5Min));
        assert!(delivered < 15, "read stopped before the last chunk");
        assert!(link.poll_chunk(RecordClass::Wallbox5Min).is_none());
        assert_eq!(link.error_count(), 1);

        card.fail_reads(0);
        link.request_wallbox_5min(4, day.at(0, 0), 288);
        let chunks = collect(&mut storage, &link, RecordClass::Wallbox5Min);
        assert_eq!(chunks.len(), 15);
        let last = Wallbox5MinSlot::read_from(&chunks[14].payload[21..]);
        assert_eq!(last.power, 300);
    }

    #[test]
    fn test_occupied_mailbox_holds_the_session() {
        let card = RamCard::new(SECTORS);
        let link = StorageLink::new();
        let mut storage = start(&card, &link);
        let class = RecordClass::WallboxDaily;

        let stale = Chunk {
            class,
            offset: 999,
            total: 999,
            payload: heapless::Vec::new(),
        };
        assert!(link.with(|s| s.mailboxes[class.index()].post(stale)));
        link.request_wallbox_daily(2, Date::new(2024, 3, 1), 31);

        block_on(storage.tick());
        assert!(link.is_reading(class));
        let chunk = link.poll_chunk(class).expect("stale chunk still there");
        assert_eq!(chunk.offset, 999);
        assert!(link.acknowledge_chunk(class));

        let chunks = collect(&mut storage, &link, class);
        assert_eq!(chunks.first().map(|c| c.offset), Some(0), "nothing was skipped");
        let total: usize = chunks.iter().map(|c| c.payload.len()).sum();
        assert_eq!(total as u32, chunks[0].total);
        assert_eq!(link.error_count(), 0);
    }

    #[test]
    fn test_missing_card_reported() {
        let card = RamCard::new(SECTORS);
        card.set_present(false);
        let link = StorageLink::new();
        let mut storage = StorageSubsystem::new(
            &link,
            test_config(),
            card.clone(),
            card.detect_pin(),
            FixedClock::default(),
        );
        block_on(storage.tick());
        assert_eq!(link.status().card, CardStatus::NotPresent);
        assert_eq!(card.initializations(), 0);
    }
}
