//! Shared boundary between the protocol layer and the storage supervisor.
//!
//! A [`StorageLink`] lives in a `static`. Protocol handlers push samples,
//! issue read requests and collect chunks through it. The supervisor task is
//! the only consumer. Every call is a short critical section, nothing here
//! blocks or touches the card.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;

use crate::calendar::{Date, SampleTime, daily_span, five_minute_span};
use crate::config_pages::{ConfigPages, PageData};
use crate::queue::{PendingSample, WriteQueue};
use crate::record::{
    EnergyManager5MinSlot, EnergyManagerDailySlot, NO_DATA, RecordClass, RecordKey, SlotRecord,
    Wallbox5MinSlot, WallboxDailySlot,
};
use crate::sdmmc::CardInfo;
use crate::session::{Chunk, ChunkMailbox, GetDescriptor, GetState};
use crate::status::{DataStatus, FormatStatus, StorageStatus};

/// Password that unlocks [`StorageLink::request_format`]
pub const FORMAT_PASSWORD: u32 = 0x4223_ABCD;

pub const WALLBOX_5MIN_QUEUE: usize = 8;
pub const WALLBOX_DAILY_QUEUE: usize = 2;
pub const ENERGY_MANAGER_5MIN_QUEUE: usize = 8;
pub const ENERGY_MANAGER_DAILY_QUEUE: usize = 2;

/// Energy manager files are keyed with this subject id
pub const ENERGY_MANAGER_ID: u32 = 0;

pub(crate) struct LinkState {
    pub(crate) wallbox_5min: WriteQueue<Wallbox5MinSlot, WALLBOX_5MIN_QUEUE>,
    pub(crate) wallbox_daily: WriteQueue<WallboxDailySlot, WALLBOX_DAILY_QUEUE>,
    pub(crate) energy_manager_5min: WriteQueue<EnergyManager5MinSlot, ENERGY_MANAGER_5MIN_QUEUE>,
    pub(crate) energy_manager_daily:
        WriteQueue<EnergyManagerDailySlot, ENERGY_MANAGER_DAILY_QUEUE>,
    pub(crate) gets: [GetState; 4],
    pub(crate) mailboxes: [ChunkMailbox; 4],
    pub(crate) status: StorageStatus,
    pub(crate) card_info: Option<CardInfo>,
    pub(crate) error_count: u32,
    pub(crate) boot_count: Option<u32>,
    pub(crate) format_requested: bool,
    pub(crate) pages: ConfigPages,
}

impl LinkState {
    const fn new() -> Self {
        Self {
            wallbox_5min: WriteQueue::new(),
            wallbox_daily: WriteQueue::new(),
            energy_manager_5min: WriteQueue::new(),
            energy_manager_daily: WriteQueue::new(),
            gets: [GetState::Idle; 4],
            mailboxes: [
                ChunkMailbox::new(),
                ChunkMailbox::new(),
                ChunkMailbox::new(),
                ChunkMailbox::new(),
            ],
            status: StorageStatus::new(),
            card_info: None,
            error_count: 0,
            boot_count: None,
            format_requested: false,
            pages: ConfigPages::new(),
        }
    }

    /// Drops every read session, used when the medium goes away.
    pub(crate) fn abort_reads(&mut self) {
        self.gets = [GetState::Idle; 4];
        for mailbox in self.mailboxes.iter_mut() {
            mailbox.clear();
        }
    }

    fn request(&mut self, class: RecordClass, request: Option<GetDescriptor>) -> DataStatus {
        let status = self.status.data_status();
        if status != DataStatus::Ok {
            return status;
        }
        let Some(request) = request else {
            return DataStatus::DateOutOfRange;
        };
        let get = &mut self.gets[class.index()];
        if *get != GetState::Idle {
            return DataStatus::QueueFull;
        }
        *get = GetState::Requested(request);
        DataStatus::Ok
    }
}

fn enqueue<R: SlotRecord, const N: usize>(
    status: StorageStatus,
    queue: &mut WriteQueue<R, N>,
    sample: Option<PendingSample<R>>,
) -> DataStatus {
    let data_status = status.data_status();
    if data_status != DataStatus::Ok {
        return data_status;
    }
    let Some(sample) = sample else {
        return DataStatus::DateOutOfRange;
    };
    if queue.push(sample) {
        DataStatus::Ok
    } else {
        DataStatus::QueueFull
    }
}

fn day_key(subject_id: u32, date: Date) -> RecordKey {
    RecordKey {
        subject_id,
        year: date.year,
        month: date.month,
        day: Some(date.day),
    }
}

fn month_key(subject_id: u32, date: Date) -> RecordKey {
    RecordKey {
        subject_id,
        year: date.year,
        month: date.month,
        day: None,
    }
}

fn five_minute_sample<R: SlotRecord>(
    subject_id: u32,
    at: SampleTime,
    record: R,
) -> Option<PendingSample<R>> {
    let slot = at.slot().ok()?;
    Some(PendingSample {
        key: day_key(subject_id, at.date),
        slot,
        record,
    })
}

fn daily_sample<R: SlotRecord>(subject_id: u32, date: Date, record: R) -> Option<PendingSample<R>> {
    let slot = daily_span(date.year, date.month, date.day, 1).ok()?;
    Some(PendingSample {
        key: month_key(subject_id, date),
        slot,
        record,
    })
}

fn five_minute_request(subject_id: u32, at: SampleTime, amount: u16) -> Option<GetDescriptor> {
    let d = at.date;
    let first_slot = five_minute_span(d.year, d.month, d.day, at.hour, at.minute, amount).ok()?;
    Some(GetDescriptor {
        key: day_key(subject_id, d),
        first_slot,
        amount,
    })
}

fn daily_request(subject_id: u32, date: Date, amount: u16) -> Option<GetDescriptor> {
    let first_slot = daily_span(date.year, date.month, date.day, amount).ok()?;
    Some(GetDescriptor {
        key: month_key(subject_id, date),
        first_slot,
        amount,
    })
}

/// The storage subsystem as seen from the rest of the firmware.
pub struct StorageLink {
    state: Mutex<CriticalSectionRawMutex, RefCell<LinkState>>,
    /// Raised on every call the supervisor should react to quickly
    pub(crate) wake: Signal<CriticalSectionRawMutex, ()>,
}

impl StorageLink {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(LinkState::new())),
            wake: Signal::new(),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn notify(&self, status: DataStatus) -> DataStatus {
        if status == DataStatus::Ok {
            self.wake.signal(());
        }
        status
    }

    /// Queues the charging power of one wallbox for a 5-minute interval.
    pub fn push_wallbox_5min(
        &self,
        wallbox_id: u32,
        at: SampleTime,
        mut record: Wallbox5MinSlot,
    ) -> DataStatus {
        record.flags &= !NO_DATA;
        let sample = five_minute_sample(wallbox_id, at, record);
        let status = self.with(|s| enqueue(s.status, &mut s.wallbox_5min, sample));
        self.notify(status)
    }

    /// Queues the energy one wallbox charged on a day.
    pub fn push_wallbox_daily(&self, wallbox_id: u32, date: Date, energy: u32) -> DataStatus {
        let sample = daily_sample(wallbox_id, date, WallboxDailySlot { energy });
        let status = self.with(|s| enqueue(s.status, &mut s.wallbox_daily, sample));
        self.notify(status)
    }

    /// Queues the meter power readings for a 5-minute interval.
    pub fn push_energy_manager_5min(
        &self,
        at: SampleTime,
        mut record: EnergyManager5MinSlot,
    ) -> DataStatus {
        record.flags &= !NO_DATA;
        let sample = five_minute_sample(ENERGY_MANAGER_ID, at, record);
        let status = self.with(|s| enqueue(s.status, &mut s.energy_manager_5min, sample));
        self.notify(status)
    }

    /// Queues the meter energy counters of a day.
    pub fn push_energy_manager_daily(
        &self,
        date: Date,
        record: EnergyManagerDailySlot,
    ) -> DataStatus {
        let sample = daily_sample(ENERGY_MANAGER_ID, date, record);
        let status = self.with(|s| enqueue(s.status, &mut s.energy_manager_daily, sample));
        self.notify(status)
    }

    /// Starts paging out `amount` 5-minute slots of one wallbox.
    pub fn request_wallbox_5min(&self, wallbox_id: u32, at: SampleTime, amount: u16) -> DataStatus {
        let request = five_minute_request(wallbox_id, at, amount);
        let status = self.with(|s| s.request(RecordClass::Wallbox5Min, request));
        self.notify(status)
    }

    pub fn request_wallbox_daily(&self, wallbox_id: u32, date: Date, amount: u16) -> DataStatus {
        let request = daily_request(wallbox_id, date, amount);
        let status = self.with(|s| s.request(RecordClass::WallboxDaily, request));
        self.notify(status)
    }

    pub fn request_energy_manager_5min(&self, at: SampleTime, amount: u16) -> DataStatus {
        let request = five_minute_request(ENERGY_MANAGER_ID, at, amount);
        let status = self.with(|s| s.request(RecordClass::EnergyManager5Min, request));
        self.notify(status)
    }

    pub fn request_energy_manager_daily(&self, date: Date, amount: u16) -> DataStatus {
        let request = daily_request(ENERGY_MANAGER_ID, date, amount);
        let status = self.with(|s| s.request(RecordClass::EnergyManagerDaily, request));
        self.notify(status)
    }

    /// The chunk waiting for transmission, if any. It stays posted until
    /// [`StorageLink::acknowledge_chunk`] is called.
    pub fn poll_chunk(&self, class: RecordClass) -> Option<Chunk> {
        self.with(|s| s.mailboxes[class.index()].peek())
    }

    /// Confirms that the posted chunk was sent. False if none was posted.
    pub fn acknowledge_chunk(&self, class: RecordClass) -> bool {
        let acked = self.with(|s| s.mailboxes[class.index()].acknowledge());
        if acked {
            self.wake.signal(());
        }
        acked
    }

    /// True while a read request of `class` is pending or being paged out.
    pub fn is_reading(&self, class: RecordClass) -> bool {
        self.with(|s| s.gets[class.index()] != GetState::Idle)
    }

    pub fn status(&self) -> StorageStatus {
        self.with(|s| s.status)
    }

    pub fn card_info(&self) -> Option<CardInfo> {
        self.with(|s| s.card_info)
    }

    /// Read/write failures since the last successful operation.
    pub fn error_count(&self) -> u32 {
        self.with(|s| s.error_count)
    }

    /// Boot counter read at the last mount.
    pub fn boot_count(&self) -> Option<u32> {
        self.with(|s| s.boot_count)
    }

    /// Samples waiting in the queue of `class`.
    pub fn queued(&self, class: RecordClass) -> usize {
        self.with(|s| match class {
            RecordClass::Wallbox5Min => s.wallbox_5min.len(),
            RecordClass::WallboxDaily => s.wallbox_daily.len(),
            RecordClass::EnergyManager5Min => s.energy_manager_5min.len(),
            RecordClass::EnergyManagerDaily => s.energy_manager_daily.len(),
        })
    }

    /// Erases the card on the next initialization.
    pub fn request_format(&self, password: u32) -> FormatStatus {
        if password != FORMAT_PASSWORD {
            return FormatStatus::PasswordError;
        }
        self.with(|s| s.format_requested = true);
        self.wake.signal(());
        FormatStatus::Ok
    }

    /// Replaces a configuration page in RAM, it reaches the card later.
    pub fn set_config_page(&self, page: usize, data: &PageData) -> bool {
        let now = Instant::now();
        self.with(|s| s.pages.set(page, data, now))
    }

    pub fn config_page(&self, page: usize) -> Option<PageData> {
        self.with(|s| s.pages.get(page))
    }
}

impl Default for StorageLink {
    fn default() -> Self {
        Self::new()
    }
}
