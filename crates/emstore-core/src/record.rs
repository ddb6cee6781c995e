//! On-disk record model.
//!
//! Every file starts with an 8 byte header followed by a fixed number of
//! fixed-size slots. 5-minute classes keep one file per day with 288 slots,
//! daily classes one file per month with 31 slots. Slots that were never
//! written hold a "no data" sentinel, so a new file is the header followed by
//! sentinel slots.
//!
//! Binary format of the header (little-endian):
//! - magic: 2 bytes (0x4243)
//! - version: 1 byte (0)
//! - class tag: 1 byte
//! - reserved: 4 bytes (zero)

use core::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::calendar::{SLOTS_PER_DAY, SLOTS_PER_MONTH};

pub const HEADER_LEN: usize = 8;
pub const MAGIC: u16 = 0x4243;
pub const FORMAT_VERSION: u8 = 0;

/// Flag bit marking a 5-minute slot without data
pub const NO_DATA: u8 = 1 << 7;

/// Sentinel for daily energy counters
pub const NO_ENERGY: u32 = u32::MAX;

/// Largest chunk payload of any class
pub const MAX_CHUNK_LEN: usize = 60;

/// The four kinds of time series the subsystem stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordClass {
    /// Charging power per 5 minutes, one file per wallbox and day
    Wallbox5Min,
    /// Charged energy per day, one file per wallbox and month
    WallboxDaily,
    /// Grid and general power per 5 minutes, one file per day
    EnergyManager5Min,
    /// Grid and general energy per day, one file per month
    EnergyManagerDaily,
}

impl RecordClass {
    pub const ALL: [RecordClass; 4] = [
        RecordClass::Wallbox5Min,
        RecordClass::WallboxDaily,
        RecordClass::EnergyManager5Min,
        RecordClass::EnergyManagerDaily,
    ];

    pub const fn index(self) -> usize {
        match self {
            RecordClass::Wallbox5Min => 0,
            RecordClass::WallboxDaily => 1,
            RecordClass::EnergyManager5Min => 2,
            RecordClass::EnergyManagerDaily => 3,
        }
    }

    /// Tag stored in the file header
    pub const fn tag(self) -> u8 {
        self.index() as u8
    }

    pub const fn slot_len(self) -> usize {
        match self {
            RecordClass::Wallbox5Min => 3,
            RecordClass::WallboxDaily => 4,
            RecordClass::EnergyManager5Min => 29,
            RecordClass::EnergyManagerDaily => 56,
        }
    }

    pub const fn slot_count(self) -> u16 {
        if self.is_daily() {
            SLOTS_PER_MONTH
        } else {
            SLOTS_PER_DAY
        }
    }

    pub const fn is_daily(self) -> bool {
        matches!(self, RecordClass::WallboxDaily | RecordClass::EnergyManagerDaily)
    }

    /// Size of a complete file of this class
    pub const fn file_len(self) -> usize {
        HEADER_LEN + self.slot_count() as usize * self.slot_len()
    }

    /// Largest payload one outbound message carries for this class
    pub const fn chunk_len(self) -> usize {
        match self {
            RecordClass::Wallbox5Min => 60,
            RecordClass::WallboxDaily => 60,
            RecordClass::EnergyManager5Min => 58,
            RecordClass::EnergyManagerDaily => 56,
        }
    }

    /// Whole slots per chunk
    pub const fn chunk_slots(self) -> u16 {
        (self.chunk_len() / self.slot_len()) as u16
    }

    /// File extension, 8.3 compatible
    pub const fn extension(self) -> &'static str {
        match self {
            RecordClass::Wallbox5Min => "WB",
            RecordClass::WallboxDaily => "WBD",
            RecordClass::EnergyManager5Min => "EM",
            RecordClass::EnergyManagerDaily => "EMD",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            RecordClass::Wallbox5Min => "wallbox 5min",
            RecordClass::WallboxDaily => "wallbox daily",
            RecordClass::EnergyManager5Min => "energy manager 5min",
            RecordClass::EnergyManagerDaily => "energy manager daily",
        }
    }

    /// Fills `out` (one slot long) with the "no data" pattern.
    pub fn write_no_data(self, out: &mut [u8]) {
        if self.is_daily() {
            out.fill(0xFF);
        } else {
            out.fill(0);
            out[0] = NO_DATA;
        }
    }

    /// Header every file of this class starts with.
    pub fn header(self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&MAGIC.to_le_bytes());
        header[2] = FORMAT_VERSION;
        header[3] = self.tag();
        header
    }

    /// True if `bytes` is a header of this class written by this format version.
    pub fn header_matches(self, bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_LEN && bytes[..4] == self.header()[..4]
    }
}

fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_le_bytes(b)
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn le_i32(bytes: &[u8], offset: usize) -> i32 {
    le_u32(bytes, offset) as i32
}

/// A fixed-size slot of one record class.
pub trait SlotRecord: Copy + core::fmt::Debug {
    const CLASS: RecordClass;

    /// Serializes into `out`, which is exactly one slot long.
    fn write_to(&self, out: &mut [u8]);

    /// Parses one slot.
    fn read_from(bytes: &[u8]) -> Self;

    fn has_data(&self) -> bool;
}

/// Wallbox charging power for one 5-minute interval.
///
/// Binary format: flags (u8), power in watts (u16)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wallbox5MinSlot {
    pub flags: u8,
    pub power: u16,
}

impl SlotRecord for Wallbox5MinSlot {
    const CLASS: RecordClass = RecordClass::Wallbox5Min;

    fn write_to(&self, out: &mut [u8]) {
        out[0] = self.flags;
        out[1..3].copy_from_slice(&self.power.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            flags: bytes[0],
            power: le_u16(bytes, 1),
        }
    }

    fn has_data(&self) -> bool {
        self.flags & NO_DATA == 0
    }
}

/// Wallbox energy charged on one day, in Wh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallboxDailySlot {
    pub energy: u32,
}

impl SlotRecord for WallboxDailySlot {
    const CLASS: RecordClass = RecordClass::WallboxDaily;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.energy.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            energy: le_u32(bytes, 0),
        }
    }

    fn has_data(&self) -> bool {
        self.energy != NO_ENERGY
    }
}

/// Energy manager power readings for one 5-minute interval.
///
/// Binary format: flags (u8), grid power (i32), 6 general power values (i32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyManager5MinSlot {
    pub flags: u8,
    pub power_grid: i32,
    pub power_general: [i32; 6],
}

impl SlotRecord for EnergyManager5MinSlot {
    const CLASS: RecordClass = RecordClass::EnergyManager5Min;

    fn write_to(&self, out: &mut [u8]) {
        out[0] = self.flags;
        out[1..5].copy_from_slice(&self.power_grid.to_le_bytes());
        for (i, value) in self.power_general.iter().enumerate() {
            let offset = 5 + i * 4;
            out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut power_general = [0i32; 6];
        for (i, value) in power_general.iter_mut().enumerate() {
            *value = le_i32(bytes, 5 + i * 4);
        }
        Self {
            flags: bytes[0],
            power_grid: le_i32(bytes, 1),
            power_general,
        }
    }

    fn has_data(&self) -> bool {
        self.flags & NO_DATA == 0
    }
}

/// Energy manager energy counters for one day, in Wh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyManagerDailySlot {
    pub energy_grid_in: u32,
    pub energy_grid_out: u32,
    pub energy_general_in: [u32; 6],
    pub energy_general_out: [u32; 6],
}

impl SlotRecord for EnergyManagerDailySlot {
    const CLASS: RecordClass = RecordClass::EnergyManagerDaily;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.energy_grid_in.to_le_bytes());
        out[4..8].copy_from_slice(&self.energy_grid_out.to_le_bytes());
        let general = self.energy_general_in.iter().chain(self.energy_general_out.iter());
        for (i, value) in general.enumerate() {
            let offset = 8 + i * 4;
            out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut energy_general_in = [0u32; 6];
        let mut energy_general_out = [0u32; 6];
        for i in 0..6 {
            energy_general_in[i] = le_u32(bytes, 8 + i * 4);
            energy_general_out[i] = le_u32(bytes, 32 + i * 4);
        }
        Self {
            energy_grid_in: le_u32(bytes, 0),
            energy_grid_out: le_u32(bytes, 4),
            energy_general_in,
            energy_general_out,
        }
    }

    fn has_data(&self) -> bool {
        self.energy_grid_in != NO_ENERGY
            || self.energy_grid_out != NO_ENERGY
            || self.energy_general_in.iter().any(|&e| e != NO_ENERGY)
            || self.energy_general_out.iter().any(|&e| e != NO_ENERGY)
    }
}

/// Identifies one file: whose data and which day (or month).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey {
    pub subject_id: u32,
    pub year: u16,
    pub month: u8,
    /// `None` for month files
    pub day: Option<u8>,
}

/// 8.3 directory or file name
pub type Name = heapless::String<12>;

/// Full path, for logging
pub type Path = heapless::String<32>;

const BASE32: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Case-insensitive base-32 rendering of a subject id, at most 7 characters.
pub fn encode_id(mut id: u32) -> heapless::String<7> {
    let mut digits = [0u8; 7];
    let mut len = 0;
    loop {
        digits[len] = BASE32[(id % 32) as usize];
        len += 1;
        id /= 32;
        if id == 0 {
            break;
        }
    }
    let mut out = heapless::String::new();
    for &d in digits[..len].iter().rev() {
        // Capacity covers u32::MAX
        let _ = out.push(char::from(d));
    }
    out
}

impl RecordKey {
    /// Directory names from the root down to the file's directory.
    pub fn directories(&self) -> heapless::Vec<Name, 3> {
        let mut dirs = heapless::Vec::new();
        let mut year = Name::new();
        let _ = write!(year, "{:04}", self.year);
        let mut month = Name::new();
        let _ = write!(month, "{:02}", self.month);
        let _ = dirs.push(year);
        let _ = dirs.push(month);
        if let Some(day) = self.day {
            let mut name = Name::new();
            let _ = write!(name, "{:02}", day);
            let _ = dirs.push(name);
        }
        dirs
    }

    pub fn file_name(&self, class: RecordClass) -> Name {
        let mut name = Name::new();
        let _ = write!(name, "{}.{}", encode_id(self.subject_id), class.extension());
        name
    }
}

/// `<year>/<month>[/<day>]/<id>.<ext>`
pub fn path_for(key: &RecordKey, class: RecordClass) -> Path {
    let mut path = Path::new();
    for dir in key.directories() {
        let _ = write!(path, "{}/", dir);
    }
    let _ = write!(path, "{}", key.file_name(class));
    path
}

/// Byte stream of a new, empty file: header then sentinel slots.
///
/// Streams instead of materializing the file, the largest one is over 8 KiB.
pub struct NewFileTemplate {
    class: RecordClass,
    position: usize,
}

impl NewFileTemplate {
    pub fn new(class: RecordClass) -> Self {
        Self { class, position: 0 }
    }

    /// Fills `buf` with the next bytes, returns 0 once the file is complete.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let header = self.class.header();
        let slot_len = self.class.slot_len();
        let mut slot = [0u8; 56];
        self.class.write_no_data(&mut slot[..slot_len]);

        let end = self.class.file_len();
        let mut written = 0;
        while written < buf.len() && self.position < end {
            buf[written] = if self.position < HEADER_LEN {
                header[self.position]
            } else {
                slot[(self.position - HEADER_LEN) % slot_len]
            };
            written += 1;
            self.position += 1;
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn roundtrip<R: SlotRecord + PartialEq>(record: R) {
        let mut bytes = [0u8; 56];
        let len = R::CLASS.slot_len();
        record.write_to(&mut bytes[..len]);
        assert_eq!(R::read_from(&bytes[..len]), record);
    }

    #[test]
    fn test_slot_sizes() {
        assert_eq!(RecordClass::Wallbox5Min.file_len(), 8 + 288 * 3);
        assert_eq!(RecordClass::WallboxDaily.file_len(), 8 + 31 * 4);
        assert_eq!(RecordClass::EnergyManager5Min.file_len(), 8 + 288 * 29);
        assert_eq!(RecordClass::EnergyManagerDaily.file_len(), 8 + 31 * 56);
        for class in RecordClass::ALL {
            assert!(class.chunk_len() <= MAX_CHUNK_LEN);
            assert!(class.chunk_slots() >= 1, "{} chunk holds a slot", class.label());
        }
    }

    #[test]
    fn test_slot_roundtrip() {
        roundtrip(Wallbox5MinSlot {
            flags: 0x03,
            power: 11_000,
        });
        roundtrip(WallboxDailySlot { energy: 42_000 });
        roundtrip(EnergyManager5MinSlot {
            flags: 0,
            power_grid: -3_500,
            power_general: [1, -2, 3, -4, 5, i32::MIN],
        });
        roundtrip(EnergyManagerDailySlot {
            energy_grid_in: 1,
            energy_grid_out: 2,
            energy_general_in: [3, 4, 5, 6, 7, 8],
            energy_general_out: [9, 10, 11, 12, 13, 14],
        });
    }

    #[test]
    fn test_sentinels_decode_as_no_data() {
        let mut bytes = [0u8; 56];
        for class in RecordClass::ALL {
            class.write_no_data(&mut bytes[..class.slot_len()]);
            let slot = &bytes[..class.slot_len()];
            let has_data = match class {
                RecordClass::Wallbox5Min => Wallbox5MinSlot::read_from(slot).has_data(),
                RecordClass::WallboxDaily => WallboxDailySlot::read_from(slot).has_data(),
                RecordClass::EnergyManager5Min => EnergyManager5MinSlot::read_from(slot).has_data(),
                RecordClass::EnergyManagerDaily => EnergyManagerDailySlot::read_from(slot).has_data(),
            };
            assert!(!has_data, "{} sentinel must read as no data", class.label());
        }
    }

    #[test]
    fn test_header() {
        let header = RecordClass::EnergyManagerDaily.header();
        assert_eq!(header, [0x43, 0x42, 0, 3, 0, 0, 0, 0]);
        assert!(RecordClass::EnergyManagerDaily.header_matches(&header));
        assert!(!RecordClass::WallboxDaily.header_matches(&header));
        assert!(!RecordClass::EnergyManagerDaily.header_matches(&header[..4]));
    }

    #[test]
    fn test_id_encoding() {
        assert_eq!(encode_id(0).as_str(), "0");
        assert_eq!(encode_id(31).as_str(), "Z");
        assert_eq!(encode_id(32).as_str(), "10");
        assert_eq!(encode_id(u32::MAX).as_str(), "3ZZZZZZ");
    }

    #[test]
    fn test_paths() {
        let day = RecordKey {
            subject_id: 1234,
            year: 2024,
            month: 2,
            day: Some(5),
        };
        assert_eq!(path_for(&day, RecordClass::Wallbox5Min).as_str(), "2024/02/05/16J.WB");

        let month = RecordKey {
            subject_id: 0,
            year: 2023,
            month: 12,
            day: None,
        };
        assert_eq!(path_for(&month, RecordClass::EnergyManagerDaily).as_str(), "2023/12/0.EMD");
        assert_eq!(month.directories().len(), 2);
    }

    #[test]
    fn test_new_file_template() {
        let class = RecordClass::Wallbox5Min;
        let mut template = NewFileTemplate::new(class);
        let mut file = Vec::new();
        let mut buf = [0u8; 100];
        loop {
            let n = template.read(&mut buf);
            if n == 0 {
                break;
            }
            file.extend_from_slice(&buf[..n]);
        }
        assert_eq!(file.len(), class.file_len());
        assert!(class.header_matches(&file));
        for slot in file[HEADER_LEN..].chunks(class.slot_len()) {
            assert!(!Wallbox5MinSlot::read_from(slot).has_data());
        }
    }
}
