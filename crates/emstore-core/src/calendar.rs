//! Date and time validation for samples and read requests.

use thiserror_no_std::Error;

/// Earliest year the protocol can express
pub const FIRST_YEAR: u16 = 2000;
/// Latest year the protocol can express (8 bit offset from 2000)
pub const LAST_YEAR: u16 = 2255;

/// 5-minute slots in one day
pub const SLOTS_PER_DAY: u16 = 288;
/// Day slots in one month file
pub const SLOTS_PER_MONTH: u16 = 31;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("date or time out of range")]
pub struct DateOutOfRange;

/// Calendar day as sent by the protocol layer, not validated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// Start of a 5-minute interval, not validated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTime {
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
}

impl Date {
    pub const fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    pub const fn at(self, hour: u8, minute: u8) -> SampleTime {
        SampleTime {
            date: self,
            hour,
            minute,
        }
    }
}

impl SampleTime {
    /// Slot of this time in its day file.
    pub fn slot(&self) -> Result<u16, DateOutOfRange> {
        validate_date(self.date.year, self.date.month, self.date.day)?;
        five_minute_slot(self.hour, self.minute)
    }
}

pub const fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month`, zero for an invalid month.
pub const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Checks that `year-month-day` is a real calendar day.
pub fn validate_date(year: u16, month: u8, day: u8) -> Result<(), DateOutOfRange> {
    if !(FIRST_YEAR..=LAST_YEAR).contains(&year) {
        return Err(DateOutOfRange);
    }
    if day == 0 || day > days_in_month(year, month) {
        return Err(DateOutOfRange);
    }
    Ok(())
}

/// Slot of a time of day on the 5-minute grid.
pub fn five_minute_slot(hour: u8, minute: u8) -> Result<u16, DateOutOfRange> {
    if hour > 23 || minute > 55 || minute % 5 != 0 {
        return Err(DateOutOfRange);
    }
    Ok(u16::from(hour) * 12 + u16::from(minute) / 5)
}

/// Validates a 5-minute read of `amount` slots starting at the given time and
/// returns the first slot. The read may not cross midnight.
pub fn five_minute_span(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    amount: u16,
) -> Result<u16, DateOutOfRange> {
    validate_date(year, month, day)?;
    let first = five_minute_slot(hour, minute)?;
    if amount == 0 || u32::from(first) + u32::from(amount) > u32::from(SLOTS_PER_DAY) {
        return Err(DateOutOfRange);
    }
    Ok(first)
}

/// Validates a daily read of `amount` days and returns the first slot. The
/// read may not run past the last day of the month.
pub fn daily_span(year: u16, month: u8, day: u8, amount: u16) -> Result<u16, DateOutOfRange> {
    validate_date(year, month, day)?;
    let remaining = u16::from(days_in_month(year, month) - day) + 1;
    if amount == 0 || amount > remaining {
        return Err(DateOutOfRange);
    }
    Ok(u16::from(day) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leap_years() {
        assert!(is_leap_year(2024));
        assert!(is_leap_year(2000));
        assert!(!is_leap_year(2100));
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2023, 13), 0);
    }

    #[test]
    fn test_calendar_validation() {
        assert_eq!(validate_date(2024, 2, 30), Err(DateOutOfRange));
        assert_eq!(validate_date(2024, 2, 29), Ok(()));
        assert_eq!(validate_date(2023, 2, 29), Err(DateOutOfRange));
        assert_eq!(validate_date(2024, 0, 1), Err(DateOutOfRange));
        assert_eq!(validate_date(2024, 4, 0), Err(DateOutOfRange));
        assert_eq!(validate_date(1999, 1, 1), Err(DateOutOfRange));
    }

    #[test]
    fn test_five_minute_grid() {
        assert_eq!(five_minute_slot(0, 0), Ok(0));
        assert_eq!(five_minute_slot(23, 55), Ok(287));
        assert_eq!(five_minute_slot(12, 7), Err(DateOutOfRange));
        assert_eq!(five_minute_slot(24, 0), Err(DateOutOfRange));
        assert_eq!(five_minute_slot(1, 60), Err(DateOutOfRange));
    }

    #[test]
    fn test_five_minute_span() {
        assert_eq!(five_minute_span(2024, 2, 28, 23, 55, 1), Ok(287));
        assert_eq!(five_minute_span(2024, 2, 30, 0, 0, 1), Err(DateOutOfRange));
        assert_eq!(five_minute_span(2024, 2, 28, 23, 55, 2), Err(DateOutOfRange));
        assert_eq!(five_minute_span(2024, 2, 28, 0, 0, 288), Ok(0));
        assert_eq!(five_minute_span(2024, 2, 28, 0, 0, 0), Err(DateOutOfRange));
    }

    #[test]
    fn test_sample_time_slot() {
        assert_eq!(Date::new(2024, 2, 28).at(23, 55).slot(), Ok(287));
        assert_eq!(Date::new(2024, 2, 30).at(0, 0).slot(), Err(DateOutOfRange));
        assert_eq!(Date::new(2024, 2, 28).at(0, 7).slot(), Err(DateOutOfRange));
    }

    #[test]
    fn test_daily_span() {
        assert_eq!(daily_span(2024, 2, 1, 29), Ok(0));
        assert_eq!(daily_span(2024, 2, 1, 30), Err(DateOutOfRange));
        assert_eq!(daily_span(2024, 1, 31, 1), Ok(30));
        assert_eq!(daily_span(2024, 4, 31, 1), Err(DateOutOfRange));
    }
}
