//! Static holiday calendar with padded intervals.

use std::sync::OnceLock;

use chrono::{Days, NaiveDate, NaiveDateTime};

pub const DEFAULT_HOLIDAY_PADDING_DAYS: u64 = 3;

const JEWISH_HOLIDAYS: [(&str, (i32, u32, u32), (i32, u32, u32)); 12] = [
    ("Pesach23", (2023, 4, 5), (2023, 4, 12)),
    ("Shavuot23", (2023, 5, 25), (2023, 5, 26)),
    ("Rosh Hashanah23", (2023, 9, 15), (2023, 9, 17)),
    ("Yom Kippur23", (2023, 9, 24), (2023, 9, 25)),
    ("Sukkot23", (2023, 9, 30), (2023, 10, 5)),
    ("Hanukkah23", (2023, 12, 7), (2023, 12, 15)),
    ("Pesach22", (2022, 4, 15), (2022, 4, 22)),
    ("Shavuot22", (2022, 6, 4), (2022, 6, 5)),
    ("Rosh Hashanah22", (2022, 9, 25), (2022, 9, 27)),
    ("Yom Kippur22", (2022, 10, 4), (2022, 10, 5)),
    ("Sukkot22", (2022, 10, 9), (2022, 10, 16)),
    ("Hanukkah22", (2022, 12, 18), (2022, 12, 26)),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holiday {
    pub name: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PaddedInterval {
    from: NaiveDateTime,
    to: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolidayCalendar {
    holidays: Vec<Holiday>,
    padded: Vec<PaddedInterval>,
}

impl HolidayCalendar {
    pub fn new(holidays: Vec<Holiday>, padding_days: u64) -> Self {
        let padded = holidays
            .iter()
            .filter_map(|holiday| {
                let from = holiday.from.checked_sub_days(Days::new(padding_days))?;
                let to = holiday.to.checked_add_days(Days::new(padding_days))?;
                Some(PaddedInterval {
                    from: from.and_hms_opt(0, 0, 0)?,
                    to: to.and_hms_opt(0, 0, 0)?,
                })
            })
            .collect();

        Self { holidays, padded }
    }

    pub fn jewish_holidays() -> &'static HolidayCalendar {
        static CALENDAR: OnceLock<HolidayCalendar> = OnceLock::new();
        CALENDAR.get_or_init(|| {
            let holidays = JEWISH_HOLIDAYS
                .iter()
                .filter_map(|(name, from, to)| {
                    Some(Holiday {
                        name: (*name).to_string(),
                        from: NaiveDate::from_ymd_opt(from.0, from.1, from.2)?,
                        to: NaiveDate::from_ymd_opt(to.0, to.1, to.2)?,
                    })
                })
                .collect();
            HolidayCalendar::new(holidays, DEFAULT_HOLIDAY_PADDING_DAYS)
        })
    }

    pub fn holidays(&self) -> &[Holiday] {
        &self.holidays
    }

    // Both padded bounds inclusive; the end is midnight of `to + padding`.
    pub fn is_holiday(&self, local: NaiveDateTime) -> bool {
        self.padded
            .iter()
            .any(|interval| local >= interval.from && local <= interval.to)
    }
}
