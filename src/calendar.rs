//! Festival and holiday calendar: reading, classification and generation.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::NaiveDate;
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::FestivalConfig;
use crate::error::{PipelineError, Result};
use crate::table::{self, DATE_COLUMN};

pub const FESTIVAL_NAME_COLUMN: &str = "festival_name";
pub const CALENDARIFIC_KEY_VAR: &str = "CALENDARIFIC_API_KEY";

const MAJOR_WEIGHT: u8 = 2;
const ORDINARY_WEIGHT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub name: String,
    pub weight: u8,
    pub is_poya: bool,
}

impl CalendarEvent {
    pub fn classify(date: NaiveDate, name: impl Into<String>, majors: &[String]) -> Self {
        let name = name.into();
        let lowered = name.to_lowercase();
        let is_major = majors.iter().any(|m| lowered.contains(&m.to_lowercase()));
        Self {
            date,
            weight: if is_major { MAJOR_WEIGHT } else { ORDINARY_WEIGHT },
            is_poya: is_lunar_observance(&name),
            name,
        }
    }
}

/// Poya days are the monthly full-moon observances; Vesak and Poson fall on them.
pub fn is_lunar_observance(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)poya|full\s*moon|vesak|poson").expect("valid poya regex"))
        .is_match(name)
}

/// Reads a calendar CSV: a column containing "date" and a name column.
pub fn read_calendar(path: &Path, config: &FestivalConfig) -> Result<Vec<CalendarEvent>> {
    let df = table::read_csv(path, 0, true)?;
    let source_name = path.display().to_string();
    let date_col =
        table::find_column(&df, &[DATE_COLUMN]).ok_or_else(|| PipelineError::MissingColumn {
            column: DATE_COLUMN.to_string(),
            source_name: source_name.clone(),
        })?;
    let name_col = table::find_column(&df, &[FESTIVAL_NAME_COLUMN, "name", "festival", "holiday"])
        .ok_or_else(|| PipelineError::MissingColumn {
            column: FESTIVAL_NAME_COLUMN.to_string(),
            source_name,
        })?;

    let dates = table::date_values(&df, &date_col)?;
    let names = table::string_values(&df, &name_col)?;
    let mut dropped = 0usize;
    let events: BTreeSet<CalendarEvent> = dates
        .into_iter()
        .zip(names)
        .filter_map(|(date, name)| match (date, name) {
            (Some(date), Some(name)) => {
                Some(CalendarEvent::classify(date, name, &config.major_festivals))
            }
            _ => {
                dropped += 1;
                None
            }
        })
        .collect();
    if dropped > 0 {
        warn!("{}: dropped {dropped} calendar rows without a date or name", path.display());
    }
    info!("Loaded {} calendar events from {}", events.len(), path.display());
    Ok(events.into_iter().collect())
}

pub fn write_calendar(events: &[CalendarEvent], path: &Path) -> Result<()> {
    let mut df = DataFrame::new(vec![
        Column::new(
            FESTIVAL_NAME_COLUMN.into(),
            events.iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "festival_date".into(),
            events.iter().map(|e| table::format_date(e.date)).collect::<Vec<_>>(),
        ),
    ])?;
    table::write_csv(&mut df, path)
}

/// Date-keyed festival table for the merger: `date, festival_name, is_festival`.
pub fn events_frame(events: &[CalendarEvent]) -> Result<DataFrame> {
    Ok(DataFrame::new(vec![
        Column::new(
            DATE_COLUMN.into(),
            events.iter().map(|e| table::format_date(e.date)).collect::<Vec<_>>(),
        ),
        Column::new(
            FESTIVAL_NAME_COLUMN.into(),
            events.iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
        ),
        table::i64_column("is_festival", vec![1; events.len()]),
    ])?)
}

/// Builds the festival master calendar for the configured year range.
///
/// Lunar observances come from Calendarific when `api_key` is present; without
/// it they are skipped and only computed festivals are emitted.
#[instrument(skip(config, api_key))]
pub fn generate_calendar(config: &FestivalConfig, api_key: Option<&str>) -> Vec<CalendarEvent> {
    let mut events = BTreeSet::new();
    let mut push = |date: Option<NaiveDate>, name: &str| {
        if let Some(date) = date {
            events.insert(CalendarEvent::classify(date, name, &config.major_festivals));
        }
    };

    for year in config.first_year..=config.last_year {
        push(NaiveDate::from_ymd_opt(year, 1, 1), "NewYear_Jan1");
        push(NaiveDate::from_ymd_opt(year, 2, 4), "Independence_Day");
        push(NaiveDate::from_ymd_opt(year, 12, 25), "Christmas");
        push(NaiveDate::from_ymd_opt(year, 4, 13), "SinhalaNewYear");
        push(NaiveDate::from_ymd_opt(year, 4, 14), "SinhalaNewYear");
        push(NaiveDate::from_ymd_opt(year, 4, 14), "TamilNewYear");
    }

    // Hijri years overlapping the Gregorian range; out-of-range dates are dropped below.
    let first_hijri = hijri_year_for(config.first_year) - 1;
    let last_hijri = hijri_year_for(config.last_year) + 1;
    for hijri_year in first_hijri..=last_hijri {
        push(hijri_to_gregorian(hijri_year, 10, 1), "Eid_al_Fitr");
        push(hijri_to_gregorian(hijri_year, 12, 10), "Eid_al_Adha");
    }

    match api_key {
        Some(key) => {
            for year in config.first_year..=config.last_year {
                match fetch_lunar_holidays(config, key, year) {
                    Ok(holidays) => {
                        for (date, name) in holidays {
                            push(Some(date), &name);
                        }
                    }
                    Err(e) => warn!("Calendarific fetch for {year} failed: {e}"),
                }
            }
        }
        None => warn!("{CALENDARIFIC_KEY_VAR} not set, skipping Poya / Vesak / Poson"),
    }

    events
        .into_iter()
        .filter(|e| {
            let year = chrono::Datelike::year(&e.date);
            (config.first_year..=config.last_year).contains(&year)
        })
        .collect()
}

fn hijri_year_for(gregorian_year: i32) -> i32 {
    ((gregorian_year - 622) as f64 * 33.0 / 32.0).round() as i32
}

/// Converts a date of the tabular (arithmetic) Islamic calendar.
///
/// Observed dates depend on moon sighting and can differ by a day or two.
pub fn hijri_to_gregorian(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if !(1..=12).contains(&month) || !(1..=30).contains(&day) || year < 1 {
        return None;
    }
    let year = i64::from(year);
    let days_before_month = (29.5 * f64::from(month - 1)).ceil() as i64;
    // Day count since the civil epoch of 16 July 622 (Julian), which is 227_015
    // days after 1 January of year 1 in the proleptic Gregorian calendar.
    let days = i64::from(day) + days_before_month + (year - 1) * 354
        + (3 + 11 * year).div_euclid(30)
        - 1;
    let days_from_ce = 227_015 + days;
    NaiveDate::from_num_days_from_ce_opt(i32::try_from(days_from_ce).ok()?)
}

#[derive(Debug, Deserialize)]
struct CalendarificPayload {
    response: Option<CalendarificResponse>,
}

#[derive(Debug, Deserialize)]
struct CalendarificResponse {
    #[serde(default)]
    holidays: Vec<CalendarificHoliday>,
}

#[derive(Debug, Deserialize)]
struct CalendarificHoliday {
    name: String,
    date: CalendarificDate,
}

#[derive(Debug, Deserialize)]
struct CalendarificDate {
    iso: String,
}

fn fetch_lunar_holidays(
    config: &FestivalConfig,
    key: &str,
    year: i32,
) -> Result<Vec<(NaiveDate, String)>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let payload: CalendarificPayload = client
        .get(&config.api_url)
        .query(&[
            ("api_key", key.to_string()),
            ("country", config.country.clone()),
            ("year", year.to_string()),
        ])
        .send()?
        .error_for_status()?
        .json()?;
    Ok(parse_calendarific(payload))
}

fn parse_calendarific(payload: CalendarificPayload) -> Vec<(NaiveDate, String)> {
    payload
        .response
        .map(|r| r.holidays)
        .unwrap_or_default()
        .into_iter()
        .filter(|h| is_lunar_observance(&h.name))
        .filter_map(|h| {
            let date = table::parse_date(h.date.iso.get(..10)?)?;
            Some((date, h.name.replace(" Day", "").trim().to_string()))
        })
        .collect()
}
