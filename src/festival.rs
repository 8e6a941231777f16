//! Festival window annotation: distances to the surrounding calendar events.

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::calendar::CalendarEvent;
use crate::error::Result;
use crate::table::{self, DATE_COLUMN};

/// Distance reported when there is no event in that direction.
pub const NO_EVENT: i64 = 999;

pub const FESTIVAL_COLUMNS: [&str; 8] = [
    "is_festival_day",
    "days_to_festival",
    "days_after_festival",
    "before_festival_window",
    "after_festival_window",
    "festival_weight",
    "is_poya",
    "in_festival_window",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FestivalFeatures {
    pub is_festival_day: bool,
    pub days_to_festival: i64,
    pub days_after_festival: i64,
    pub before_festival_window: bool,
    pub after_festival_window: bool,
    pub festival_weight: u8,
    pub is_poya: bool,
}

impl FestivalFeatures {
    /// Features of a day with no calendar event in reach.
    pub fn none() -> Self {
        Self {
            is_festival_day: false,
            days_to_festival: NO_EVENT,
            days_after_festival: NO_EVENT,
            before_festival_window: false,
            after_festival_window: false,
            festival_weight: 0,
            is_poya: false,
        }
    }

    pub fn in_window(&self) -> bool {
        self.is_festival_day || self.before_festival_window || self.after_festival_window
    }

    /// Values in `FESTIVAL_COLUMNS` order.
    pub fn values(&self) -> [f64; 8] {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        [
            flag(self.is_festival_day),
            self.days_to_festival as f64,
            self.days_after_festival as f64,
            flag(self.before_festival_window),
            flag(self.after_festival_window),
            f64::from(self.festival_weight),
            flag(self.is_poya),
            flag(self.in_window()),
        ]
    }
}

/// The festival calendar together with its window size. Persisted inside the
/// model artifact so inference sees the calendar training saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FestivalCalendar {
    events: Vec<CalendarEvent>,
    window_days: i64,
}

impl FestivalCalendar {
    pub fn new(mut events: Vec<CalendarEvent>, window_days: i64) -> Self {
        events.sort();
        events.dedup();
        Self { events, window_days }
    }

    pub fn events(&self) -> &[CalendarEvent] {
        &self.events
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    pub fn annotate(&self, date: NaiveDate) -> FestivalFeatures {
        let mut to_next: Option<i64> = None;
        let mut since_last: Option<i64> = None;
        let mut is_poya = false;
        // (distance, signed offset, weight) of the nearest event inside the window
        let mut nearest: Option<(i64, i64, u8)> = None;

        for event in &self.events {
            let offset = (event.date - date).num_days();
            if offset >= 0 {
                to_next = Some(to_next.map_or(offset, |d| d.min(offset)));
            }
            if offset <= 0 {
                since_last = Some(since_last.map_or(-offset, |d| d.min(-offset)));
            }
            if offset == 0 && event.is_poya {
                is_poya = true;
            }
            let distance = offset.abs();
            if distance <= self.window_days {
                let better = match nearest {
                    None => true,
                    Some((best_distance, best_offset, best_weight)) => {
                        let key = (distance, offset);
                        let best = (best_distance, best_offset);
                        key < best || (key == best && event.weight > best_weight)
                    }
                };
                if better {
                    nearest = Some((distance, offset, event.weight));
                }
            }
        }

        let cap = |d: Option<i64>| d.filter(|d| *d < NO_EVENT).unwrap_or(NO_EVENT);
        let days_to_festival = cap(to_next);
        let days_after_festival = cap(since_last);
        let in_window = |d: i64| (1..=self.window_days).contains(&d);
        FestivalFeatures {
            is_festival_day: days_to_festival == 0,
            days_to_festival,
            days_after_festival,
            before_festival_window: in_window(days_to_festival),
            after_festival_window: in_window(days_after_festival),
            festival_weight: nearest.map_or(0, |(_, _, weight)| weight),
            is_poya,
        }
    }

    /// Appends the festival window columns to a table with a `date` column.
    /// Existing columns of the same name are replaced.
    #[instrument(skip_all, fields(rows = df.height(), events = self.events.len()))]
    pub fn annotate_frame(&self, df: &DataFrame) -> Result<DataFrame> {
        let dates = table::date_values(df, DATE_COLUMN)?;
        let features: Vec<FestivalFeatures> = dates
            .iter()
            .map(|d| d.map_or_else(FestivalFeatures::none, |d| self.annotate(d)))
            .collect();

        let mut out = df.clone();
        for (idx, name) in FESTIVAL_COLUMNS.iter().enumerate() {
            let values: Vec<i64> = features
                .iter()
                .map(|f| f.values()[idx] as i64)
                .collect();
            out.with_column(table::i64_column(name, values))?;
        }
        let in_window = features.iter().filter(|f| f.in_window()).count();
        info!("{in_window} of {} rows fall inside a festival window", out.height());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(d: NaiveDate, name: &str, weight: u8) -> CalendarEvent {
        CalendarEvent {
            date: d,
            name: name.to_string(),
            weight,
            is_poya: name.contains("Poya"),
        }
    }

    #[test]
    fn test_days_before_festival() {
        let new_year = event(date(2024, 4, 14), "SinhalaNewYear", 2);
        let calendar = FestivalCalendar::new(vec![new_year], 14);
        let f = calendar.annotate(date(2024, 4, 10));

        assert_eq!(f.days_to_festival, 4);
        assert!(f.before_festival_window);
        assert!(!f.after_festival_window);
        assert_eq!(f.days_after_festival, NO_EVENT);
        assert_eq!(f.festival_weight, 2);
        assert!(!f.is_festival_day);
    }

    #[test]
    fn test_no_nearby_festival() {
        let calendar = FestivalCalendar::new(vec![event(date(2020, 1, 1), "NewYear", 1)], 14);
        let f = calendar.annotate(date(2024, 6, 1));

        assert_eq!(f.days_to_festival, NO_EVENT);
        assert_eq!(f.days_after_festival, NO_EVENT);
        assert!(!f.before_festival_window);
        assert!(!f.after_festival_window);
        assert_eq!(f.festival_weight, 0);
    }

    #[test]
    fn test_empty_calendar() {
        let f = FestivalCalendar::default().annotate(date(2024, 6, 1));
        assert_eq!(f.days_to_festival, NO_EVENT);
        assert!(!f.in_window());
    }

    #[test]
    fn test_festival_day_and_poya() {
        let calendar = FestivalCalendar::new(
            vec![
                event(date(2024, 5, 23), "Vesak Poya", 2),
                event(date(2024, 5, 23), "Public holiday", 1),
            ],
            14,
        );
        let f = calendar.annotate(date(2024, 5, 23));

        assert!(f.is_festival_day);
        assert!(f.is_poya);
        assert_eq!(f.days_to_festival, 0);
        assert_eq!(f.days_after_festival, 0);
        assert!(!f.before_festival_window);
        assert_eq!(f.festival_weight, 2);
    }

    #[test]
    fn test_equidistant_events_prefer_the_earlier() {
        let calendar = FestivalCalendar::new(
            vec![event(date(2024, 3, 1), "Minor", 1), event(date(2024, 3, 11), "Major", 2)],
            14,
        );
        let f = calendar.annotate(date(2024, 3, 6));

        assert_eq!(f.festival_weight, 1);
        assert_eq!(f.days_to_festival, 5);
        assert_eq!(f.days_after_festival, 5);
        assert!(f.before_festival_window && f.after_festival_window);
    }

    #[test]
    fn test_window_boundary() {
        let calendar = FestivalCalendar::new(vec![event(date(2024, 12, 25), "Christmas", 2)], 14);
        assert!(calendar.annotate(date(2024, 12, 11)).before_festival_window);
        let outside = calendar.annotate(date(2024, 12, 10));
        assert!(!outside.before_festival_window);
        assert_eq!(outside.days_to_festival, 15);
        assert_eq!(outside.festival_weight, 0);
    }

    #[test]
    fn test_annotate_frame_adds_columns() {
        let new_year = event(date(2024, 4, 14), "SinhalaNewYear", 2);
        let calendar = FestivalCalendar::new(vec![new_year], 14);
        let df = df!("date" => ["2024-04-10", "2024-04-14", "garbage"]).unwrap();
        let out = calendar.annotate_frame(&df).unwrap();

        for name in FESTIVAL_COLUMNS {
            assert!(out.get_column_index(name).is_some(), "missing {name}");
        }
        let days = table::f64_values(&out, "days_to_festival").unwrap();
        assert_eq!(days, vec![Some(4.0), Some(0.0), Some(999.0)]);
    }
}
