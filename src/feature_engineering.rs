//! Calendar, effect, weather and lag features on top of the festival-annotated
//! merged table.
//!
//! The same helpers build training rows here and inference rows in the
//! predictor, so both sides see identical feature definitions.

use std::collections::HashMap;
use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::data_loader::ENTITY_COLUMN;
use crate::error::{PipelineError, Result};
use crate::festival::{FestivalFeatures, FESTIVAL_COLUMNS};
use crate::table::{self, DATE_COLUMN};
use crate::weather::{WeatherDay, WEATHER_COLUMNS};

pub const CALENDAR_COLUMNS: [&str; 8] = [
    "day_of_week",
    "month",
    "year",
    "week_of_year",
    "month_sin",
    "month_cos",
    "season",
    "is_weekend",
];

pub const EFFECT_COLUMNS: [&str; 4] = [
    "weather_effect",
    "poya_effect",
    "festival_effect",
    "price_behavior_signal",
];

pub const LAG_COLUMNS: [&str; 4] = [
    "price_lag_1",
    "price_lag_7",
    "price_rolling_mean_7",
    "price_rolling_mean_14",
];

/// Per-observation readings that stand in for each `WEATHER_COLUMNS` entry
/// when the daily aggregate is absent for a row.
const OBSERVED_WEATHER: [Option<&str>; 5] = [
    Some("temp_c"),
    Some("humidity"),
    Some("wind_speed"),
    Some("rainfall"),
    None,
];

/// Festival columns the models consume; `in_festival_window` is descriptive only.
const MODEL_FESTIVAL_COLUMNS: [&str; 7] = [
    "is_festival_day",
    "days_to_festival",
    "days_after_festival",
    "before_festival_window",
    "after_festival_window",
    "festival_weight",
    "is_poya",
];

/// Ordered model inputs: category codes first, then the derived features.
pub fn model_feature_names(code_columns: &[String]) -> Vec<String> {
    code_columns
        .iter()
        .cloned()
        .chain(
            CALENDAR_COLUMNS
                .iter()
                .chain(MODEL_FESTIVAL_COLUMNS.iter())
                .chain(EFFECT_COLUMNS.iter())
                .chain(WEATHER_COLUMNS.iter())
                .chain(LAG_COLUMNS.iter())
                .map(|name| name.to_string()),
        )
        .collect()
}

/// Values in `CALENDAR_COLUMNS` order. `day_of_week` is 0 for Monday and the
/// week number is ISO; seasons run Dec-Feb 1, Mar-May 2, Jun-Aug 3, Sep-Nov 4.
pub fn calendar_values(date: NaiveDate) -> [f64; 8] {
    let month = date.month();
    let day_of_week = date.weekday().num_days_from_monday();
    let angle = 2.0 * PI * f64::from(month) / 12.0;
    let season = match month {
        12 | 1 | 2 => 1.0,
        3..=5 => 2.0,
        6..=8 => 3.0,
        _ => 4.0,
    };
    [
        f64::from(day_of_week),
        f64::from(month),
        f64::from(date.year()),
        f64::from(date.iso_week().week()),
        angle.sin(),
        angle.cos(),
        season,
        if day_of_week >= 5 { 1.0 } else { 0.0 },
    ]
}

/// Values in `EFFECT_COLUMNS` order.
pub fn effect_values(
    is_poya: bool,
    is_festival_day: bool,
    rainfall: f64,
    rain_threshold: f64,
) -> [f64; 4] {
    let weather = if rainfall > rain_threshold { 1.0 } else { 0.0 };
    let poya = if is_poya { 1.0 } else { 0.0 };
    let festival = if is_festival_day { 1.0 } else { 0.0 };
    [weather, poya, festival, weather + poya + festival]
}

pub fn weather_values(day: &WeatherDay) -> [f64; 5] {
    [
        day.temp_c_mean,
        day.humidity_mean,
        day.wind_speed_max,
        day.rainfall_sum,
        if day.bad_weather_any { 1.0 } else { 0.0 },
    ]
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Raw lag values for every position of one entity's chronological series.
///
/// Rolling means cover the current observation and up to 6 (13) previous ones;
/// lags are `None` where the series is too short.
pub fn series_lags(values: &[f64]) -> Vec<[Option<f64>; 4]> {
    (0..values.len())
        .map(|i| {
            [
                i.checked_sub(1).map(|j| values[j]),
                i.checked_sub(7).map(|j| values[j]),
                Some(mean(&values[i.saturating_sub(6)..=i])),
                Some(mean(&values[i.saturating_sub(13)..=i])),
            ]
        })
        .collect()
}

/// Forward fill, then backward fill, then 0.
pub fn fill_gaps(column: &[Option<f64>]) -> Vec<f64> {
    let mut filled: Vec<Option<f64>> = Vec::with_capacity(column.len());
    let mut last = None;
    for value in column {
        last = value.or(last);
        filled.push(last);
    }
    let mut next = None;
    for value in filled.iter_mut().rev() {
        next = value.or(next);
        *value = next;
    }
    filled.into_iter().map(|v| v.unwrap_or(0.0)).collect()
}

/// Lag features for the day following `history` (chronological, newest last).
/// Missing lags fall back to the oldest available price, then 0.
pub fn trailing_lags(history: &[f64]) -> [f64; 4] {
    let Some(oldest) = history.first().copied() else {
        return [0.0; 4];
    };
    let n = history.len();
    [
        history[n - 1],
        n.checked_sub(7).map_or(oldest, |j| history[j]),
        mean(&history[n.saturating_sub(7)..]),
        mean(&history[n.saturating_sub(14)..]),
    ]
}

/// FeatureEngineer turns the festival window table into the model-ready table.
pub struct FeatureEngineer {
    target: String,
    rain_threshold: f64,
}

impl FeatureEngineer {
    pub fn new(target: &str, rain_threshold: f64) -> Self {
        Self {
            target: target.to_string(),
            rain_threshold,
        }
    }

    #[instrument(skip_all, fields(rows = df.height()))]
    pub fn engineer_features(&self, df: &DataFrame) -> Result<DataFrame> {
        for column in [DATE_COLUMN, ENTITY_COLUMN, self.target.as_str()] {
            if df.get_column_index(column).is_none() {
                return Err(PipelineError::MissingColumn {
                    column: column.to_string(),
                    source_name: "festival window table".to_string(),
                });
            }
        }
        let height = df.height();
        let dates = table::date_values(df, DATE_COLUMN)?;
        let mut out = df.clone();

        let calendar: Vec<[f64; 8]> = dates
            .iter()
            .map(|d| d.map_or([0.0; 8], calendar_values))
            .collect();
        for (idx, name) in CALENDAR_COLUMNS.iter().enumerate() {
            let values = calendar.iter().map(|v| v[idx]).collect();
            out.with_column(table::f64_column(name, values))?;
        }

        let none = FestivalFeatures::none().values();
        for (idx, name) in FESTIVAL_COLUMNS.iter().enumerate() {
            if out.get_column_index(name).is_none() {
                debug!("No '{name}' column, using the no-festival default");
                out.with_column(table::f64_column(name, vec![none[idx]; height]))?;
            }
        }
        for (name, observed) in WEATHER_COLUMNS.iter().zip(OBSERVED_WEATHER) {
            let daily = self.optional_numbers(&out, name)?;
            let per_row = match observed {
                Some(observed) => self.optional_numbers(&out, observed)?,
                None => None,
            };
            let values = match (daily, per_row) {
                (Some(daily), Some(per_row)) => daily
                    .into_iter()
                    .zip(per_row)
                    .map(|(d, o)| d.or(o).unwrap_or(0.0))
                    .collect(),
                (Some(values), None) | (None, Some(values)) => {
                    values.into_iter().map(|v| v.unwrap_or(0.0)).collect()
                }
                (None, None) => {
                    warn!("No '{name}' column, weather feature defaults to 0");
                    vec![0.0; height]
                }
            };
            out.with_column(table::f64_column(name, values))?;
        }

        let flag = |name: &str| -> Result<Vec<bool>> {
            Ok(table::f64_values(&out, name)?
                .into_iter()
                .map(|v| v.unwrap_or(0.0) > 0.0)
                .collect())
        };
        let is_poya = flag("is_poya")?;
        let is_festival_day = flag("is_festival_day")?;
        let rainfall = table::f64_values(&out, WEATHER_COLUMNS[3])?;
        let effects: Vec<[f64; 4]> = (0..height)
            .map(|row| {
                effect_values(
                    is_poya[row],
                    is_festival_day[row],
                    rainfall[row].unwrap_or(0.0),
                    self.rain_threshold,
                )
            })
            .collect();
        for (idx, name) in EFFECT_COLUMNS.iter().enumerate() {
            let values = effects.iter().map(|v| v[idx]).collect();
            out.with_column(table::f64_column(name, values))?;
        }

        let lags = self.entity_lags(df, &dates)?;
        for (idx, name) in LAG_COLUMNS.iter().enumerate() {
            let values = lags.iter().map(|v| v[idx]).collect();
            out.with_column(table::f64_column(name, values))?;
        }

        info!(
            "Engineered {} feature columns for {height} rows",
            out.width() - df.width()
        );
        Ok(out)
    }

    fn optional_numbers(&self, df: &DataFrame, name: &str) -> Result<Option<Vec<Option<f64>>>> {
        match df.get_column_index(name) {
            Some(_) => Ok(Some(table::f64_values(df, name)?)),
            None => Ok(None),
        }
    }

    /// Per-entity lag features, returned in the table's row order.
    fn entity_lags(
        &self,
        df: &DataFrame,
        dates: &[Option<NaiveDate>],
    ) -> Result<Vec<[f64; 4]>> {
        let entities = table::string_values(df, ENTITY_COLUMN)?;
        let values = table::f64_values(df, &self.target)?;

        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (row, entity) in entities.iter().enumerate() {
            groups
                .entry(entity.as_deref().unwrap_or_default())
                .or_default()
                .push(row);
        }

        let mut lags = vec![[0.0; 4]; df.height()];
        for rows in groups.values_mut() {
            rows.sort_by_key(|row| dates[*row]);
            let series: Vec<f64> = rows
                .iter()
                .map(|row| values[*row].unwrap_or(0.0))
                .collect();
            let raw = series_lags(&series);
            let columns: Vec<Vec<f64>> = (0..4)
                .map(|idx| fill_gaps(&raw.iter().map(|r| r[idx]).collect::<Vec<_>>()))
                .collect();
            for (pos, row) in rows.iter().enumerate() {
                lags[*row] = [
                    columns[0][pos],
                    columns[1][pos],
                    columns[2][pos],
                    columns[3][pos],
                ];
            }
        }
        Ok(lags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_calendar_values() {
        // 2024-01-06 is a Saturday in ISO week 1
        let v = calendar_values(date(2024, 1, 6));
        assert_eq!(v[0], 5.0);
        assert_eq!(v[1], 1.0);
        assert_eq!(v[2], 2024.0);
        assert_eq!(v[3], 1.0);
        assert_relative_eq!(v[4], (PI / 6.0).sin(), epsilon = 1e-12);
        assert_eq!(v[6], 1.0);
        assert_eq!(v[7], 1.0);

        let monday = calendar_values(date(2024, 9, 2));
        assert_eq!(monday[0], 0.0);
        assert_eq!(monday[6], 4.0);
        assert_eq!(monday[7], 0.0);
    }

    #[test]
    fn test_effects_sum_into_signal() {
        assert_eq!(effect_values(true, true, 12.0, 10.0), [1.0, 1.0, 1.0, 3.0]);
        assert_eq!(effect_values(false, false, 10.0, 10.0), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_series_lags_and_fill() {
        let raw = series_lags(&[100.0, 120.0]);
        assert_eq!(raw[1][0], Some(100.0));
        assert_eq!(raw[1][2], Some(110.0));
        assert_eq!(raw[0][0], None);
        assert_eq!(fill_gaps(&[None, Some(100.0), None]), vec![100.0, 100.0, 100.0]);
        assert_eq!(fill_gaps(&[None, None]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_trailing_lags() {
        assert_eq!(trailing_lags(&[]), [0.0; 4]);
        let history: Vec<f64> = (1..=8).map(f64::from).collect();
        let lags = trailing_lags(&history);
        assert_eq!(lags[0], 8.0);
        assert_eq!(lags[1], 2.0);
        assert_relative_eq!(lags[2], 5.0);
        assert_relative_eq!(lags[3], 4.5);
    }

    #[test]
    fn test_rolling_mean_per_entity() {
        let df = df!(
            "date" => ["2024-01-01", "2024-01-01", "2024-01-08"],
            "entity" => ["A", "B", "A"],
            "price" => ["100", "500", "120"],
            "rainfall_sum" => ["0", "11", "0"],
        )
        .unwrap();
        let out = FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap();

        let rolling = table::f64_values(&out, "price_rolling_mean_7").unwrap();
        assert_eq!(rolling, vec![Some(100.0), Some(500.0), Some(110.0)]);
        let lag_1 = table::f64_values(&out, "price_lag_1").unwrap();
        // First observation of A is back filled from the next row's lag.
        assert_eq!(lag_1, vec![Some(100.0), Some(0.0), Some(100.0)]);
        let weather = table::f64_values(&out, "weather_effect").unwrap();
        assert_eq!(weather, vec![Some(0.0), Some(1.0), Some(0.0)]);
        let days = table::f64_values(&out, "days_to_festival").unwrap();
        assert_eq!(days[0], Some(999.0));

        for name in model_feature_names(&[]) {
            assert!(out.get_column_index(&name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_observation_weather_seeds_daily_columns() {
        let df = df!(
            "date" => ["2024-01-01", "2024-01-02"],
            "entity" => ["A", "A"],
            "price" => ["100", "110"],
            "temp_c" => ["29", "28"],
            "rainfall" => ["25", "0"],
        )
        .unwrap();
        let out = FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap();

        let weather = table::f64_values(&out, "weather_effect").unwrap();
        assert_eq!(weather, vec![Some(1.0), Some(0.0)]);
        let signal = table::f64_values(&out, "price_behavior_signal").unwrap();
        assert_eq!(signal, vec![Some(1.0), Some(0.0)]);
        let rain = table::f64_values(&out, "rainfall_sum").unwrap();
        assert_eq!(rain, vec![Some(25.0), Some(0.0)]);
        let temp = table::f64_values(&out, "temp_c_mean").unwrap();
        assert_eq!(temp, vec![Some(29.0), Some(28.0)]);
        let wind = table::f64_values(&out, "wind_speed_max").unwrap();
        assert_eq!(wind, vec![Some(0.0), Some(0.0)]);
    }

    #[test]
    fn test_daily_weather_wins_over_observation() {
        let df = df!(
            "date" => ["2024-01-01", "2024-01-02"],
            "entity" => ["A", "A"],
            "price" => ["100", "110"],
            "rainfall" => ["25", "30"],
            "rainfall_sum" => ["2", ""],
        )
        .unwrap();
        let out = FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap();

        let rain = table::f64_values(&out, "rainfall_sum").unwrap();
        assert_eq!(rain, vec![Some(2.0), Some(30.0)]);
        let weather = table::f64_values(&out, "weather_effect").unwrap();
        assert_eq!(weather, vec![Some(0.0), Some(1.0)]);
    }
}
