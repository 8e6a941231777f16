//! Weather observations: Open-Meteo fetches, the raw weather CSV and the
//! per-day aggregates joined onto the price backbone.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{Port, WeatherConfig};
use crate::error::{PipelineError, Result};
use crate::table::{self, DATE_COLUMN};

pub const WEATHER_COLUMNS: [&str; 5] = [
    "temp_c_mean",
    "humidity_mean",
    "wind_speed_max",
    "rainfall_sum",
    "bad_weather_any",
];

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherObservation {
    pub date: NaiveDate,
    pub city: String,
    pub temp_c: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub rainfall: Option<f64>,
}

impl WeatherObservation {
    pub fn is_bad(&self, config: &WeatherConfig) -> bool {
        self.humidity.is_some_and(|h| h > config.humidity_threshold)
            || self.wind_speed.is_some_and(|w| w > config.wind_threshold)
            || self.rainfall.is_some_and(|r| r > config.rain_threshold)
    }
}

/// One aggregated weather row per calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherDay {
    pub temp_c_mean: f64,
    pub humidity_mean: f64,
    pub wind_speed_max: f64,
    pub rainfall_sum: f64,
    pub bad_weather_any: bool,
}

impl WeatherDay {
    /// Field-wise mean; `bad_weather_any` holds when more than half the days were bad.
    pub fn mean(days: &[WeatherDay]) -> WeatherDay {
        if days.is_empty() {
            return WeatherDay::default();
        }
        let n = days.len() as f64;
        let avg = |f: fn(&WeatherDay) -> f64| days.iter().map(f).sum::<f64>() / n;
        let bad = days.iter().filter(|d| d.bad_weather_any).count();
        WeatherDay {
            temp_c_mean: avg(|d| d.temp_c_mean),
            humidity_mean: avg(|d| d.humidity_mean),
            wind_speed_max: avg(|d| d.wind_speed_max),
            rainfall_sum: avg(|d| d.rainfall_sum),
            bad_weather_any: bad * 2 > days.len(),
        }
    }
}

pub fn read_observations(path: &Path) -> Result<Vec<WeatherObservation>> {
    let df = table::read_csv(path, 0, true)?;
    let date_col =
        table::find_column(&df, &[DATE_COLUMN]).ok_or_else(|| PipelineError::MissingColumn {
            column: DATE_COLUMN.to_string(),
            source_name: path.display().to_string(),
        })?;
    let numbers = |needles: &[&str]| -> Result<Vec<Option<f64>>> {
        match table::find_column(&df, needles) {
            Some(name) => table::f64_values(&df, &name),
            None => Ok(vec![None; df.height()]),
        }
    };
    let dates = table::date_values(&df, &date_col)?;
    let cities = match table::find_column(&df, &["city", "port"]) {
        Some(name) => table::string_values(&df, &name)?,
        None => vec![None; df.height()],
    };
    let temps = numbers(&["temp"])?;
    let humidity = numbers(&["humidity"])?;
    let wind = numbers(&["wind"])?;
    let rain = numbers(&["rain", "precip"])?;

    let mut dropped = 0usize;
    let mut observations = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let Some(date) = dates[row] else {
            dropped += 1;
            continue;
        };
        observations.push(WeatherObservation {
            date,
            city: cities[row].clone().unwrap_or_default(),
            temp_c: temps[row],
            humidity: humidity[row],
            wind_speed: wind[row],
            rainfall: rain[row],
        });
    }
    if dropped > 0 {
        warn!("{}: dropped {dropped} weather rows without a valid date", path.display());
    }
    Ok(observations)
}

pub fn write_observations(
    observations: &[WeatherObservation],
    config: &WeatherConfig,
    path: &Path,
) -> Result<()> {
    let mut df = DataFrame::new(vec![
        Column::new(
            DATE_COLUMN.into(),
            observations.iter().map(|o| table::format_date(o.date)).collect::<Vec<_>>(),
        ),
        Column::new("city".into(), observations.iter().map(|o| o.city.clone()).collect::<Vec<_>>()),
        Column::new("temp_c".into(), observations.iter().map(|o| o.temp_c).collect::<Vec<_>>()),
        Column::new("humidity".into(), observations.iter().map(|o| o.humidity).collect::<Vec<_>>()),
        Column::new(
            "wind_speed".into(),
            observations.iter().map(|o| o.wind_speed).collect::<Vec<_>>(),
        ),
        Column::new("rainfall".into(), observations.iter().map(|o| o.rainfall).collect::<Vec<_>>()),
        Column::new(
            "bad_weather".into(),
            observations.iter().map(|o| i64::from(o.is_bad(config))).collect::<Vec<_>>(),
        ),
    ])?;
    table::write_csv(&mut df, path)
}

/// Collapses observations from every port into one row per day.
pub fn aggregate_daily(
    observations: &[WeatherObservation],
    config: &WeatherConfig,
) -> BTreeMap<NaiveDate, WeatherDay> {
    #[derive(Default)]
    struct Acc {
        temp: (f64, usize),
        humidity: (f64, usize),
        wind_max: Option<f64>,
        rain: f64,
        bad: bool,
    }
    let mut by_day: BTreeMap<NaiveDate, Acc> = BTreeMap::new();
    for obs in observations {
        let acc = by_day.entry(obs.date).or_default();
        if let Some(t) = obs.temp_c {
            acc.temp.0 += t;
            acc.temp.1 += 1;
        }
        if let Some(h) = obs.humidity {
            acc.humidity.0 += h;
            acc.humidity.1 += 1;
        }
        if let Some(w) = obs.wind_speed {
            acc.wind_max = Some(acc.wind_max.map_or(w, |m: f64| m.max(w)));
        }
        acc.rain += obs.rainfall.unwrap_or(0.0);
        acc.bad |= obs.is_bad(config);
    }
    let mean = |(sum, n): (f64, usize)| if n == 0 { 0.0 } else { sum / n as f64 };
    by_day
        .into_iter()
        .map(|(date, acc)| {
            (
                date,
                WeatherDay {
                    temp_c_mean: mean(acc.temp),
                    humidity_mean: mean(acc.humidity),
                    wind_speed_max: acc.wind_max.unwrap_or(0.0),
                    rainfall_sum: acc.rain,
                    bad_weather_any: acc.bad,
                },
            )
        })
        .collect()
}

/// The auxiliary weather table keyed by `date`, ready for the merger.
pub fn daily_frame(days: &BTreeMap<NaiveDate, WeatherDay>) -> Result<DataFrame> {
    let pick = |f: fn(&WeatherDay) -> f64| days.values().map(f).collect::<Vec<f64>>();
    Ok(DataFrame::new(vec![
        Column::new(
            DATE_COLUMN.into(),
            days.keys().map(|d| table::format_date(*d)).collect::<Vec<_>>(),
        ),
        table::f64_column(WEATHER_COLUMNS[0], pick(|d| d.temp_c_mean)),
        table::f64_column(WEATHER_COLUMNS[1], pick(|d| d.humidity_mean)),
        table::f64_column(WEATHER_COLUMNS[2], pick(|d| d.wind_speed_max)),
        table::f64_column(WEATHER_COLUMNS[3], pick(|d| d.rainfall_sum)),
        table::i64_column(
            WEATHER_COLUMNS[4],
            days.values().map(|d| i64::from(d.bad_weather_any)).collect(),
        ),
    ])?)
}

#[derive(Debug, Deserialize)]
struct OpenMeteoPayload {
    daily: Option<OpenMeteoDaily>,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoDaily {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    relative_humidity_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
}

/// Parses an Open-Meteo daily payload for one port.
pub fn parse_open_meteo(body: &str, city: &str) -> Result<Vec<WeatherObservation>> {
    let payload: OpenMeteoPayload = serde_json::from_str(body)?;
    let daily = payload
        .daily
        .ok_or_else(|| {
            PipelineError::InvalidInput("no daily data in weather payload".to_string())
        })?;
    let at = |values: &[Option<f64>], i: usize| values.get(i).copied().flatten();
    Ok(daily
        .time
        .iter()
        .enumerate()
        .filter_map(|(i, day)| {
            let date = table::parse_date(day)?;
            Some(WeatherObservation {
                date,
                city: city.to_string(),
                temp_c: at(&daily.temperature_2m_mean, i),
                humidity: at(&daily.relative_humidity_2m_mean, i),
                wind_speed: at(&daily.wind_speed_10m_max, i),
                rainfall: at(&daily.precipitation_sum, i),
            })
        })
        .collect())
}

const DAILY_VARIABLES: &str =
    "temperature_2m_mean,relative_humidity_2m_mean,wind_speed_10m_max,precipitation_sum";

#[instrument(skip(client, config, port, window), fields(port = %port.name))]
fn fetch_port(
    client: &reqwest::blocking::Client,
    config: &WeatherConfig,
    url: &str,
    port: &Port,
    window: &[(&str, String)],
) -> Result<Vec<WeatherObservation>> {
    let mut query = vec![
        ("latitude", port.latitude.to_string()),
        ("longitude", port.longitude.to_string()),
        ("daily", DAILY_VARIABLES.to_string()),
        ("timezone", config.timezone.clone()),
    ];
    query.extend(window.iter().cloned());
    let body = client
        .get(url)
        .query(&query)
        .send()?
        .error_for_status()?
        .text()?;
    parse_open_meteo(&body, &port.name)
}

/// Fetches `url` for every configured port. Ports that fail are skipped.
fn fetch_ports(
    config: &WeatherConfig,
    url: &str,
    window: &[(&str, String)],
) -> Result<Vec<WeatherObservation>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let mut fetched = Vec::new();
    for port in &config.ports {
        match fetch_port(&client, config, url, port, window) {
            Ok(rows) => {
                info!("Fetched {} weather days for {}", rows.len(), port.name);
                fetched.extend(rows);
            }
            Err(e) => warn!("Weather fetch for {} failed, skipping: {e}", port.name),
        }
    }
    Ok(fetched)
}

/// Fetches every configured port and merges the result into the raw weather
/// file, replacing existing `(date, city)` rows.
pub fn refresh_raw_weather(config: &WeatherConfig, path: &Path) -> Result<usize> {
    let window = [
        ("start_date", table::format_date(config.start_date)),
        ("end_date", table::format_date(Local::now().date_naive())),
    ];
    let fetched = fetch_ports(config, &config.api_url, &window)?;
    if fetched.is_empty() {
        warn!("No weather data fetched; weather features will default to 0");
        return Ok(0);
    }

    let existing = if path.exists() { read_observations(path)? } else { Vec::new() };
    let count = fetched.len();
    let merged = merge_observations(existing, fetched);
    write_observations(&merged, config, path)?;
    info!("Weather dataset {} now holds {} rows", path.display(), merged.len());
    Ok(count)
}

/// Replaces the forecast file with the next `forecast_days` days for every port.
/// An empty fetch leaves the previous forecast in place.
pub fn refresh_forecast(config: &WeatherConfig, path: &Path) -> Result<usize> {
    let window = [("forecast_days", config.forecast_days.to_string())];
    let fetched = fetch_ports(config, &config.forecast_url, &window)?;
    if fetched.is_empty() {
        warn!("No forecast weather fetched; keeping {}", path.display());
        return Ok(0);
    }
    write_observations(&fetched, config, path)?;
    info!("Wrote {} forecast weather rows to {}", fetched.len(), path.display());
    Ok(fetched.len())
}

/// Daily forecast aggregates, empty when no forecast has been fetched.
pub fn load_forecast(
    path: &Path,
    config: &WeatherConfig,
) -> Result<BTreeMap<NaiveDate, WeatherDay>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(aggregate_daily(&read_observations(path)?, config))
}

fn merge_observations(
    existing: Vec<WeatherObservation>,
    fresh: Vec<WeatherObservation>,
) -> Vec<WeatherObservation> {
    let mut by_key: BTreeMap<(NaiveDate, String), WeatherObservation> = BTreeMap::new();
    for obs in existing.into_iter().chain(fresh) {
        by_key.insert((obs.date, obs.city.clone()), obs);
    }
    by_key.into_values().collect()
}
