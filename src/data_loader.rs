use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{Datelike, Duration, NaiveDate};
use glob::glob;
use polars::prelude::*;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{PipelineError, Result};
use crate::table::{self, DATE_COLUMN};

pub const ENTITY_COLUMN: &str = "entity";
pub const ENTITY_ID_COLUMN: &str = "entity_id";
pub const COMMON_NAME_COLUMN: &str = "common_name";
pub const MARKET_COLUMN: &str = "market";
pub const REGION_COLUMN: &str = "region";

/// One price observation for an entity on a calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub entity: String,
    pub entity_id: Option<i64>,
    pub common_name: Option<String>,
    pub market: Option<String>,
    pub region: Option<String>,
    pub value: f64,
    pub temperature: Option<f64>,
    pub rainfall: Option<f64>,
    pub wind_speed: Option<f64>,
}

impl Observation {
    pub fn new(date: NaiveDate, entity: impl Into<String>, value: f64) -> Self {
        Self {
            date,
            entity: entity.into(),
            entity_id: None,
            common_name: None,
            market: None,
            region: None,
            value,
            temperature: None,
            rainfall: None,
            wind_speed: None,
        }
    }
}

/// Counts gathered while reading raw sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_read: usize,
    pub files_skipped: usize,
    pub rows_read: usize,
    pub rows_dropped: usize,
}

impl IngestReport {
    pub fn absorb(&mut self, other: &IngestReport) {
        self.files_read += other.files_read;
        self.files_skipped += other.files_skipped;
        self.rows_read += other.rows_read;
        self.rows_dropped += other.rows_dropped;
    }
}

/// DataLoader reads raw price sources into normalized observations.
pub struct DataLoader {
    config: IngestConfig,
}

impl DataLoader {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn target_column(&self) -> &str {
        &self.config.target_column
    }

    /// Reads every weekly price sheet in `dir`, dating each from its filename.
    pub fn load_weekly_dir(&self, dir: &Path) -> Result<(Vec<Observation>, IngestReport)> {
        if !dir.is_dir() {
            return Err(PipelineError::MissingInput(dir.to_path_buf()));
        }
        let pattern = dir.join("*.csv");
        let mut paths: Vec<_> = glob(&pattern.to_string_lossy())
            .map_err(|e| PipelineError::InvalidInput(format!("bad glob pattern: {e}")))?
            .filter_map(std::result::Result::ok)
            .collect();
        paths.sort();
        info!("Found {} weekly price files in {}", paths.len(), dir.display());

        let mut observations = Vec::new();
        let mut report = IngestReport::default();
        for path in paths {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let Some(date) = week_start_from_filename(&stem) else {
                warn!(
                    "Skipping {}: no '<Month>_<Nth>_week_<Year>' date in filename",
                    path.display()
                );
                report.files_skipped += 1;
                continue;
            };
            match self.load_weekly_file(&path, date) {
                Ok((rows, file_report)) => {
                    debug!(file = %path.display(), rows = rows.len(), "Weekly sheet parsed");
                    observations.extend(rows);
                    report.absorb(&file_report);
                }
                Err(e) => {
                    warn!("Skipping {}: {e}", path.display());
                    report.files_skipped += 1;
                }
            }
        }
        info!(
            files = report.files_read,
            skipped = report.files_skipped,
            dropped = report.rows_dropped,
            "Extracted {} weekly price records",
            observations.len()
        );
        Ok((observations, report))
    }

    /// Reads one fixed-layout weekly sheet; every row is stamped with `date`.
    pub fn load_weekly_file(
        &self,
        path: &Path,
        date: NaiveDate,
    ) -> Result<(Vec<Observation>, IngestReport)> {
        let df = table::read_csv(path, self.config.header_offset, false)?;
        let source_name = path.display().to_string();
        let layout = [
            ("id", self.config.id_column),
            ("local name", self.config.local_name_column),
            ("common name", self.config.common_name_column),
            ("price", self.config.price_column),
        ];
        for (label, index) in layout {
            if index >= df.width() {
                return Err(PipelineError::MissingColumn {
                    column: format!("{label} (position {index})"),
                    source_name,
                });
            }
        }
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        let ids = table::string_values(&df, &names[self.config.id_column])?;
        let local = table::string_values(&df, &names[self.config.local_name_column])?;
        let common = table::string_values(&df, &names[self.config.common_name_column])?;
        let prices = table::f64_values(&df, &names[self.config.price_column])?;

        let mut report = IngestReport {
            files_read: 1,
            rows_read: df.height(),
            ..Default::default()
        };
        let mut observations = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let id = ids[row].as_deref().and_then(parse_entity_id);
            let record = match (id, &local[row], &common[row], prices[row]) {
                (Some(id), Some(local), Some(common), Some(price)) if price > 0.0 => {
                    let mut obs = Observation::new(date, local.clone(), price);
                    obs.entity_id = Some(id);
                    obs.common_name = Some(common.clone());
                    Some(obs)
                }
                _ => None,
            };
            match record {
                Some(obs) => observations.push(obs),
                None => report.rows_dropped += 1,
            }
        }
        Ok((observations, report))
    }

    /// Reads a headed price table, matching columns by name.
    pub fn load_price_table(&self, path: &Path) -> Result<(Vec<Observation>, IngestReport)> {
        let df = table::read_csv(path, 0, true)?;
        let (rows, mut report) = self.parse_price_frame(&df, &path.display().to_string())?;
        report.files_read = 1;
        Ok((rows, report))
    }

    /// Normalizes an arbitrary headed table into observations.
    ///
    /// Required: a date column, a target column and an entity column. Rows
    /// whose date or target fail to parse are dropped and counted.
    pub fn parse_price_frame(
        &self,
        df: &DataFrame,
        source_name: &str,
    ) -> Result<(Vec<Observation>, IngestReport)> {
        let require = |needles: &[&str], column: &str| {
            table::find_column(df, needles).ok_or_else(|| PipelineError::MissingColumn {
                column: column.to_string(),
                source_name: source_name.to_string(),
            })
        };
        let target = self.config.target_column.to_lowercase();
        let date_col = require(&[DATE_COLUMN], DATE_COLUMN)?;
        let value_col = require(&[target.as_str(), "price", "cost"], &target)?;
        let entity_col = require(
            &[ENTITY_COLUMN, "fish", "species", "sinhala_name", "name"],
            ENTITY_COLUMN,
        )?;
        let optional = |needles: &[&str]| table::find_column(df, needles);
        let id_col = optional(&[ENTITY_ID_COLUMN, "fish_id", "fishid"]);
        let common_col = optional(&[COMMON_NAME_COLUMN]);
        let market_col = optional(&[MARKET_COLUMN]);
        let region_col = optional(&[REGION_COLUMN, "port"]);
        let temp_col = optional(&["temp"]);
        let rain_col = optional(&["rain"]);
        let wind_col = optional(&["wind"]);

        let dates = table::date_values(df, &date_col)?;
        let values = table::f64_values(df, &value_col)?;
        let entities = table::string_values(df, &entity_col)?;
        let strings = |col: &Option<String>| -> Result<Vec<Option<String>>> {
            match col {
                Some(name) => table::string_values(df, name),
                None => Ok(vec![None; df.height()]),
            }
        };
        let numbers = |col: &Option<String>| -> Result<Vec<Option<f64>>> {
            match col {
                Some(name) => table::f64_values(df, name),
                None => Ok(vec![None; df.height()]),
            }
        };
        let ids = strings(&id_col)?;
        let commons = strings(&common_col)?;
        let markets = strings(&market_col)?;
        let regions = strings(&region_col)?;
        let temps = numbers(&temp_col)?;
        let rains = numbers(&rain_col)?;
        let winds = numbers(&wind_col)?;

        let mut report = IngestReport {
            rows_read: df.height(),
            ..Default::default()
        };
        let mut observations = Vec::with_capacity(df.height());
        for row in 0..df.height() {
            let (Some(date), Some(value), Some(entity)) = (dates[row], values[row], &entities[row])
            else {
                report.rows_dropped += 1;
                continue;
            };
            observations.push(Observation {
                date,
                entity: entity.clone(),
                entity_id: ids[row].as_deref().and_then(parse_entity_id),
                common_name: commons[row].clone(),
                market: markets[row].clone(),
                region: regions[row].clone(),
                value,
                temperature: temps[row],
                rainfall: rains[row],
                wind_speed: winds[row],
            });
        }
        if report.rows_dropped > 0 {
            warn!(
                "{source_name}: dropped {} of {} rows with unparseable date or {target}",
                report.rows_dropped, report.rows_read
            );
        }
        Ok((observations, report))
    }
}

fn parse_entity_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(id) = raw.parse::<i64>() {
        return (id >= 0).then_some(id);
    }
    // Spreadsheet exports write integer ids as "12.0".
    raw.parse::<f64>()
        .ok()
        .filter(|v| *v >= 0.0 && v.fract() == 0.0)
        .map(|v| v as i64)
}

/// Parses names like `March_2nd_week_2024` into the first day of that week.
///
/// Week `N` starts on day `1 + (N-1)*7` of the month.
pub fn week_start_from_filename(stem: &str) -> Option<NaiveDate> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)([a-z]+)_?(\d+)(?:st|nd|rd|th)_?week_?(\d{4})")
            .expect("valid filename regex")
    });
    let caps = re.captures(stem)?;
    let month = month_from_name(caps.get(1)?.as_str())?;
    let week: i64 = caps.get(2)?.as_str().parse().ok()?;
    let year: i32 = caps.get(3)?.as_str().parse().ok()?;
    if !(1..=5).contains(&week) {
        return None;
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let start = first + Duration::days((week - 1) * 7);
    (start.month0() == first.month0()).then_some(start)
}

fn month_from_name(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|idx| idx as u32 + 1)
}

/// Builds the canonical observation table. Optional columns are only
/// emitted when at least one observation carries them.
pub fn observations_frame(observations: &[Observation], target: &str) -> Result<DataFrame> {
    let mut columns = vec![
        Column::new(
            DATE_COLUMN.into(),
            observations
                .iter()
                .map(|o| table::format_date(o.date))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            ENTITY_COLUMN.into(),
            observations.iter().map(|o| o.entity.clone()).collect::<Vec<_>>(),
        ),
    ];
    if observations.iter().any(|o| o.entity_id.is_some()) {
        columns.push(Column::new(
            ENTITY_ID_COLUMN.into(),
            observations.iter().map(|o| o.entity_id).collect::<Vec<_>>(),
        ));
    }
    let optional_strings: [(&str, fn(&Observation) -> Option<String>); 3] = [
        (COMMON_NAME_COLUMN, |o| o.common_name.clone()),
        (MARKET_COLUMN, |o| o.market.clone()),
        (REGION_COLUMN, |o| o.region.clone()),
    ];
    for (name, get) in optional_strings {
        let values: Vec<Option<String>> = observations.iter().map(get).collect();
        if values.iter().any(Option::is_some) {
            columns.push(Column::new(name.into(), values));
        }
    }
    columns.push(Column::new(
        target.into(),
        observations.iter().map(|o| o.value).collect::<Vec<_>>(),
    ));
    let optional_numbers: [(&str, fn(&Observation) -> Option<f64>); 3] = [
        ("temp_c", |o| o.temperature),
        ("rainfall", |o| o.rainfall),
        ("wind_speed", |o| o.wind_speed),
    ];
    for (name, get) in optional_numbers {
        let values: Vec<Option<f64>> = observations.iter().map(get).collect();
        if values.iter().any(Option::is_some) {
            columns.push(Column::new(name.into(), values));
        }
    }
    Ok(DataFrame::new(columns)?)
}

/// Appends uploaded observations to the ingest store, newest record winning
/// for each `(date, entity, market)`.
pub fn append_to_store(
    store: &Path,
    uploaded: Vec<Observation>,
    loader: &DataLoader,
) -> anyhow::Result<usize> {
    let mut combined = if store.exists() {
        loader
            .load_price_table(store)
            .with_context(|| format!("Failed to read ingest store {}", store.display()))?
            .0
    } else {
        Vec::new()
    };
    let added = uploaded.len();
    combined.extend(uploaded);

    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<Observation> = combined
        .into_iter()
        .rev()
        .filter(|o| seen.insert((o.date, o.entity.clone(), o.market.clone())))
        .collect();
    kept.reverse();
    kept.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.entity.cmp(&b.entity)));

    let mut df = observations_frame(&kept, loader.target_column())?;
    table::write_csv(&mut df, store)?;
    info!("Ingest store {} now holds {} records", store.display(), kept.len());
    Ok(added)
}
