//! Runs the ingestion stages in order, each rewriting its own output table.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use polars::prelude::DataFrame;
use tracing::{info, instrument, warn};

use crate::artifact::ModelArtifact;
use crate::calendar::{self, CalendarEvent};
use crate::config::Config;
use crate::data_loader::{self, DataLoader, IngestReport};
use crate::error::PipelineError;
use crate::feature_engineering::FeatureEngineer;
use crate::festival::FestivalCalendar;
use crate::merger::Merger;
use crate::table;
use crate::trainer::Trainer;
use crate::weather;

pub const MERGED_PRICE_FILE: &str = "merged_price.csv";
pub const WEATHER_FILE: &str = "weather_dataset.csv";
pub const MERGED_FILE: &str = "final_merged_dataset.csv";
pub const FESTIVAL_FEATURES_FILE: &str = "festival_window_features.csv";
pub const FEATURES_FILE: &str = "features_dataset.csv";
const LOCK_FILE: &str = ".pipeline.lock";

/// Exclusive hold on the processed directory; released on drop.
#[derive(Debug)]
pub struct PipelineLock {
    path: PathBuf,
}

impl PipelineLock {
    /// Takes the lock in `dir`. A lock whose recorded process no longer exists
    /// is removed and taken over.
    pub fn acquire(dir: &Path) -> crate::error::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let Some(pid) = stale_holder(&path) else {
                        break;
                    };
                    warn!("Removing lock {} left by exited process {pid}", path.display());
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::PipelineBusy(path))
    }
}

/// The PID recorded in the lock at `path` when procfs shows it has exited.
/// `None` when the holder is alive or cannot be determined.
fn stale_holder(path: &Path) -> Option<u32> {
    let pid: u32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() || proc_root.join(pid.to_string()).exists() {
        return None;
    }
    Some(pid)
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub ingest: IngestReport,
    pub observations: usize,
    pub weather_days: usize,
    pub calendar_events: usize,
    pub feature_rows: usize,
    pub features_path: PathBuf,
}

/// Reads the festival calendar, or an empty one when the file is absent.
pub fn load_calendar(config: &Config) -> anyhow::Result<FestivalCalendar> {
    let events = read_events(config)?;
    Ok(FestivalCalendar::new(events, config.festival.window_days))
}

fn read_events(config: &Config) -> anyhow::Result<Vec<CalendarEvent>> {
    let path = &config.paths.festival_calendar;
    if !path.exists() {
        warn!(
            "Festival calendar {} not found; festival features default to none",
            path.display()
        );
        return Ok(Vec::new());
    }
    calendar::read_calendar(path, &config.festival)
        .with_context(|| format!("Failed to read festival calendar {}", path.display()))
}

#[instrument(skip_all)]
pub fn run_pipeline(config: &Config) -> anyhow::Result<PipelineReport> {
    let paths = &config.paths;
    let _lock = PipelineLock::acquire(&paths.processed_dir)?;
    let loader = DataLoader::new(&config.ingest);
    let target = loader.target_column().to_string();
    let mut report = PipelineReport::default();

    // Prices: weekly sheets plus the upload store.
    let mut observations = Vec::new();
    match loader.load_weekly_dir(&paths.raw_price_dir) {
        Ok((rows, ingest)) => {
            observations.extend(rows);
            report.ingest.absorb(&ingest);
        }
        Err(PipelineError::MissingInput(dir)) => {
            warn!("No weekly price directory at {}", dir.display())
        }
        Err(e) => return Err(e).context("Failed to read weekly price sheets"),
    }
    if paths.uploads.exists() {
        let (rows, ingest) = loader
            .load_price_table(&paths.uploads)
            .with_context(|| format!("Failed to read uploads {}", paths.uploads.display()))?;
        observations.extend(rows);
        report.ingest.absorb(&ingest);
    }
    if observations.is_empty() {
        return Err(PipelineError::NoPriceData(format!(
            "nothing under {} or {}",
            paths.raw_price_dir.display(),
            paths.uploads.display()
        ))
        .into());
    }
    report.observations = observations.len();
    let mut prices = data_loader::observations_frame(&observations, &target)?;
    write_stage(&mut prices, &paths.processed(MERGED_PRICE_FILE))?;

    // Auxiliary tables.
    let mut auxiliary: Vec<DataFrame> = Vec::new();
    if paths.raw_weather.exists() {
        let raw = weather::read_observations(&paths.raw_weather)
            .with_context(|| format!("Failed to read weather {}", paths.raw_weather.display()))?;
        let days = weather::aggregate_daily(&raw, &config.weather);
        report.weather_days = days.len();
        let mut daily = weather::daily_frame(&days)?;
        write_stage(&mut daily, &paths.processed(WEATHER_FILE))?;
        auxiliary.push(daily);
    } else {
        warn!(
            "No weather data at {}; weather features default to 0",
            paths.raw_weather.display()
        );
    }
    let events = read_events(config)?;
    report.calendar_events = events.len();
    if !events.is_empty() {
        auxiliary.push(calendar::events_frame(&events)?);
    }

    let mut merged = Merger::new(&target).merge(&prices, &auxiliary)?;
    write_stage(&mut merged, &paths.processed(MERGED_FILE))?;

    let festivals = FestivalCalendar::new(events, config.festival.window_days);
    let mut annotated = festivals.annotate_frame(&merged)?;
    write_stage(&mut annotated, &paths.processed(FESTIVAL_FEATURES_FILE))?;

    let mut features = FeatureEngineer::new(&target, config.weather.effect_rain_threshold)
        .engineer_features(&annotated)?;
    report.feature_rows = features.height();
    report.features_path = paths.processed(FEATURES_FILE);
    write_stage(&mut features, &report.features_path)?;

    info!(
        observations = report.observations,
        weather_days = report.weather_days,
        events = report.calendar_events,
        "Pipeline wrote {} feature rows",
        report.feature_rows
    );
    Ok(report)
}

fn write_stage(df: &mut DataFrame, path: &Path) -> anyhow::Result<()> {
    table::write_csv(df, path).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(rows = df.height(), "Wrote {}", path.display());
    Ok(())
}

/// Trains on the feature table and saves the artifact.
#[instrument(skip_all)]
pub fn train_model(config: &Config) -> anyhow::Result<ModelArtifact> {
    let features_path = config.paths.processed(FEATURES_FILE);
    let features = table::read_csv(&features_path, 0, true).with_context(|| {
        format!(
            "Failed to read features {}; run the pipeline first",
            features_path.display()
        )
    })?;
    let calendar = load_calendar(config)?;
    let artifact = Trainer::new(&config.trainer, &config.ingest.target_column)
        .train(&features, calendar, config.weather.effect_rain_threshold)
        .context("Training failed")?;
    let model_path = &config.paths.model_path;
    artifact
        .save(model_path)
        .with_context(|| format!("Failed to save model to {}", model_path.display()))?;
    Ok(artifact)
}

/// Pipeline followed by training, as run after an upload.
pub fn retrain(config: &Config) -> anyhow::Result<ModelArtifact> {
    run_pipeline(config)?;
    train_model(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trainer::tests::small_config;
    use chrono::{Duration, NaiveDate};

    /// A config rooted in `dir` with 60 days of prices for two fish in the
    /// upload store and a one-event calendar.
    pub(crate) fn scratch_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.raw_price_dir = dir.join("raw/csv");
        config.paths.excel_dir = dir.join("raw/xl");
        config.paths.festival_calendar = dir.join("raw/festivals.csv");
        config.paths.raw_weather = dir.join("raw/weather.csv");
        config.paths.weather_forecast = dir.join("raw/forecast.csv");
        config.paths.processed_dir = dir.join("processed");
        config.paths.uploads = dir.join("processed/uploaded_prices.csv");
        config.paths.model_path = dir.join("models/fish.bin");
        config.trainer = small_config();

        let mut csv = String::from("date,fish_id,sinhala_name,common_name,price\n");
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for day in 0..60 {
            let date = start + Duration::days(day);
            csv.push_str(&format!("{date},1,Tuna,Yellowfin tuna,{}\n", 1000 + day * 2));
            csv.push_str(&format!("{date},2,Marlin,Blue marlin,{}\n", 400 + day % 5));
        }
        fs::create_dir_all(&config.paths.processed_dir).unwrap();
        fs::write(&config.paths.uploads, csv).unwrap();

        fs::create_dir_all(dir.join("raw")).unwrap();
        fs::write(
            &config.paths.festival_calendar,
            "festival_name,festival_date\nSinhalaNewYear,2024-02-14\n",
        )
        .unwrap();
        config
    }

    #[test]
    fn test_pipeline_writes_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path());

        let report = run_pipeline(&config).unwrap();
        assert_eq!(report.observations, 120);
        assert_eq!(report.feature_rows, 120);
        assert_eq!(report.calendar_events, 1);
        for file in [MERGED_PRICE_FILE, MERGED_FILE, FESTIVAL_FEATURES_FILE, FEATURES_FILE] {
            assert!(config.paths.processed(file).exists(), "{file} missing");
        }
        assert!(!config.paths.processed(WEATHER_FILE).exists());
        assert!(!config.paths.processed_dir.join(LOCK_FILE).exists());

        let features = table::read_csv(&report.features_path, 0, true).unwrap();
        let windows = table::f64_values(&features, "before_festival_window").unwrap();
        assert!(windows.iter().any(|v| *v == Some(1.0)));
    }

    #[test]
    fn test_second_run_is_refused_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path());

        let _held = PipelineLock::acquire(&config.paths.processed_dir).unwrap();
        let err = run_pipeline(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::PipelineBusy(_))
        ));
    }

    #[test]
    fn test_busy_error_names_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let _held = PipelineLock::acquire(dir.path()).unwrap();
        let err = PipelineLock::acquire(dir.path()).unwrap_err();
        assert!(err.to_string().contains(LOCK_FILE));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_of_an_exited_process_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        // Above the kernel's pid_max, so never a live process.
        fs::write(&path, "4294967295\n").unwrap();

        let lock = PipelineLock::acquire(dir.path()).unwrap();
        let holder = fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_unreadable_lock_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "").unwrap();
        let err = PipelineLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::PipelineBusy(_)));
    }

    #[test]
    fn test_no_prices_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path());
        fs::remove_file(&config.paths.uploads).unwrap();

        let err = run_pipeline(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoPriceData(_))
        ));
    }

    #[test]
    fn test_retrain_saves_a_loadable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = scratch_config(dir.path());

        let trained = retrain(&config).unwrap();
        let loaded = ModelArtifact::load(&config.paths.model_path).unwrap();
        assert_eq!(loaded.feature_names, trained.feature_names);
        assert_eq!(loaded.calendar.events().len(), 1);
        assert_eq!(loaded.profiles.len(), 2);
    }
}
