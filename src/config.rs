use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub ingest: IngestConfig,
    pub festival: FestivalConfig,
    pub weather: WeatherConfig,
    pub trainer: TrainerConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to the built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            debug!("Loading config from path: {}", path.display());
            Self::load(path)
        } else {
            info!("Config {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_price_dir: PathBuf,
    pub excel_dir: PathBuf,
    pub festival_calendar: PathBuf,
    pub raw_weather: PathBuf,
    /// Open-Meteo forecast rows used for weather features at inference.
    pub weather_forecast: PathBuf,
    pub processed_dir: PathBuf,
    pub uploads: PathBuf,
    pub model_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_price_dir: PathBuf::from("dataset/raw/csv"),
            excel_dir: PathBuf::from("dataset/raw/xl"),
            festival_calendar: PathBuf::from("dataset/raw/festivals/festivals.csv"),
            raw_weather: PathBuf::from("dataset/raw/weather/weather_data.csv"),
            weather_forecast: PathBuf::from("dataset/raw/weather/weather_forecast.csv"),
            processed_dir: PathBuf::from("dataset/processed"),
            uploads: PathBuf::from("dataset/processed/uploaded_prices.csv"),
            model_path: PathBuf::from("models/fish_price.bin"),
        }
    }
}

impl PathsConfig {
    pub fn processed(&self, file_name: &str) -> PathBuf {
        self.processed_dir.join(file_name)
    }
}

/// Fixed column layout of the weekly price sheets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub header_offset: usize,
    pub id_column: usize,
    pub local_name_column: usize,
    pub common_name_column: usize,
    pub price_column: usize,
    pub target_column: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            header_offset: 3,
            id_column: 0,
            local_name_column: 1,
            common_name_column: 2,
            price_column: 5,
            target_column: "price".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FestivalConfig {
    pub window_days: i64,
    pub major_festivals: Vec<String>,
    pub first_year: i32,
    pub last_year: i32,
    pub country: String,
    pub api_url: String,
}

impl Default for FestivalConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            major_festivals: vec![
                "SinhalaNewYear".to_string(),
                "TamilNewYear".to_string(),
                "Vesak".to_string(),
                "Christmas".to_string(),
                "Eid_al_Fitr".to_string(),
                "Eid_al_Adha".to_string(),
            ],
            first_year: 2020,
            last_year: 2026,
            country: "LK".to_string(),
            api_url: "https://calendarific.com/api/v2/holidays".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Port {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub api_url: String,
    pub forecast_url: String,
    /// Days ahead requested from the forecast endpoint (Open-Meteo allows 16).
    pub forecast_days: u32,
    pub timezone: String,
    pub start_date: NaiveDate,
    pub humidity_threshold: f64,
    pub wind_threshold: f64,
    pub rain_threshold: f64,
    /// Daily rainfall above which `weather_effect` is set.
    pub effect_rain_threshold: f64,
    pub timeout_secs: u64,
    pub ports: Vec<Port>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        let port = |name: &str, latitude: f64, longitude: f64| Port {
            name: name.to_string(),
            latitude,
            longitude,
        };
        Self {
            api_url: "https://archive-api.open-meteo.com/v1/archive".to_string(),
            forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            forecast_days: 14,
            timezone: "Asia/Colombo".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            humidity_threshold: 85.0,
            wind_threshold: 30.0,
            rain_threshold: 5.0,
            effect_rain_threshold: 10.0,
            timeout_secs: 30,
            ports: vec![
                port("Colombo", 6.9271, 79.8612),
                port("Negombo", 7.2083, 79.8358),
                port("Galle", 6.0535, 80.2210),
                port("Trincomalee", 8.5874, 81.2152),
                port("Jaffna", 9.6615, 80.0255),
                port("Hambantota", 6.1246, 81.1185),
                port("Kalpitiya", 8.4020, 79.7557),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: u16,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: 20,
            min_samples_split: 5,
            min_samples_leaf: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub iterations: usize,
    pub max_depth: u32,
    pub learning_rate: f64,
    pub min_leaf_size: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            iterations: 200,
            max_depth: 7,
            learning_rate: 0.1,
            min_leaf_size: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub test_fraction: f64,
    pub seed: u64,
    pub models: Vec<String>,
    pub forest: ForestParams,
    pub boosting: BoostingParams,
    /// Trailing observations kept per entity for inference-time lag features.
    pub history_len: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            models: vec!["random_forest".to_string(), "gradient_boosting".to_string()],
            forest: ForestParams::default(),
            boosting: BoostingParams::default(),
            history_len: 14,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub series_radius_days: i64,
    pub max_series_radius_days: i64,
    pub max_forecast_days: i64,
    pub job_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            min_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            max_date: NaiveDate::from_ymd_opt(2030, 12, 31).unwrap_or_default(),
            series_radius_days: 15,
            max_series_radius_days: 90,
            max_forecast_days: 366,
            job_queue_capacity: 16,
        }
    }
}

impl ServerConfig {
    /// Checks `date` against the served range.
    pub fn check_date(&self, date: NaiveDate) -> Result<NaiveDate> {
        if date < self.min_date || date > self.max_date {
            return Err(PipelineError::InvalidInput(format!(
                "date {date} is outside {} to {}",
                self.min_date, self.max_date
            )));
        }
        Ok(date)
    }

    pub fn check_radius(&self, radius_days: i64) -> Result<i64> {
        if !(0..=self.max_series_radius_days).contains(&radius_days) {
            return Err(PipelineError::InvalidInput(format!(
                "series radius {radius_days} must be between 0 and {}",
                self.max_series_radius_days
            )));
        }
        Ok(radius_days)
    }

    /// Checks both ends of a forecast range and its length.
    pub fn check_range(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        self.check_date(start)?;
        self.check_date(end)?;
        let days = (end - start).num_days() + 1;
        if days > self.max_forecast_days {
            return Err(PipelineError::InvalidInput(format!(
                "forecast range of {days} days exceeds {}",
                self.max_forecast_days
            )));
        }
        Ok(())
    }
}
