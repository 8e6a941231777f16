//! The single persisted bundle produced by training and read by inference.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::encoder::CategoryEncoder;
use crate::error::{PipelineError, Result};
use crate::festival::FestivalCalendar;
use crate::metrics::EvaluationReport;
use crate::models::Ensemble;
use crate::weather::WeatherDay;

pub const ARTIFACT_VERSION: u32 = 2;

/// What inference knows about one entity seen in training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProfile {
    pub name: String,
    pub code: u32,
    pub entity_id: Option<i64>,
    pub common_name: Option<String>,
    /// Most frequent market and region in training, used when a request names none.
    pub market: Option<String>,
    pub region: Option<String>,
    pub last_date: Option<NaiveDate>,
    /// Most recent prices, oldest first.
    pub history: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub trained_at: DateTime<Utc>,
    pub target: String,
    pub feature_names: Vec<String>,
    pub encoders: Vec<CategoryEncoder>,
    pub ensemble: Ensemble,
    pub calendar: FestivalCalendar,
    pub rain_threshold: f64,
    /// Mean daily weather over the training period; stands in for days
    /// without a forecast.
    pub weather_baseline: WeatherDay,
    pub profiles: Vec<EntityProfile>,
    pub report: EvaluationReport,
}

impl ModelArtifact {
    /// Writes to a sibling temp file and renames it over `path`, so readers
    /// see either the old artifact or the new one.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = temp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        info!("Saved model artifact to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::ModelArtifactMissing(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let artifact: ModelArtifact = bincode::deserialize_from(reader)?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(PipelineError::InvalidInput(format!(
                "artifact {} is format v{}, expected v{ARTIFACT_VERSION}; retrain it",
                path.display(),
                artifact.version
            )));
        }
        info!(
            features = artifact.feature_names.len(),
            entities = artifact.profiles.len(),
            "Loaded model artifact trained at {}",
            artifact.trained_at
        );
        Ok(artifact)
    }

    pub fn encoder(&self, column: &str) -> Option<&CategoryEncoder> {
        self.encoders.iter().find(|e| e.column() == column)
    }

    pub fn profile_by_id(&self, id: i64) -> Option<&EntityProfile> {
        self.profiles.iter().find(|p| p.entity_id == Some(id))
    }

    /// Matches the entity name, then the common name, ignoring case.
    pub fn profile_by_name(&self, name: &str) -> Option<&EntityProfile> {
        let name = name.trim();
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.profiles.iter().find(|p| {
                    p.common_name
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(name))
                })
            })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
