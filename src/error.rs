use std::path::PathBuf;

use polars::error::PolarsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Data loading error: {0}")]
    DataLoading(#[from] PolarsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing input: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("Missing required column '{column}' in {source_name}")]
    MissingColumn { column: String, source_name: String },
    #[error("No price data available: {0}")]
    NoPriceData(String),
    #[error("Feature engineering error: {0}")]
    FeatureEngineering(String),
    #[error("Model training error: {0}")]
    Training(String),
    #[error("Model prediction error: {0}")]
    ModelPrediction(String),
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
    #[error("Model artifact not found at {}; train a model first", .0.display())]
    ModelArtifactMissing(PathBuf),
    #[error("Artifact serialization error: {0}")]
    Artifact(#[from] bincode::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Excel error: {0}")]
    Excel(#[from] calamine::Error),
    #[error(
        "Another pipeline run holds the lock at {}; delete it if no run is active",
        .0.display()
    )]
    PipelineBusy(PathBuf),
    #[error("Invalid input error: {0}")]
    InvalidInput(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
