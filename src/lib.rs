pub mod artifact;
pub mod calendar;
pub mod config;
pub mod data_loader;
pub mod encoder;
pub mod error;
pub mod excel;
pub mod feature_engineering;
pub mod festival;
pub mod merger;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod predictor;
pub mod server;
pub mod table;
pub mod trainer;
pub mod weather;

pub use artifact::ModelArtifact;
pub use config::Config;
pub use data_loader::DataLoader;
pub use error::{PipelineError, Result};
pub use feature_engineering::FeatureEngineer;
pub use festival::FestivalCalendar;
pub use models::{Ensemble, Model};
pub use predictor::{EntityQuery, Predictor};
pub use trainer::Trainer;
