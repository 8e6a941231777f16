use gbdt::{config::Config as GBDTConfig, gradient_boost::GBDT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{FeatureMatrix, IntoDataVec, Model, ModelFactory};
use crate::config::{BoostingParams, TrainerConfig};
use crate::error::{PipelineError, Result};

/// Gradient boosted regression trees with squared-error loss.
#[derive(Serialize, Deserialize)]
pub struct GBDTModel {
    params: BoostingParams,
    model: Option<GBDT>,
}

impl GBDTModel {
    fn gbdt_config(&self, feature_size: usize) -> GBDTConfig {
        let mut config = GBDTConfig::new();
        config.set_feature_size(feature_size);
        config.set_max_depth(self.params.max_depth);
        config.set_iterations(self.params.iterations);
        config.set_shrinkage(self.params.learning_rate as f32);
        config.set_min_leaf_size(self.params.min_leaf_size);
        config.set_loss("SquaredError");
        config.set_debug(false);
        config.set_data_sample_ratio(1.0);
        config.set_feature_sample_ratio(1.0);
        config.set_training_optimization_level(2);
        config
    }
}

impl Model for GBDTModel {
    fn name(&self) -> &'static str {
        "gradient_boosting"
    }

    fn train(&mut self, features: &FeatureMatrix, targets: &[f64]) -> Result<()> {
        if features.is_empty() || features.n_rows() != targets.len() {
            return Err(PipelineError::Training(format!(
                "gradient boosting needs matching non-empty inputs, got {} rows and {} targets",
                features.n_rows(),
                targets.len()
            )));
        }
        let mut train_data = features.into_data_vec(Some(targets));
        let mut gbdt = GBDT::new(&self.gbdt_config(features.n_features()));
        debug!(rows = features.n_rows(), "Fitting gradient boosting");
        gbdt.fit(&mut train_data);
        self.model = Some(gbdt);
        Ok(())
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let model = self.model.as_ref().ok_or_else(|| {
            PipelineError::ModelPrediction("gradient boosting is not trained".to_string())
        })?;
        let test_data = features.into_data_vec(None);
        Ok(model.predict(&test_data).into_iter().map(f64::from).collect())
    }
}

impl ModelFactory for GBDTModel {
    type ModelType = Self;

    fn create(config: &TrainerConfig) -> Self {
        Self {
            params: config.boosting.clone(),
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untrained_model_refuses_to_predict() {
        let model = GBDTModel::create(&TrainerConfig::default());
        let matrix = FeatureMatrix::new(vec!["x".to_string()], vec![vec![1.0]]).unwrap();
        assert!(model.predict(&matrix).is_err());
    }

    #[test]
    fn test_fits_a_step() {
        let mut config = TrainerConfig::default();
        config.boosting.iterations = 50;
        config.boosting.max_depth = 2;
        let mut model = GBDTModel::create(&config);
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![f64::from(i)]).collect();
        let targets: Vec<f64> = (0..40).map(|i| if i < 20 { 100.0 } else { 200.0 }).collect();
        let matrix = FeatureMatrix::new(vec!["x".to_string()], rows).unwrap();
        model.train(&matrix, &targets).unwrap();

        let sample =
            FeatureMatrix::new(vec!["x".to_string()], vec![vec![5.0], vec![35.0]]).unwrap();
        let predictions = model.predict(&sample).unwrap();
        assert!(predictions[0] < 150.0);
        assert!(predictions[1] > 150.0);
    }
}
