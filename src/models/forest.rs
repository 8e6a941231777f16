use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use tracing::debug;

use super::traits::{FeatureMatrix, IntoDenseMatrix, Model, ModelFactory};
use crate::config::{ForestParams, TrainerConfig};
use crate::error::{PipelineError, Result};

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

#[derive(Serialize, Deserialize)]
pub struct RandomForestModel {
    params: ForestParams,
    seed: u64,
    model: Option<Forest>,
}

impl Model for RandomForestModel {
    fn name(&self) -> &'static str {
        "random_forest"
    }

    fn train(&mut self, features: &FeatureMatrix, targets: &[f64]) -> Result<()> {
        if features.is_empty() || features.n_rows() != targets.len() {
            return Err(PipelineError::Training(format!(
                "random forest needs matching non-empty inputs, got {} rows and {} targets",
                features.n_rows(),
                targets.len()
            )));
        }
        let x = features.into_dense_matrix()?;
        let params = RandomForestRegressorParameters::default()
            .with_n_trees(self.params.n_trees)
            .with_max_depth(self.params.max_depth)
            .with_min_samples_split(self.params.min_samples_split)
            .with_min_samples_leaf(self.params.min_samples_leaf)
            .with_seed(self.seed);
        debug!(rows = features.n_rows(), trees = self.params.n_trees, "Fitting random forest");
        let forest = RandomForestRegressor::fit(&x, &targets.to_vec(), params)
            .map_err(|e| PipelineError::Training(format!("random forest: {e}")))?;
        self.model = Some(forest);
        Ok(())
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let model = self.model.as_ref().ok_or_else(|| {
            PipelineError::ModelPrediction("random forest is not trained".to_string())
        })?;
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let x = features.into_dense_matrix()?;
        model
            .predict(&x)
            .map_err(|e| PipelineError::ModelPrediction(format!("random forest: {e}")))
    }
}

impl ModelFactory for RandomForestModel {
    type ModelType = Self;

    fn create(config: &TrainerConfig) -> Self {
        Self {
            params: config.forest.clone(),
            seed: config.seed,
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forest_separates_two_levels() {
        let mut config = TrainerConfig::default();
        config.forest.n_trees = 20;
        config.forest.max_depth = 4;
        let mut model = RandomForestModel::create(&config);
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| vec![f64::from(i % 30), f64::from(i / 30)])
            .collect();
        let targets: Vec<f64> = rows
            .iter()
            .map(|r| if r[1] == 0.0 { 100.0 } else { 300.0 })
            .collect();
        let names = vec!["x".to_string(), "group".to_string()];
        model.train(&FeatureMatrix::new(names.clone(), rows).unwrap(), &targets).unwrap();

        let sample = FeatureMatrix::new(names, vec![vec![10.0, 0.0], vec![10.0, 1.0]]).unwrap();
        let predictions = model.predict(&sample).unwrap();
        assert!(predictions[0] < 200.0);
        assert!(predictions[1] > 200.0);
    }
}
