use serde::{Deserialize, Serialize};
use tracing::info;

use super::gbdt::GBDTModel;
use super::forest::RandomForestModel;
use super::traits::{FeatureMatrix, Model, ModelFactory};
use crate::config::TrainerConfig;
use crate::error::{PipelineError, Result};

/// A fitted ensemble member.
#[derive(Serialize, Deserialize)]
pub enum Member {
    RandomForest(RandomForestModel),
    GradientBoosting(GBDTModel),
}

impl Member {
    pub fn from_name(name: &str, config: &TrainerConfig) -> Result<Self> {
        match name {
            "random_forest" => Ok(Member::RandomForest(RandomForestModel::create(config))),
            "gradient_boosting" => Ok(Member::GradientBoosting(GBDTModel::create(config))),
            other => Err(PipelineError::Training(format!("unknown model '{other}'"))),
        }
    }

    fn model(&self) -> &dyn Model {
        match self {
            Member::RandomForest(m) => m,
            Member::GradientBoosting(m) => m,
        }
    }

    fn model_mut(&mut self) -> &mut dyn Model {
        match self {
            Member::RandomForest(m) => m,
            Member::GradientBoosting(m) => m,
        }
    }
}

/// Unweighted mean of its members' predictions.
#[derive(Serialize, Deserialize)]
pub struct Ensemble {
    members: Vec<Member>,
}

impl Ensemble {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn from_config(config: &TrainerConfig) -> Result<Self> {
        let members = config
            .models
            .iter()
            .map(|name| Member::from_name(name, config))
            .collect::<Result<Vec<_>>>()?;
        if members.is_empty() {
            return Err(PipelineError::Training("no models configured".to_string()));
        }
        Ok(Self::new(members))
    }

    pub fn member_names(&self) -> Vec<&'static str> {
        self.members.iter().map(|m| m.model().name()).collect()
    }

    /// Predictions of every member, in member order.
    pub fn member_predictions(
        &self,
        features: &FeatureMatrix,
    ) -> Result<Vec<(&'static str, Vec<f64>)>> {
        self.members
            .iter()
            .map(|m| Ok((m.model().name(), m.model().predict(features)?)))
            .collect()
    }
}

impl Model for Ensemble {
    fn name(&self) -> &'static str {
        "ensemble"
    }

    fn train(&mut self, features: &FeatureMatrix, targets: &[f64]) -> Result<()> {
        for member in &mut self.members {
            let model = member.model_mut();
            info!("Training {} on {} rows", model.name(), features.n_rows());
            model.train(features, targets)?;
        }
        Ok(())
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let per_member = self.member_predictions(features)?;
        let count = per_member.len() as f64;
        let mut mean = vec![0.0; features.n_rows()];
        for (_, predictions) in per_member {
            for (acc, p) in mean.iter_mut().zip(predictions) {
                *acc += p / count;
            }
        }
        Ok(mean)
    }
}
