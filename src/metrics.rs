use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model: String,
    pub mae: f64,
    pub rmse: f64,
    pub r_squared: f64,
}

impl ModelMetrics {
    pub fn compute(model: &str, predictions: &[f64], actuals: &[f64]) -> Result<Self> {
        if predictions.len() != actuals.len() || actuals.is_empty() {
            return Err(PipelineError::Training(format!(
                "cannot score {} predictions against {} actuals",
                predictions.len(),
                actuals.len()
            )));
        }
        let predicted = Array1::from(predictions.to_vec());
        let actual = Array1::from(actuals.to_vec());
        let errors = &actual - &predicted;

        let mae = errors.mapv(f64::abs).mean().unwrap_or(0.0);
        let mse = errors.mapv(|e| e * e).mean().unwrap_or(0.0);
        let mean = actual.mean().unwrap_or(0.0);
        let total = actual.mapv(|a| (a - mean).powi(2)).sum();
        let residual = errors.mapv(|e| e * e).sum();
        // A constant target has no variance to explain.
        let r_squared = if total > 0.0 {
            1.0 - residual / total
        } else if residual == 0.0 {
            1.0
        } else {
            0.0
        };
        Ok(Self {
            model: model.to_string(),
            mae,
            rmse: mse.sqrt(),
            r_squared,
        })
    }
}

/// Test-split scores of every ensemble member and of the ensemble itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub train_rows: usize,
    pub test_rows: usize,
    pub models: Vec<ModelMetrics>,
}

impl EvaluationReport {
    pub fn ensemble(&self) -> Option<&ModelMetrics> {
        self.models.iter().find(|m| m.model == "ensemble")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_metrics() {
        let m =
            ModelMetrics::compute("rf", &[110.0, 190.0, 300.0], &[100.0, 200.0, 300.0]).unwrap();
        assert_relative_eq!(m.mae, 20.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.rmse, (200.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        // SS_tot = 20000, SS_res = 200
        assert_relative_eq!(m.r_squared, 0.99, epsilon = 1e-12);
    }

    #[test]
    fn test_perfect_constant_prediction() {
        let m = ModelMetrics::compute("gb", &[5.0, 5.0], &[5.0, 5.0]).unwrap();
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.r_squared, 1.0);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(ModelMetrics::compute("x", &[1.0], &[]).is_err());
    }
}
