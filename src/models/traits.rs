use gbdt::decision_tree::{Data, DataVec};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::config::TrainerConfig;
use crate::error::{PipelineError, Result};

/// Row-major model inputs with their column names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|r| r.len() != names.len()) {
            return Err(PipelineError::FeatureEngineering(format!(
                "row {bad} has {} values, expected {}",
                rows[bad].len(),
                names.len()
            )));
        }
        Ok(Self { names, rows })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            names: self.names.clone(),
            rows: indices.iter().map(|i| self.rows[*i].clone()).collect(),
        }
    }
}

pub trait Model {
    fn name(&self) -> &'static str;
    fn train(&mut self, features: &FeatureMatrix, targets: &[f64]) -> Result<()>;
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>>;
}

pub trait ModelFactory {
    type ModelType: Model;

    fn create(config: &TrainerConfig) -> Self::ModelType;
}

pub trait IntoDataVec {
    /// Training data when `targets` is given, test data otherwise.
    fn into_data_vec(self, targets: Option<&[f64]>) -> DataVec;
}

impl IntoDataVec for &FeatureMatrix {
    fn into_data_vec(self, targets: Option<&[f64]>) -> DataVec {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let values: Vec<f32> = row.iter().map(|v| *v as f32).collect();
                match targets {
                    Some(targets) => {
                        Data::new_training_data(values, 1.0, targets[idx] as f32, None)
                    }
                    None => Data::new_test_data(values, None),
                }
            })
            .collect()
    }
}

pub trait IntoDenseMatrix {
    fn into_dense_matrix(self) -> Result<DenseMatrix<f64>>;
}

impl IntoDenseMatrix for &FeatureMatrix {
    fn into_dense_matrix(self) -> Result<DenseMatrix<f64>> {
        DenseMatrix::from_2d_vec(&self.rows)
            .map_err(|e| PipelineError::FeatureEngineering(format!("matrix error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_rows_are_rejected() {
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(FeatureMatrix::new(names.clone(), vec![vec![1.0, 2.0]]).is_ok());
        assert!(FeatureMatrix::new(names, vec![vec![1.0]]).is_err());
    }

    #[test]
    fn test_data_vec_carries_targets() {
        let matrix = FeatureMatrix::new(vec!["a".to_string()], vec![vec![1.5], vec![2.5]]).unwrap();
        let data = (&matrix).into_data_vec(Some(&[10.0, 20.0]));
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].feature, vec![2.5f32]);
        assert_eq!(data[1].label, 20.0);
    }
}
