// Classifier backend abstraction
// The trained model is a black box: fixed-shape tensor in, probability vector out

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::labels::CLASS_COUNT;
use crate::window::Channel;

/// Errors that can occur while preparing input or running the model
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Window {window_id} lacks channel {channel:?}")]
    MissingChannel { window_id: Uuid, channel: Channel },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model inference failed: {0}")]
    Model(String),

    #[error("Model returned a non-finite probability at index {0}")]
    InvalidOutput(usize),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model file is not valid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dense row-major f32 tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, InferenceError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(InferenceError::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Tensor { shape, data })
    }
}

/// A trained classifier
pub trait Model: Send + Sync {
    /// Input shape the model was exported with, batch axis included
    fn input_shape(&self) -> &[usize];

    /// Probability per class
    fn predict(&self, input: &Tensor) -> Result<Vec<f32>, InferenceError>;
}

/// Softmax over a linear layer: p = softmax(W·x + b)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub input_shape: Vec<usize>,

    /// One row of `input_len` weights per class
    pub weights: Vec<Vec<f32>>,

    pub bias: Vec<f32>,
}

impl LinearModel {
    pub fn new(
        input_shape: Vec<usize>,
        weights: Vec<Vec<f32>>,
        bias: Vec<f32>,
    ) -> Result<Self, InferenceError> {
        let model = LinearModel {
            input_shape,
            weights,
            bias,
        };
        model.validate()?;
        Ok(model)
    }

    fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    fn validate(&self) -> Result<(), InferenceError> {
        if self.input_shape.is_empty() || self.input_len() == 0 {
            return Err(InferenceError::ModelLoad(format!(
                "input shape {:?} is empty",
                self.input_shape
            )));
        }
        if self.weights.is_empty() {
            return Err(InferenceError::ModelLoad("model has no classes".to_string()));
        }
        if self.weights.len() != self.bias.len() {
            return Err(InferenceError::ModelLoad(format!(
                "{} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        let input_len = self.input_len();
        if let Some((row, weights)) = self
            .weights
            .iter()
            .enumerate()
            .find(|(_, w)| w.len() != input_len)
        {
            return Err(InferenceError::ModelLoad(format!(
                "weight row {} has {} entries, input has {}",
                row,
                weights.len(),
                input_len
            )));
        }
        Ok(())
    }
}

impl Model for LinearModel {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn predict(&self, input: &Tensor) -> Result<Vec<f32>, InferenceError> {
        if input.shape != self.input_shape {
            return Err(InferenceError::ShapeMismatch {
                expected: self.input_shape.clone(),
                actual: input.shape.clone(),
            });
        }

        let logits: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&input.data).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect();

        Ok(softmax(&logits))
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

// On-disk model description, tagged by backend
#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
enum ModelFile {
    Linear(LinearModel),
}

/// Load a model description from a JSON file
pub fn load_model(path: &Path) -> Result<Arc<dyn Model>, InferenceError> {
    let contents = std::fs::read_to_string(path)?;
    let file: ModelFile = serde_json::from_str(&contents)?;

    match file {
        ModelFile::Linear(model) => {
            model.validate()?;
            if model.weights.len() != CLASS_COUNT {
                return Err(InferenceError::ModelLoad(format!(
                    "{} has {} classes, the label table has {}",
                    path.display(),
                    model.weights.len(),
                    CLASS_COUNT
                )));
            }
            log::info!(
                "Loaded linear model from {}: input {:?}, {} classes",
                path.display(),
                model.input_shape,
                model.weights.len()
            );
            Ok(Arc::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn two_class_model() -> LinearModel {
        // Class 0 favors negative sums, class 1 positive sums
        LinearModel::new(
            vec![1, 2, 2],
            vec![vec![-1.0; 4], vec![1.0; 4]],
            vec![0.0, 0.0],
        )
        .unwrap()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(p[3] > 0.99);
    }

    #[test]
    fn test_linear_predicts_by_sign() {
        let model = two_class_model();
        let positive = Tensor::new(vec![1, 2, 2], vec![0.5, 0.5, 1.0, 1.0]).unwrap();
        let negative = Tensor::new(vec![1, 2, 2], vec![-0.5, -0.5, -1.0, -1.0]).unwrap();

        let p = model.predict(&positive).unwrap();
        assert!(p[1] > p[0]);
        let p = model.predict(&negative).unwrap();
        assert!(p[0] > p[1]);
    }

    #[test]
    fn test_linear_rejects_wrong_shape() {
        let model = two_class_model();
        let input = Tensor::new(vec![1, 4], vec![0.0; 4]).unwrap();

        assert!(matches!(
            model.predict(&input),
            Err(InferenceError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tensor_checks_element_count() {
        assert!(Tensor::new(vec![1, 3, 2], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![1, 3, 2], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn test_linear_validation() {
        assert!(LinearModel::new(vec![1, 2], vec![vec![0.0; 2]], vec![]).is_err());
        assert!(LinearModel::new(vec![1, 2], vec![vec![0.0; 3]], vec![0.0]).is_err());
        assert!(LinearModel::new(vec![], vec![vec![0.0]], vec![0.0]).is_err());
    }

    #[test]
    fn test_load_model_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": "linear", "input_shape": [1, 1, 2],
                "weights": [[1.0, 0.0], [0.0, 1.0], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
                "bias": [0.0, 0.5, 0.0, 0.0, 0.0]}}"#
        )
        .unwrap();

        let model = load_model(file.path()).unwrap();
        assert_eq!(model.input_shape(), &[1, 1, 2]);

        let p = model
            .predict(&Tensor::new(vec![1, 1, 2], vec![0.0, 0.0]).unwrap())
            .unwrap();
        assert_eq!(p.len(), CLASS_COUNT);
        assert!(p[1] > p[0]);
    }

    #[test]
    fn test_load_model_rejects_wrong_class_count() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": "linear", "input_shape": [1, 1, 2],
                "weights": [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]], "bias": [0.0, 0.0, 0.0]}}"#
        )
        .unwrap();

        assert!(matches!(
            load_model(file.path()),
            Err(InferenceError::ModelLoad(_))
        ));
    }

    #[test]
    fn test_load_model_rejects_unknown_backend() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"backend": "onnx", "path": "model.onnx"}}"#).unwrap();

        assert!(matches!(load_model(file.path()), Err(InferenceError::Json(_))));
    }
}
