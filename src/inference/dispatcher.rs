// Inference dispatcher
// Lays a resampled window out as the model's input tensor and picks the winning class

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::backend::{InferenceError, Model, Tensor};
use super::labels::{ActivityClass, CLASS_COUNT};
use crate::window::{Channel, TargetLength, Window};

/// Axis order of the model input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, channels, length]`
    #[default]
    ChannelsFirst,
    /// `[1, length, channels]`
    ChannelsLast,
}

/// Model output for one window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub window_id: Uuid,
    pub probabilities: Vec<f32>,
    pub predicted_index: usize,
    pub predicted_label: String,
    pub confidence: f32,
}

impl ClassificationResult {
    pub fn class(&self) -> Option<ActivityClass> {
        ActivityClass::from_index(self.predicted_index)
    }
}

/// Index of the largest value, ties resolved toward the lowest index
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, top)) if v <= top => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

pub struct InferenceDispatcher {
    model: Arc<dyn Model>,
    channels: Vec<Channel>,
    layout: TensorLayout,
}

impl InferenceDispatcher {
    pub fn new(model: Arc<dyn Model>, channels: Vec<Channel>, layout: TensorLayout) -> Self {
        InferenceDispatcher {
            model,
            channels,
            layout,
        }
    }

    /// Build the input tensor in the configured channel order and layout
    pub fn build_tensor(&self, window: &Window) -> Result<Tensor, InferenceError> {
        let columns = self
            .channels
            .iter()
            .map(|&channel| {
                window
                    .channel(channel)
                    .ok_or(InferenceError::MissingChannel {
                        window_id: window.id,
                        channel,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let length = window.len();
        let mut data = Vec::with_capacity(columns.len() * length);

        match self.layout {
            TensorLayout::ChannelsFirst => {
                for column in &columns {
                    data.extend(column.iter().map(|&v| v as f32));
                }
            }
            TensorLayout::ChannelsLast => {
                for i in 0..length {
                    data.extend(columns.iter().map(|column| column[i] as f32));
                }
            }
        }

        Tensor::new(self.input_shape_for(length), data)
    }

    /// Tensor shape a window of `length` points produces
    pub fn input_shape_for(&self, length: usize) -> Vec<usize> {
        match self.layout {
            TensorLayout::ChannelsFirst => vec![1, self.channels.len(), length],
            TensorLayout::ChannelsLast => vec![1, length, self.channels.len()],
        }
    }

    /// Fail early when fixed-length windows can never fit the model input
    ///
    /// Scaled targets vary with the drained sample count and are checked per window.
    pub fn check_target(&self, target: TargetLength) -> Result<(), InferenceError> {
        let TargetLength::Fixed(length) = target else {
            return Ok(());
        };

        let produced = self.input_shape_for(length);
        let expected = self.model.input_shape();
        if produced != expected {
            return Err(InferenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: produced,
            });
        }
        Ok(())
    }

    /// Run the model on a window and derive the predicted class
    pub fn classify(&self, window: &Window) -> Result<ClassificationResult, InferenceError> {
        let tensor = self.build_tensor(window)?;

        let expected = self.model.input_shape();
        if tensor.shape != expected {
            return Err(InferenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: tensor.shape,
            });
        }

        let probabilities = self.model.predict(&tensor)?;
        if probabilities.len() != CLASS_COUNT {
            return Err(InferenceError::ShapeMismatch {
                expected: vec![CLASS_COUNT],
                actual: vec![probabilities.len()],
            });
        }
        if let Some(bad) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(InferenceError::InvalidOutput(bad));
        }

        let predicted_index = argmax(&probabilities).ok_or_else(|| {
            InferenceError::Model("model returned an empty probability vector".to_string())
        })?;
        let class = ActivityClass::from_index(predicted_index).ok_or_else(|| {
            InferenceError::Model(format!("no label for class index {}", predicted_index))
        })?;

        log::debug!(
            "Window {} from device {} classified as {} ({:.3})",
            window.id,
            window.device_id,
            class.as_str(),
            probabilities[predicted_index]
        );

        Ok(ClassificationResult {
            window_id: window.id,
            confidence: probabilities[predicted_index],
            predicted_index,
            predicted_label: class.as_str().to_string(),
            probabilities,
        })
    }
}
