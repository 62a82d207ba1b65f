// Inference module
// Model abstraction, activity labels, and window classification

pub mod backend;
pub mod dispatcher;
pub mod labels;

pub use backend::{load_model, InferenceError, LinearModel, Model, Tensor};
pub use dispatcher::{argmax, ClassificationResult, InferenceDispatcher, TensorLayout};
pub use labels::{ActivityClass, CLASS_COUNT};
