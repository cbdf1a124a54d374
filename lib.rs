//! Turns an uploaded digit image into a `[1, 28, 28, 1]` tensor and classifies it
//! with a pre-trained ten-class model.

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod models;
pub mod normalize;
pub mod onnx;

pub use crate::classify::{decide, infer, Classifier};
pub use crate::config::{EngineLifetime, IntensityPolicy, ModelConfig, NormalizerConfig, Settings};
pub use crate::engine::{EngineLoader, InferenceEngine};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::models::{ClassificationResult, NormalizedTensor, OutputTensor, ProbabilityVector};
pub use crate::normalize::{normalize, InputFormat, Normalizer};
pub use crate::onnx::OnnxLoader;
