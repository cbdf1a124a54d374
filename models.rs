use crate::error::{Error, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

pub const TARGET_HEIGHT: usize = 28;
pub const TARGET_WIDTH: usize = 28;
pub const NUM_CLASSES: usize = 10;

pub const DIGIT_LABELS: [&str; NUM_CLASSES] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// Batched single-channel image of shape `[1, 28, 28, 1]` (NHWC).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor(Array4<f32>);

impl NormalizedTensor {
    pub const SHAPE: [usize; 4] = [1, TARGET_HEIGHT, TARGET_WIDTH, 1];

    pub fn new(array: Array4<f32>) -> Result<Self> {
        if array.shape() != Self::SHAPE {
            return Err(Error::Resize(format!(
                "expected tensor shape {:?}, got {:?}",
                Self::SHAPE,
                array.shape()
            )));
        }
        Ok(Self(array))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Softmax output of the classifier; index `i` is the score for digit `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityVector([f32; NUM_CLASSES]);

impl ProbabilityVector {
    pub fn new(values: [f32; NUM_CLASSES]) -> Self {
        Self(values)
    }

    /// Accepts `[1, 10]` or a bare `[10]`; anything else is an inference error.
    pub fn from_output(output: &OutputTensor) -> Result<Self> {
        let classes = match output.shape.as_slice() {
            [1, n] | [n] => *n,
            other => {
                return Err(Error::Inference(format!(
                    "expected output shape [1, {NUM_CLASSES}], got {other:?}"
                )))
            }
        };
        if classes != NUM_CLASSES || output.data.len() != NUM_CLASSES {
            return Err(Error::Inference(format!(
                "expected {NUM_CLASSES} class scores, got shape {:?} with {} values",
                output.shape,
                output.data.len()
            )));
        }
        let mut values = [0.0f32; NUM_CLASSES];
        values.copy_from_slice(&output.data);
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    pub probability: f64,
}
