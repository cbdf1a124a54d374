use crate::config::ModelConfig;
use crate::error::Result;
use crate::models::{NormalizedTensor, OutputTensor};

/// Dropping the engine releases its session.
pub trait InferenceEngine: Send {
    fn invoke(
        &mut self,
        inputs: &[(&str, &NormalizedTensor)],
        outputs: &[&str],
    ) -> Result<Vec<OutputTensor>>;
}

/// Produces engines from a model location and tag set.
pub trait EngineLoader: Send + Sync + 'static {
    type Engine: InferenceEngine + 'static;

    fn load(&self, model: &ModelConfig) -> Result<Self::Engine>;
}
