use crate::config::{EngineLifetime, ModelConfig, Settings};
use crate::engine::{EngineLoader, InferenceEngine};
use crate::error::{Error, Result};
use crate::models::{ClassificationResult, NormalizedTensor, ProbabilityVector, DIGIT_LABELS};
use crate::normalize::Normalizer;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Ties keep the first index; an all-zero vector yields `"0"` with probability `0.0`.
pub fn decide(probabilities: &ProbabilityVector) -> ClassificationResult {
    let mut probability = 0.0f64;
    let mut best = 0usize;
    for (i, &v) in probabilities.as_slice().iter().enumerate() {
        if f64::from(v) > probability {
            probability = f64::from(v);
            best = i;
        }
    }
    ClassificationResult {
        label: DIGIT_LABELS[best].to_string(),
        probability,
    }
}

pub fn infer<E>(
    tensor: &NormalizedTensor,
    engine: &mut E,
    model: &ModelConfig,
) -> Result<ClassificationResult>
where
    E: InferenceEngine + ?Sized,
{
    let outputs = engine.invoke(
        &[(model.input_node.as_str(), tensor)],
        &[model.output_node.as_str()],
    )?;
    let output = outputs.first().ok_or_else(|| {
        Error::Inference(format!("Model returned no '{}' output", model.output_node))
    })?;
    let probabilities = ProbabilityVector::from_output(output)?;
    Ok(decide(&probabilities))
}

pub struct Classifier<L: EngineLoader> {
    normalizer: Normalizer,
    model: Arc<ModelConfig>,
    loader: Arc<L>,
    lifetime: EngineLifetime,
    timeout: Option<Duration>,
    shared: Mutex<Option<Arc<Mutex<L::Engine>>>>,
}

impl<L: EngineLoader> Classifier<L> {
    pub fn new(settings: &Settings, loader: L) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            normalizer: Normalizer::new(settings.normalizer)?,
            model: Arc::new(settings.model.clone()),
            loader: Arc::new(loader),
            lifetime: settings.lifetime,
            timeout: settings.inference_timeout(),
            shared: Mutex::new(None),
        })
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<ClassificationResult> {
        let tensor = self.normalizer.normalize(bytes)?;
        self.classify_tensor(tensor)
    }

    pub fn classify_tensor(&self, tensor: NormalizedTensor) -> Result<ClassificationResult> {
        let model = self.model.clone();
        let result = match self.lifetime {
            EngineLifetime::PerRequest => {
                let loader = self.loader.clone();
                self.run_guarded(move || {
                    // Dropped on every exit from this closure, including unwinding.
                    let mut engine = loader.load(&model)?;
                    infer(&tensor, &mut engine, &model)
                })
            }
            EngineLifetime::Shared => {
                let engine = self.shared_engine()?;
                let handle = engine.clone();
                let result = self.run_guarded(move || {
                    let mut guard = engine
                        .lock()
                        .map_err(|_| Error::Inference("Shared session lock poisoned".into()))?;
                    infer(&tensor, &mut *guard, &model)
                });
                if let Err(err @ (Error::Inference(_) | Error::InferenceTimeout(_))) = &result {
                    self.discard_shared(&handle, err);
                }
                result
            }
        }?;
        log::debug!(
            "Classified digit {} (p={:.4})",
            result.label,
            result.probability
        );
        Ok(result)
    }

    fn shared_engine(&self) -> Result<Arc<Mutex<L::Engine>>> {
        let mut slot = self
            .shared
            .lock()
            .map_err(|_| Error::EngineLoad("Shared engine slot poisoned".into()))?;
        if let Some(engine) = slot.as_ref() {
            if !engine.is_poisoned() {
                return Ok(engine.clone());
            }
            log::warn!(
                "Discarding shared session for {} after a failed invocation",
                self.model.model_path.display()
            );
            *slot = None;
        }
        let engine = Arc::new(Mutex::new(self.loader.load(&self.model)?));
        log::info!("Loaded digit model: {}", self.model.model_path.display());
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// A wedged call may still hold `engine`; it is released once that call returns.
    fn discard_shared(&self, engine: &Arc<Mutex<L::Engine>>, cause: &Error) {
        let Ok(mut slot) = self.shared.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, engine)) {
            log::warn!(
                "Discarding shared session for {}: {cause}",
                self.model.model_path.display()
            );
            *slot = None;
        }
    }

    fn run_guarded<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return safe_run(job);
        };
        let (tx, rx) = bounded::<Result<T>>(1);
        thread::Builder::new()
            .name("digit-inference".into())
            .spawn(move || {
                let _ = tx.send(safe_run(job));
            })
            .map_err(|e| Error::Inference(format!("Failed to spawn inference worker: {e}")))?;
        match rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Inference on {} exceeded {:?}; abandoning request",
                    self.model.model_path.display(),
                    timeout
                );
                Err(Error::InferenceTimeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Inference(
                "Inference worker exited without a result".into(),
            )),
        }
    }
}

fn safe_run<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(_) => Err(Error::Inference("ONNX runtime panic".into())),
    }
}
