use crate::config::{ModelConfig, ProviderChoice, RuntimeConfig};
use crate::engine::{EngineLoader, InferenceEngine};
use crate::error::{Error, Result};
use crate::models::{NormalizedTensor, OutputTensor};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Tensor;

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OnnxLoader {
    runtime: RuntimeConfig,
}

impl OnnxLoader {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }
}

impl EngineLoader for OnnxLoader {
    type Engine = OnnxEngine;

    fn load(&self, model: &ModelConfig) -> Result<OnnxEngine> {
        check_tags(&model.model_path, &model.tags)?;
        let (session, provider) = build_session(&model.model_path, self.runtime)?;
        log::debug!(
            "Opened session for {} on {}",
            model.model_path.display(),
            provider.label()
        );
        Ok(OnnxEngine { session, provider })
    }
}

pub struct OnnxEngine {
    session: Session,
    provider: InferenceProvider,
}

impl OnnxEngine {
    pub fn provider(&self) -> InferenceProvider {
        self.provider
    }

    fn check_nodes(&self, inputs: &[(&str, &NormalizedTensor)], outputs: &[&str]) -> Result<()> {
        for (name, _) in inputs {
            if !self.session.inputs.iter().any(|i| i.name == *name) {
                return Err(Error::Inference(format!("Model has no input node '{name}'")));
            }
        }
        for name in outputs {
            if !self.session.outputs.iter().any(|o| o.name == *name) {
                return Err(Error::Inference(format!("Model has no output node '{name}'")));
            }
        }
        Ok(())
    }
}

impl InferenceEngine for OnnxEngine {
    fn invoke(
        &mut self,
        inputs: &[(&str, &NormalizedTensor)],
        outputs: &[&str],
    ) -> Result<Vec<OutputTensor>> {
        self.check_nodes(inputs, outputs)?;
        let mut feeds: Vec<(String, Tensor<f32>)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let value = Tensor::from_array(tensor.as_array().clone())
                .map_err(|e| Error::Inference(format!("Invalid input tensor for '{name}': {e}")))?;
            feeds.push((name.to_string(), value));
        }
        let results = self
            .session
            .run(feeds)
            .map_err(|e| Error::Inference(format!("Failed to run digit model: {e}")))?;
        outputs
            .iter()
            .map(|name| -> Result<OutputTensor> {
                let value = results
                    .get(*name)
                    .ok_or_else(|| Error::Inference(format!("Model returned no '{name}' output")))?;
                let (shape, data) = value
                    .try_extract_tensor::<f32>()
                    .map_err(|e| Error::Inference(format!("Output '{name}' is not f32: {e}")))?;
                Ok(OutputTensor {
                    shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                    data: data.to_vec(),
                })
            })
            .collect()
    }
}

/// Tags the artifact was exported with, read from the `<model>.tags.txt` sidecar.
fn load_model_tags(model_path: &Path) -> Option<HashSet<String>> {
    let tags_path = model_path.with_extension("tags.txt");
    let contents = match std::fs::read_to_string(&tags_path) {
        Ok(data) => data,
        Err(_) => return None,
    };
    Some(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
    )
}

fn check_tags(model_path: &Path, wanted: &[String]) -> Result<()> {
    if wanted.is_empty() {
        return Ok(());
    }
    let Some(exported) = load_model_tags(model_path) else {
        log::warn!(
            "No tags sidecar for {}; accepting model without tag check",
            model_path.display()
        );
        return Ok(());
    };
    let missing: Vec<&str> = wanted
        .iter()
        .filter(|tag| !exported.contains(*tag))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(Error::EngineLoad(format!(
            "Tag mismatch for {}: missing {}",
            model_path.display(),
            missing.join(", ")
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
const ORT_LIBRARY: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIBRARY: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIBRARY: &str = "libonnxruntime.so";

/// `ORT_DYLIB_PATH` wins; otherwise the copy `build.rs` places in `onnxruntime/` beside the binary.
fn runtime_library(configured: Option<PathBuf>, exe_dir: Option<&Path>) -> Option<PathBuf> {
    configured
        .into_iter()
        .chain(exe_dir.map(|dir| dir.join("onnxruntime").join(ORT_LIBRARY)))
        .find(|path| path.is_file())
}

fn find_runtime() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok();
    runtime_library(
        std::env::var_os("ORT_DYLIB_PATH").map(PathBuf::from),
        exe.as_deref().and_then(Path::parent),
    )
}

fn locate_runtime() -> Result<()> {
    let Some(library) = find_runtime() else {
        if cfg!(target_os = "windows") {
            return Err(Error::EngineLoad(format!(
                "{ORT_LIBRARY} not found next to the executable; set ORT_DYLIB_PATH"
            )));
        }
        log::debug!("ORT_DYLIB_PATH unset; using the system {ORT_LIBRARY}");
        return Ok(());
    };
    std::env::set_var("ORT_DYLIB_PATH", &library);
    // DirectML.dll is resolved through PATH from the runtime's own directory.
    #[cfg(target_os = "windows")]
    {
        static PATH_PREPENDED: std::sync::Once = std::sync::Once::new();
        if let Some(dir) = library.parent() {
            PATH_PREPENDED.call_once(|| {
                let mut path = std::ffi::OsString::from(dir);
                path.push(";");
                path.push(std::env::var_os("PATH").unwrap_or_default());
                std::env::set_var("PATH", path);
            });
        }
    }
    Ok(())
}

fn ensure_environment() -> Result<()> {
    let committed = ort::init()
        .with_name("digit-classifier")
        .commit()
        .map_err(|e| Error::EngineLoad(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

fn load_err(e: impl std::fmt::Display) -> Error {
    Error::EngineLoad(e.to_string())
}

#[cfg(target_os = "windows")]
fn directml_available() -> bool {
    matches!(DirectMLExecutionProvider::default().is_available(), Ok(true))
}

#[cfg(not(target_os = "windows"))]
fn directml_available() -> bool {
    false
}

fn provider_plan(
    choice: ProviderChoice,
    device_id: u32,
    directml: bool,
) -> Result<Vec<InferenceProvider>> {
    let gpu = InferenceProvider::DirectML { device_id };
    match (choice, directml) {
        (ProviderChoice::CpuOnly, _) | (ProviderChoice::Auto, false) => {
            Ok(vec![InferenceProvider::Cpu])
        }
        (ProviderChoice::Auto, true) => Ok(vec![gpu, InferenceProvider::Cpu]),
        (ProviderChoice::DirectMLOnly, true) => Ok(vec![gpu]),
        (ProviderChoice::DirectMLOnly, false) => Err(Error::EngineLoad(
            "DirectML execution provider unavailable".into(),
        )),
    }
}

fn session_builder(cfg: RuntimeConfig, provider: InferenceProvider) -> Result<SessionBuilder> {
    let mut builder = Session::builder()
        .map_err(load_err)?
        .with_optimization_level(GraphOptimizationLevel::Level1)
        .map_err(load_err)?
        .with_parallel_execution(false)
        .map_err(load_err)?;
    if let Some(threads) = cfg.intra_threads {
        builder = builder.with_intra_threads(threads).map_err(load_err)?;
    }
    match provider {
        InferenceProvider::Cpu => Ok(builder),
        #[cfg(target_os = "windows")]
        InferenceProvider::DirectML { device_id } => {
            let ep = DirectMLExecutionProvider::default()
                .with_device_id(device_id as i32)
                .build();
            builder
                .with_memory_pattern(false)
                .map_err(load_err)?
                .with_execution_providers([ep])
                .map_err(load_err)
        }
        #[cfg(not(target_os = "windows"))]
        InferenceProvider::DirectML { .. } => Err(Error::EngineLoad(
            "DirectML is only available on Windows".into(),
        )),
    }
}

fn open_session(model_path: &Path, cfg: RuntimeConfig, provider: InferenceProvider) -> Result<Session> {
    let open = || -> Result<Session> {
        session_builder(cfg, provider)?
            .commit_from_file(model_path)
            .map_err(load_err)
    };
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(open)).unwrap_or_else(|_| {
        Err(Error::EngineLoad(format!(
            "ONNX Runtime panicked while opening a {} session",
            provider.label()
        )))
    })
}

pub fn build_session(model_path: &Path, cfg: RuntimeConfig) -> Result<(Session, InferenceProvider)> {
    if !model_path.is_file() {
        return Err(Error::EngineLoad(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    locate_runtime()?;
    ensure_environment()?;
    let plan = provider_plan(cfg.provider, cfg.resolved_device_id(), directml_available())?;
    let mut last_err = None;
    for provider in plan {
        match open_session(model_path, cfg, provider) {
            Ok(session) => return Ok((session, provider)),
            Err(err) => {
                log::warn!(
                    "{} session for {} failed: {err}",
                    provider.label(),
                    model_path.display()
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::EngineLoad("No execution provider to try".into())))
}

pub fn ort_runtime_version() -> Option<String> {
    find_runtime()?;
    let info = ort::info();
    let branch = info
        .split(',')
        .find_map(|field| field.trim().strip_prefix("git-branch=rel-"))
        .map(str::to_string);
    Some(branch.unwrap_or_else(|| format!("1.{}.x", ort::MINOR_VERSION)))
}
