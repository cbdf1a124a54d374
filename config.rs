use crate::error::{Error, Result};
use crate::normalize::InputFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Must match how the loaded model was trained; never inferred from the model file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntensityPolicy {
    Raw,
    /// `(value - mean) / scale`.
    Scaled { mean: f32, scale: f32 },
}

impl IntensityPolicy {
    pub fn validate(&self) -> Result<()> {
        if let Self::Scaled { mean, scale } = *self {
            if !mean.is_finite() {
                return Err(Error::Config(format!("policy mean must be finite, got {mean}")));
            }
            if !scale.is_finite() || scale == 0.0 {
                return Err(Error::Config(format!(
                    "policy scale must be finite and non-zero, got {scale}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn apply(&self, value: f32) -> f32 {
        match *self {
            Self::Raw => value,
            Self::Scaled { mean, scale } => (value - mean) / scale,
        }
    }
}

impl FromStr for IntensityPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let mut parts = lowered.split(':');
        let policy = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("raw"), None, None, None) => Self::Raw,
            (Some("scaled"), Some(mean), Some(scale), None) => {
                let mean = mean
                    .parse::<f32>()
                    .map_err(|e| Error::Config(format!("invalid policy mean '{mean}': {e}")))?;
                let scale = scale
                    .parse::<f32>()
                    .map_err(|e| Error::Config(format!("invalid policy scale '{scale}': {e}")))?;
                Self::Scaled { mean, scale }
            }
            _ => {
                return Err(Error::Config(format!(
                    "unknown policy '{s}'; expected raw or scaled:<mean>:<scale>"
                )))
            }
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default)]
    pub format: InputFormat,
    #[serde(default)]
    pub policy: Option<IntensityPolicy>,
}

impl NormalizerConfig {
    pub fn required_policy(&self) -> Result<IntensityPolicy> {
        let policy = self
            .policy
            .ok_or_else(|| Error::Config("normalizer.policy must be set".into()))?;
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_input_node")]
    pub input_node: String,
    #[serde(default = "default_output_node")]
    pub output_node: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("mymnist.onnx"),
            tags: default_tags(),
            input_node: default_input_node(),
            output_node: default_output_node(),
        }
    }
}

fn default_tags() -> Vec<String> {
    vec!["mnisttag".to_string()]
}

fn default_input_node() -> String {
    "conv2d_1_input".to_string()
}

fn default_output_node() -> String {
    "dense_2/Softmax".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChoice {
    #[default]
    Auto,
    CpuOnly,
    #[serde(rename = "directml_only")]
    DirectMLOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

impl RuntimeConfig {
    pub fn resolved_device_id(self) -> u32 {
        self.device_id.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLifetime {
    #[default]
    PerRequest,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub lifetime: EngineLifetime,
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            model: ModelConfig::default(),
            runtime: RuntimeConfig::default(),
            lifetime: EngineLifetime::default(),
            inference_timeout_ms: default_inference_timeout_ms(),
            workers: default_workers(),
        }
    }
}

fn default_inference_timeout_ms() -> u64 {
    30_000
}

fn default_workers() -> usize {
    2
}

pub const ENV_MODEL: &str = "DIGIT_CLASSIFIER_MODEL";
pub const ENV_POLICY: &str = "DIGIT_CLASSIFIER_POLICY";
pub const ENV_TIMEOUT_MS: &str = "DIGIT_CLASSIFIER_TIMEOUT_MS";
pub const ENV_WORKERS: &str = "DIGIT_CLASSIFIER_WORKERS";

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&data)?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.trim().is_empty()) {
            self.model.model_path = PathBuf::from(model);
        }
        if let Some(policy) = lookup(ENV_POLICY) {
            self.normalizer.policy = Some(policy.parse()?);
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_MS) {
            self.inference_timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {ENV_TIMEOUT_MS} '{timeout}': {e}")))?;
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = workers
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {ENV_WORKERS} '{workers}': {e}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.normalizer.required_policy()?;
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.model.input_node.is_empty() || self.model.output_node.is_empty() {
            return Err(Error::Config("model input and output node names are required".into()));
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        if self.inference_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.inference_timeout_ms))
        }
    }

    pub fn resolve_model(&mut self, base: &Path) {
        if self.model.model_path.is_relative() {
            self.model.model_path = base.join(&self.model.model_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "normalizer": { "policy": { "mode": "scaled", "mean": 1.0, "scale": 1.0 } } }"#,
        )
        .unwrap();
        assert_eq!(
            settings.normalizer.policy,
            Some(IntensityPolicy::Scaled { mean: 1.0, scale: 1.0 })
        );
        assert_eq!(settings.normalizer.format, InputFormat::Jpeg);
        assert_eq!(settings.model.input_node, "conv2d_1_input");
        assert_eq!(settings.model.output_node, "dense_2/Softmax");
        assert_eq!(settings.model.tags, vec!["mnisttag".to_string()]);
        assert_eq!(settings.lifetime, EngineLifetime::PerRequest);
        assert_eq!(settings.inference_timeout(), Some(Duration::from_secs(30)));
        settings.validate().unwrap();
    }

    #[test]
    fn policy_parses_from_cli_syntax() {
        assert_eq!("raw".parse::<IntensityPolicy>().unwrap(), IntensityPolicy::Raw);
        assert_eq!(
            "Scaled:127.5:127.5".parse::<IntensityPolicy>().unwrap(),
            IntensityPolicy::Scaled { mean: 127.5, scale: 127.5 }
        );
        assert!("scaled:1.0".parse::<IntensityPolicy>().is_err());
        assert!("scaled:1.0:0".parse::<IntensityPolicy>().is_err());
        assert!("standard".parse::<IntensityPolicy>().is_err());
    }

    #[test]
    fn scaled_policy_shifts_then_divides() {
        let policy = IntensityPolicy::Scaled { mean: 1.0, scale: 2.0 };
        assert_eq!(policy.apply(5.0), 2.0);
        assert_eq!(IntensityPolicy::Raw.apply(5.0), 5.0);
    }

    #[test]
    fn env_overrides_replace_fields() {
        let vars: HashMap<&str, &str> = [
            (ENV_MODEL, "/models/digits.onnx"),
            (ENV_POLICY, "scaled:0:255"),
            (ENV_TIMEOUT_MS, "0"),
            (ENV_WORKERS, "4"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.model.model_path, PathBuf::from("/models/digits.onnx"));
        assert_eq!(
            settings.normalizer.policy,
            Some(IntensityPolicy::Scaled { mean: 0.0, scale: 255.0 })
        );
        assert_eq!(settings.inference_timeout(), None);
        assert_eq!(settings.workers, 4);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = Settings::default();
        settings.normalizer.policy = Some(IntensityPolicy::Raw);
        settings.validate().unwrap();
        settings.workers = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.normalizer.policy = Some(IntensityPolicy::Scaled { mean: 0.0, scale: 0.0 });
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn policy_is_never_assumed() {
        let settings = Settings::default();
        assert_eq!(settings.normalizer.policy, None);
        let err = settings.validate().unwrap_err();
        assert!(matches!(&err, Error::Config(msg) if msg.contains("normalizer.policy")));

        let settings: Settings = serde_json::from_str(r#"{ "workers": 1 }"#).unwrap();
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn settings_load_from_file() {
        let path = std::env::temp_dir().join(format!("dc_settings_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "model": { "model_path": "digits.onnx" }, "lifetime": "shared", "workers": 3 }"#,
        )
        .unwrap();
        let mut settings = Settings::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(settings.lifetime, EngineLifetime::Shared);
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.model.input_node, "conv2d_1_input");
        assert!(settings.validate().is_err());
        settings.resolve_model(Path::new("/opt/models"));
        assert_eq!(settings.model.model_path, PathBuf::from("/opt/models/digits.onnx"));
    }
}
