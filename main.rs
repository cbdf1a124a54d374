use digit_classifier::config::{EngineLifetime, Settings};
use digit_classifier::error::{Error, Result};
use digit_classifier::jobs::{collect_inputs, run_batch};
use digit_classifier::onnx::{ort_runtime_version, OnnxLoader};
use digit_classifier::Classifier;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: digit-classifier [--config FILE] [--model FILE] \
[--policy raw|scaled:MEAN:SCALE] [--lifetime per_request|shared] [--workers N] PATH...";

struct Args {
    config: Option<PathBuf>,
    model: Option<PathBuf>,
    policy: Option<String>,
    lifetime: Option<EngineLifetime>,
    workers: Option<usize>,
    inputs: Vec<PathBuf>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args> {
    let mut args = Args {
        config: None,
        model: None,
        policy: None,
        lifetime: None,
        workers: None,
        inputs: Vec::new(),
    };
    while let Some(arg) = raw.next() {
        let mut value = |flag: &str| {
            raw.next()
                .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
        };
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--model" => args.model = Some(PathBuf::from(value("--model")?)),
            "--policy" => args.policy = Some(value("--policy")?),
            "--lifetime" => {
                args.lifetime = Some(match value("--lifetime")?.as_str() {
                    "per_request" => EngineLifetime::PerRequest,
                    "shared" => EngineLifetime::Shared,
                    other => return Err(Error::Config(format!("unknown lifetime '{other}'"))),
                })
            }
            "--workers" => {
                let n = value("--workers")?;
                args.workers = Some(
                    n.parse()
                        .map_err(|e| Error::Config(format!("invalid --workers '{n}': {e}")))?,
                );
            }
            "-h" | "--help" => return Err(Error::Config(USAGE.to_string())),
            flag if flag.starts_with("--") => {
                return Err(Error::Config(format!("unknown option {flag}\n{USAGE}")))
            }
            _ => args.inputs.push(PathBuf::from(arg)),
        }
    }
    if args.inputs.is_empty() {
        return Err(Error::Config(USAGE.to_string()));
    }
    Ok(args)
}

fn resolve_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = Settings::load(path)?;
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            settings.resolve_model(base);
            settings
        }
        None => Settings::default(),
    };
    settings.apply_env()?;
    if let Some(model) = &args.model {
        settings.model.model_path = model.clone();
    }
    if let Some(policy) = &args.policy {
        settings.normalizer.policy = Some(policy.parse()?);
    }
    if let Some(lifetime) = args.lifetime {
        settings.lifetime = lifetime;
    }
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    settings.validate()?;
    Ok(settings)
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let settings = match resolve_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    let classifier = match Classifier::new(&settings, OnnxLoader::new(settings.runtime)) {
        Ok(classifier) => Arc::new(classifier),
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    log::info!(
        "Model {} with {:?} policy, {:?} sessions, ONNX Runtime {}",
        settings.model.model_path.display(),
        classifier.normalizer().policy(),
        settings.lifetime,
        ort_runtime_version().unwrap_or_else(|| "(unresolved)".into())
    );
    let inputs = collect_inputs(&args.inputs);
    let report = run_batch(classifier, inputs, settings.workers);
    for outcome in &report.outcomes {
        match serde_json::to_string(outcome) {
            Ok(line) => println!("{line}"),
            Err(err) => log::warn!("Failed to encode result for {}: {err}", outcome.file),
        }
    }
    if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
