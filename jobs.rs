use crate::classify::Classifier;
use crate::engine::EngineLoader;
use crate::error::{Error, ErrorKind, Result};
use crate::models::ClassificationResult;
use crate::normalize::InputFormat;
use crossbeam_channel::bounded;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;
use walkdir::WalkDir;

const SUPPORTED_EXT: &[&str] = &["jpg", "jpeg"];

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXT.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| is_supported(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            if found.is_empty() {
                log::warn!("No JPEG files found under {}", path.display());
            }
            inputs.extend(found);
        } else {
            inputs.push(path.clone());
        }
    }
    inputs
}

/// The extension declares the format and must match the classifier's.
pub fn classify_file<L: EngineLoader>(
    classifier: &Classifier<L>,
    path: &Path,
) -> Result<ClassificationResult> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let declared = InputFormat::from_extension(ext).ok_or_else(|| {
        Error::UnsupportedFormat(format!("{}: unknown extension '{ext}'", path.display()))
    })?;
    let expected = classifier.normalizer().format();
    if declared != expected {
        return Err(Error::UnsupportedFormat(format!(
            "{} is {declared:?} but the classifier expects {expected:?}",
            path.display()
        )));
    }
    let bytes = fs::read(path)?;
    classifier.classify_bytes(&bytes)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl FileOutcome {
    fn new(path: &Path, result: Result<ClassificationResult>) -> Self {
        let file = path.to_string_lossy().to_string();
        match result {
            Ok(res) => Self {
                file,
                label: Some(res.label),
                probability: Some(res.probability),
                error: None,
                kind: None,
            },
            Err(err) => Self {
                file,
                label: None,
                probability: None,
                kind: Some(err.kind()),
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<FileOutcome>,
}

pub fn run_batch<L: EngineLoader>(
    classifier: Arc<Classifier<L>>,
    inputs: Vec<PathBuf>,
    workers: usize,
) -> BatchReport {
    let job_id = Uuid::new_v4().to_string();
    let total = inputs.len();
    let workers = workers.clamp(1, total.max(1));
    log::info!("Batch {job_id}: {total} file(s) on {workers} worker(s)");

    let (work_tx, work_rx) = bounded::<(usize, PathBuf)>(workers * 2);
    let (done_tx, done_rx) = bounded::<(usize, FileOutcome)>(total.max(1));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let rx = work_rx.clone();
        let tx = done_tx.clone();
        let classifier = classifier.clone();
        handles.push(thread::spawn(move || {
            for (idx, path) in rx.iter() {
                let result = classify_file(&classifier, &path);
                if let Err(err) = &result {
                    log::warn!("Classification failed for {}: {}", path.display(), err);
                }
                if tx.send((idx, FileOutcome::new(&path, result))).is_err() {
                    break;
                }
            }
        }));
    }
    drop(work_rx);
    drop(done_tx);

    for item in inputs.iter().cloned().enumerate() {
        if work_tx.send(item).is_err() {
            break;
        }
    }
    drop(work_tx);

    for handle in handles {
        if handle.join().is_err() {
            log::warn!("Batch {job_id}: worker thread panicked");
        }
    }

    let outcomes = in_input_order(&inputs, done_rx.try_iter().collect());
    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    let failed = outcomes.len() - succeeded;
    log::info!("Batch {job_id}: {succeeded} classified, {failed} failed");
    BatchReport {
        job_id,
        succeeded,
        failed,
        outcomes,
    }
}

// Inputs with no outcome lost their worker mid-file.
fn in_input_order(inputs: &[PathBuf], mut indexed: Vec<(usize, FileOutcome)>) -> Vec<FileOutcome> {
    indexed.sort_by_key(|(idx, _)| *idx);
    let mut reported = indexed.into_iter().peekable();
    let mut outcomes = Vec::with_capacity(inputs.len());
    for (idx, path) in inputs.iter().enumerate() {
        match reported.next_if(|(i, _)| *i == idx) {
            Some((_, outcome)) => outcomes.push(outcome),
            None => {
                log::warn!("No result recorded for {}", path.display());
                outcomes.push(FileOutcome::new(
                    path,
                    Err(Error::Inference("worker exited before reporting a result".into())),
                ));
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntensityPolicy, Settings};
    use crate::engine::stub::StubLoader;
    use crate::normalize::fixtures::solid_gray_jpeg;

    fn raw_settings() -> Settings {
        let mut settings = Settings::default();
        settings.normalizer.policy = Some(IntensityPolicy::Raw);
        settings
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dc_jobs_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("nested")).unwrap();
        dir
    }

    #[test]
    fn directories_expand_to_sorted_jpegs() {
        let dir = scratch_dir("collect");
        fs::write(dir.join("b.jpg"), solid_gray_jpeg(8, 8, 0)).unwrap();
        fs::write(dir.join("a.JPEG"), solid_gray_jpeg(8, 8, 0)).unwrap();
        fs::write(dir.join("nested").join("c.jpg"), solid_gray_jpeg(8, 8, 0)).unwrap();
        fs::write(dir.join("notes.txt"), "not an image").unwrap();
        let explicit = dir.join("notes.txt");

        let inputs = collect_inputs(&[dir.clone(), explicit.clone()]);
        let _ = fs::remove_dir_all(&dir);
        assert_eq!(
            inputs,
            vec![
                dir.join("a.JPEG"),
                dir.join("b.jpg"),
                dir.join("nested").join("c.jpg"),
                explicit,
            ]
        );
    }

    #[test]
    fn batch_reports_each_file_in_order() {
        let dir = scratch_dir("batch");
        let good_a = dir.join("a.jpg");
        let corrupt = dir.join("b.jpg");
        let good_c = dir.join("c.jpeg");
        let wrong_ext = dir.join("d.png");
        fs::write(&good_a, solid_gray_jpeg(28, 28, 0)).unwrap();
        fs::write(&corrupt, b"definitely not jpeg").unwrap();
        fs::write(&good_c, solid_gray_jpeg(10, 50, 255)).unwrap();
        fs::write(&wrong_ext, solid_gray_jpeg(28, 28, 0)).unwrap();

        let loader = StubLoader::peaked(3, 0.88);
        let counters = loader.counters.clone();
        let classifier = Arc::new(Classifier::new(&raw_settings(), loader).unwrap());
        let report = run_batch(
            classifier,
            vec![good_a, corrupt, good_c, wrong_ext, dir.join("missing.jpg")],
            3,
        );
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 3);
        let labels: Vec<Option<&str>> =
            report.outcomes.iter().map(|o| o.label.as_deref()).collect();
        assert_eq!(labels, vec![Some("3"), None, Some("3"), None, None]);
        assert_eq!(report.outcomes[1].kind, Some(ErrorKind::InvalidImage));
        assert_eq!(report.outcomes[3].kind, Some(ErrorKind::InvalidImage));
        assert_eq!(report.outcomes[4].kind, Some(ErrorKind::Config));
        assert_eq!(counters.loads(), 2);
        assert_eq!(counters.releases(), 2);
    }

    #[test]
    fn empty_batch_is_empty_report() {
        let classifier = Arc::new(
            Classifier::new(&raw_settings(), StubLoader::peaked(0, 0.5)).unwrap(),
        );
        let report = run_batch(classifier, Vec::new(), 4);
        assert_eq!(report.succeeded + report.failed, 0);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn inputs_without_outcome_count_as_failures() {
        let inputs = vec![
            PathBuf::from("a.jpg"),
            PathBuf::from("b.jpg"),
            PathBuf::from("c.jpg"),
        ];
        let c = FileOutcome::new(
            &inputs[2],
            Ok(ClassificationResult {
                label: "1".into(),
                probability: 0.9,
            }),
        );
        let a = FileOutcome::new(&inputs[0], Err(Error::Decode("bad".into())));
        let outcomes = in_input_order(&inputs, vec![(2, c.clone()), (0, a.clone())]);

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], a);
        assert_eq!(outcomes[2], c);
        assert_eq!(outcomes[1].file, "b.jpg");
        assert!(!outcomes[1].is_ok());
        assert_eq!(outcomes[1].kind, Some(ErrorKind::Unavailable));
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let ok = FileOutcome::new(
            Path::new("seven.jpg"),
            Ok(ClassificationResult {
                label: "7".into(),
                probability: 0.5,
            }),
        );
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"file":"seven.jpg","label":"7","probability":0.5}"#);

        let failed = FileOutcome::new(Path::new("x.jpg"), Err(Error::Decode("bad".into())));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["kind"], "invalid_image");
        assert!(json.get("label").is_none());
    }
}
