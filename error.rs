use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Unsupported Format: {0}")]
    UnsupportedFormat(String),

    #[error("Resize Error: {0}")]
    Resize(String),

    #[error("Engine Load Failed: {0}")]
    EngineLoad(String),

    #[error("Inference Error: {0}")]
    Inference(String),

    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(inner) => Error::UnsupportedFormat(inner.to_string()),
            other => Error::Decode(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidImage,
    Internal,
    Unavailable,
    Config,
}

impl ErrorKind {
    pub fn is_client_error(self) -> bool {
        matches!(self, Self::InvalidImage)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) | Self::UnsupportedFormat(_) => ErrorKind::InvalidImage,
            Self::Resize(_) => ErrorKind::Internal,
            Self::EngineLoad(_) | Self::Inference(_) | Self::InferenceTimeout(_) => {
                ErrorKind::Unavailable
            }
            Self::Config(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_errors_are_client_errors() {
        let err: Error = image::load_from_memory_with_format(b"not a jpeg", image::ImageFormat::Jpeg)
            .unwrap_err()
            .into();
        assert!(err.kind().is_client_error(), "unexpected kind for {err}");
    }

    #[test]
    fn engine_failures_are_unavailable() {
        let load = Error::EngineLoad("missing model".into());
        let timeout = Error::InferenceTimeout(Duration::from_millis(5));
        assert_eq!(load.kind(), ErrorKind::Unavailable);
        assert_eq!(timeout.kind(), ErrorKind::Unavailable);
        assert!(!timeout.kind().is_client_error());
        assert_eq!(Error::Resize("zero".into()).kind(), ErrorKind::Internal);
    }
}
