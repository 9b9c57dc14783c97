//! Update pipeline errors
//!
//! Each pipeline step wraps its module error into one [`UpdateError`]
//! variant. Whether a variant ends the pipeline is decided by the step, the
//! taxonomy only classifies.

use super::content::ContentError;
use super::updater::{DownloadError, ExtractError, InfoError, StateError, VerifyError};
use serde::Serialize;
use thiserror::Error;

/// Code reported by the `Failed` terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    InfoUnavailable,
    Download,
    Integrity,
    Extract,
    ManifestReload,
    Fatal,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InfoUnavailable => "info_unavailable",
            Self::Download => "download",
            Self::Integrity => "integrity",
            Self::Extract => "extract",
            Self::ManifestReload => "manifest_reload",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Update info unavailable: {0}")]
    InfoFetch(#[from] InfoError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] VerifyError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Manifest reload failed: {0}")]
    ManifestReload(#[from] ContentError),

    #[error("Module {0} not found")]
    ModuleLoad(String),

    #[error("{0}")]
    Fatal(String),
}

impl UpdateError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn code(&self) -> FailureCode {
        match self {
            Self::InfoFetch(_) => FailureCode::InfoUnavailable,
            Self::Download(_) => FailureCode::Download,
            Self::Integrity(_) => FailureCode::Integrity,
            Self::Extract(_) => FailureCode::Extract,
            Self::ManifestReload(_) => FailureCode::ManifestReload,
            Self::ModuleLoad(_) | Self::Fatal(_) => FailureCode::Fatal,
        }
    }
}

impl From<StateError> for UpdateError {
    fn from(e: StateError) -> Self {
        Self::Fatal(format!("local state: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(UpdateError::from(DownloadError::Cancelled).code(), FailureCode::Download);
        assert_eq!(UpdateError::from(ExtractError::WorkerLost).code(), FailureCode::Extract);
        assert_eq!(UpdateError::fatal("aborted").code(), FailureCode::Fatal);
        assert_eq!(
            UpdateError::from(StateError::InvalidVersion("x".into())).code(),
            FailureCode::Fatal
        );
    }

    #[test]
    fn test_code_display() {
        assert_eq!(FailureCode::ManifestReload.to_string(), "manifest_reload");
    }
}
