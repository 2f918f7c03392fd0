use thiserror::Error;

/// Errors produced while provisioning a backend on disk.
///
/// All of these surface at service-start time only; they never interrupt
/// requests already in flight.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The archive could not be fetched or copied.
    #[error("backend download failed: {0}")]
    DownloadFailed(String),

    /// The archive extracted but the entry artifact is missing or unreadable.
    #[error("backend corrupt: {0}")]
    Corrupt(String),

    /// A declared requirement could not be installed.
    #[error("dependency install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(e: reqwest::Error) -> Self {
        Self::DownloadFailed(e.to_string())
    }
}
