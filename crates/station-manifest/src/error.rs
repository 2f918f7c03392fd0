use thiserror::Error;

/// Errors produced while loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Neither a fresh fetch nor the disk cache yielded a manifest.
    #[error("manifest unavailable: {reason}")]
    Unavailable { reason: String },

    /// The document parsed but violates the manifest shape or its
    /// referential-integrity rules.
    #[error("manifest invalid: {reason}")]
    Invalid { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}
