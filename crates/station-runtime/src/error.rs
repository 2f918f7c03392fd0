use thiserror::Error;

use station_provision::ProvisionError;

use crate::provider::ProviderError;

/// Errors surfaced by [`InferenceService::start`](crate::InferenceService::start).
///
/// Everything after a successful start is reported through result envelopes,
/// never through this type.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model '{model}' references unknown backend '{backend}'")]
    UnknownBackend { model: String, backend: String },

    #[error("service already running; stop it first")]
    AlreadyRunning,

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
