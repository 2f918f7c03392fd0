//! Backend provisioning for Moondream Station.
//!
//! Makes a manifest-declared backend runnable on the host: downloads and
//! extracts its archive (or copies a local directory), verifies the entry
//! artifact, and installs any native requirements the backend declares.
//! Loading the provisioned artifact is the runtime crate's job.

mod error;
mod fetcher;
mod requirements;

use std::path::PathBuf;

use station_manifest::BackendInfo;

pub use error::ProvisionError;
pub use fetcher::BackendFetcher;
pub use requirements::{requirement_name, resolve_library_name, RequirementsInstaller};

/// One-stop provisioning façade: fetch + verify + requirements.
pub struct Provisioner {
    fetcher: BackendFetcher,
    installer: RequirementsInstaller,
}

impl Provisioner {
    pub fn new(backends_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher: BackendFetcher::new(backends_dir),
            installer: RequirementsInstaller::probe_only(),
        }
    }

    /// Configure the host command used to install missing requirements.
    pub fn with_installer_command(mut self, command: Vec<String>) -> Self {
        self.installer = RequirementsInstaller::with_command(command);
        self
    }

    /// Provision `backend_id` completely and return the entry artifact path.
    pub async fn ensure(
        &self,
        backend_id: &str,
        info: &BackendInfo,
    ) -> Result<PathBuf, ProvisionError> {
        let entry = self.fetcher.ensure(backend_id, info).await?;
        self.installer
            .ensure(&self.fetcher.backend_dir(backend_id))
            .await?;
        Ok(entry)
    }

    pub fn backend_dir(&self, backend_id: &str) -> PathBuf {
        self.fetcher.backend_dir(backend_id)
    }
}
