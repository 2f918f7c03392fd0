//! Manifest loading, caching, and read access.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use semver::Version;
use tracing::{debug, info, warn};

use crate::error::ManifestError;
use crate::types::{BackendInfo, ManifestData, ModelInfo, VersionMessage};

const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_FILE: &str = "manifest_cache.json";

/// Fetches, validates, and caches the manifest document.
///
/// HTTP loads write the raw document to `cache/manifests/` under the models
/// directory and fall back to that cache when the network is unavailable.
/// Local-path loads never touch the cache.  Readers always observe a
/// complete document; a reload replaces the previous one atomically.
pub struct ManifestStore {
    models_dir: PathBuf,
    client: reqwest::Client,
    manifest: RwLock<Option<Arc<ManifestData>>>,
}

impl ManifestStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("moondream-station/", env!("CARGO_PKG_VERSION")))
            .timeout(NETWORK_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            models_dir: models_dir.into(),
            client,
            manifest: RwLock::new(None),
        }
    }

    fn cache_file(&self) -> PathBuf {
        self.models_dir.join("cache").join("manifests").join(CACHE_FILE)
    }

    /// Load the manifest from an `http(s)://` URL or a local file path and
    /// swap it in.
    pub async fn load(&self, source: &str) -> Result<Arc<ManifestData>, ManifestError> {
        let bytes = if source.starts_with("http://") || source.starts_with("https://") {
            self.fetch_with_cache_fallback(source).await?
        } else {
            std::fs::read(source)?
        };

        let manifest = parse(&bytes)?;
        let manifest = Arc::new(manifest);
        *self.manifest.write().expect("manifest lock poisoned") = Some(Arc::clone(&manifest));
        info!(source, version = %manifest.version, models = manifest.models.len(), "manifest loaded");
        Ok(manifest)
    }

    async fn fetch_with_cache_fallback(&self, url: &str) -> Result<Vec<u8>, ManifestError> {
        match self.fetch_once(url).await {
            Ok(bytes) => {
                self.save_cache(&bytes);
                Ok(bytes)
            }
            Err(fetch_err) => {
                warn!(url, error = %fetch_err, "manifest fetch failed; trying cache");
                match std::fs::read(self.cache_file()) {
                    Ok(bytes) => {
                        info!(cache = %self.cache_file().display(), "using cached manifest");
                        Ok(bytes)
                    }
                    Err(cache_err) => Err(ManifestError::unavailable(format!(
                        "fetch failed ({fetch_err}) and no usable cache ({cache_err})"
                    ))),
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    /// Best-effort cache write; a failed write only degrades offline starts.
    fn save_cache(&self, bytes: &[u8]) {
        let path = self.cache_file();
        let result = path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| std::fs::write(&path, bytes));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write manifest cache");
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn manifest(&self) -> Option<Arc<ManifestData>> {
        self.manifest.read().expect("manifest lock poisoned").clone()
    }

    pub fn models(&self) -> HashMap<String, ModelInfo> {
        self.manifest().map(|m| m.models.clone()).unwrap_or_default()
    }

    pub fn backends(&self) -> HashMap<String, BackendInfo> {
        self.manifest().map(|m| m.backends.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> HashMap<String, String> {
        self.manifest().map(|m| m.messages.clone()).unwrap_or_default()
    }

    /// Latest published station version, when the manifest advertises one.
    pub fn latest_station_version(&self) -> Option<String> {
        self.manifest()?
            .moondream_station_info
            .as_ref()?
            .latest_version
            .clone()
    }

    /// First model flagged `is_default`, regardless of OS support.
    pub fn default_model(&self) -> Option<String> {
        let manifest = self.manifest()?;
        manifest
            .models
            .iter()
            .find(|(_, m)| m.is_default)
            .map(|(id, _)| id.clone())
    }

    /// First default model whose `supported_os` (when present) contains the
    /// running OS.
    pub fn available_default_model(&self) -> Option<String> {
        self.available_default_model_for(current_os())
    }

    fn available_default_model_for(&self, os: &str) -> Option<String> {
        let manifest = self.manifest()?;
        manifest
            .models
            .iter()
            .find(|(_, m)| {
                m.is_default
                    && m.supported_os
                        .as_ref()
                        .map(|list| list.iter().any(|s| s == os))
                        .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
    }

    /// Advisories whose version predicate matches `current_version`.
    pub fn version_messages(&self, current_version: &str) -> Vec<VersionMessage> {
        let Some(manifest) = self.manifest() else {
            return Vec::new();
        };
        let Some(messages) = &manifest.version_messages else {
            return Vec::new();
        };
        let current = match Version::parse(current_version) {
            Ok(v) => v,
            Err(e) => {
                warn!(current_version, error = %e, "unparseable host version");
                return Vec::new();
            }
        };

        messages
            .iter()
            .filter(|msg| match predicate_matches(&msg.version, &current) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(predicate = %msg.version, error = %e, "skipping unparseable version predicate");
                    false
                }
            })
            .cloned()
            .collect()
    }
}

/// Evaluate a `<X` / `>X` / `==X` / bare-`X` predicate against `current`.
fn predicate_matches(predicate: &str, current: &Version) -> Result<bool, semver::Error> {
    let (target, op): (&str, fn(&Version, &Version) -> bool) =
        if let Some(rest) = predicate.strip_prefix("==") {
            (rest, |c, t| c == t)
        } else if let Some(rest) = predicate.strip_prefix('<') {
            (rest, |c, t| c < t)
        } else if let Some(rest) = predicate.strip_prefix('>') {
            (rest, |c, t| c > t)
        } else {
            (predicate, |c, t| c == t)
        };
    let target = Version::parse(target.trim())?;
    Ok(op(current, &target))
}

fn parse(bytes: &[u8]) -> Result<ManifestData, ManifestError> {
    let manifest: ManifestData =
        serde_json::from_slice(bytes).map_err(|e| ManifestError::invalid(e.to_string()))?;
    manifest.validate()?;
    debug!(version = %manifest.version, "manifest parsed");
    Ok(manifest)
}

/// Running OS in the manifest's vocabulary (`linux`, `darwin`, `windows`).
fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}
