//! Manifest document types.
//!
//! The manifest is the source of truth for which models can be served and
//! which backend implements each of them.  All types are read-only after a
//! load; [`ManifestStore`](crate::ManifestStore) swaps whole documents
//! atomically.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::ManifestError;

/// A backend implementation listed in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    /// `http(s)://` archive URL or a local directory path.
    pub download_url: String,
    /// Name of the loadable entry artifact (without platform prefix/suffix).
    pub entry_module: String,
    /// Capability function names the backend declares.
    pub functions: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Minimum host version able to run this backend.
    #[serde(default)]
    pub min_version: Option<String>,
}

/// A servable model listed in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub description: String,
    /// Backend id; must exist in [`ManifestData::backends`].
    pub backend: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Initialization arguments handed to every provider instance.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub is_default: bool,
    /// Lowercase OS names (`linux`, `darwin`, `windows`).  Absent means all.
    #[serde(default)]
    pub supported_os: Option<Vec<String>>,
    #[serde(default)]
    pub system_requirements: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A version-gated advisory shown to hosts whose version matches the predicate.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VersionMessage {
    /// `<X`, `>X`, `==X`, or a bare version treated as `==X`.
    pub version: String,
    /// `warning` or `note`.
    pub severity: String,
    pub message: String,
}

/// Release metadata for the station itself.
#[derive(Debug, Clone, Deserialize)]
pub struct StationInfo {
    #[serde(default)]
    pub latest_version: Option<String>,
}

/// Analytics endpoint configuration; consumed by outer layers.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    pub posthog_project_key: String,
    #[serde(default)]
    pub posthog_host: Option<String>,
}

/// The complete manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestData {
    pub version: String,
    #[serde(deserialize_with = "unique_map")]
    pub models: HashMap<String, ModelInfo>,
    #[serde(deserialize_with = "unique_map")]
    pub backends: HashMap<String, BackendInfo>,
    /// Optional `welcome` / `warning` / `note` messages.
    #[serde(default)]
    pub messages: HashMap<String, String>,
    #[serde(default)]
    pub moondream_station_info: Option<StationInfo>,
    #[serde(default)]
    pub version_messages: Option<Vec<VersionMessage>>,
    #[serde(default)]
    pub analytics: Option<AnalyticsConfig>,
}

impl ManifestData {
    /// Check referential integrity: every model's backend id must be listed.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (model_id, model) in &self.models {
            if !self.backends.contains_key(&model.backend) {
                return Err(ManifestError::invalid(format!(
                    "model '{model_id}' references unknown backend '{}'",
                    model.backend
                )));
            }
        }
        Ok(())
    }
}

fn default_version() -> String {
    "1.0.0".to_owned()
}

/// Deserialize a JSON object into a map, rejecting duplicate keys.
///
/// `serde_json` silently keeps the last entry when an id appears twice; a
/// duplicated model or backend id is a manifest authoring error and must not
/// be truncated away.
fn unique_map<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct UniqueMap<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueMap<V> {
        type Value = HashMap<String, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map with unique string keys")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = HashMap::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if map.insert(key.clone(), value).is_some() {
                    return Err(de::Error::custom(format!("duplicate id '{key}'")));
                }
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueMap(PhantomData))
}
