//! Persistent configuration store.
//!
//! A flat key→value JSON document at `~/.moondream-station/config.json`.
//! Every `set` writes through to disk; readers get typed accessors with the
//! documented defaults.  Environment overrides for containerized
//! deployments are applied once at startup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::warn;

pub const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVICE_PORT: u16 = 2020;
pub const DEFAULT_INFERENCE_WORKERS: usize = 1;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10;
pub const DEFAULT_INFERENCE_TIMEOUT: f64 = 30.0;
pub const DEFAULT_SHUTDOWN_CHECK_INTERVAL: f64 = 30.0;
pub const DEFAULT_SHUTDOWN_TIMEOUT: f64 = 30.0;

const CONFIG_FILE: &str = "config.json";

/// Key→value configuration persisted as JSON.
///
/// The gateway only reads; the one writer is the admin surface, so a coarse
/// lock is enough.
pub struct ConfigStore {
    config_dir: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl ConfigStore {
    /// Load from `config_dir/config.json`, falling back to defaults when the
    /// file is absent or unreadable.
    pub fn load(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let path = config_dir.join(CONFIG_FILE);
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config unreadable; using defaults");
                    Self::defaults(&config_dir)
                }
            },
            Err(_) => Self::defaults(&config_dir),
        };

        Self {
            config_dir,
            values: Mutex::new(values),
        }
    }

    fn defaults(config_dir: &Path) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("current_model".into(), Value::Null);
        map.insert("service_host".into(), json!(DEFAULT_SERVICE_HOST));
        map.insert("service_port".into(), json!(DEFAULT_SERVICE_PORT));
        map.insert(
            "models_dir".into(),
            json!(config_dir.join("models").to_string_lossy()),
        );
        map.insert("inference_workers".into(), json!(DEFAULT_INFERENCE_WORKERS));
        map.insert(
            "inference_max_queue_size".into(),
            json!(DEFAULT_MAX_QUEUE_SIZE),
        );
        map.insert(
            "inference_timeout".into(),
            json!(DEFAULT_INFERENCE_TIMEOUT),
        );
        map.insert("logging".into(), json!(true));
        map.insert("shutdown_monitor_enabled".into(), json!(true));
        map.insert(
            "shutdown_check_interval".into(),
            json!(DEFAULT_SHUTDOWN_CHECK_INTERVAL),
        );
        map.insert("shutdown_timeout".into(), json!(DEFAULT_SHUTDOWN_TIMEOUT));
        map
    }

    fn save(&self, values: &Map<String, Value>) {
        let path = self.config_dir.join(CONFIG_FILE);
        let result = std::fs::create_dir_all(&self.config_dir).and_then(|_| {
            std::fs::write(
                &path,
                serde_json::to_string_pretty(values).unwrap_or_default(),
            )
        });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist config");
        }
    }

    // ── Generic access ───────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().expect("config lock poisoned").get(key).cloned()
    }

    /// Set a key and write the store through to disk.
    pub fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock().expect("config lock poisoned");
        values.insert(key.to_owned(), value);
        self.save(&values);
    }

    /// Admin-surface operation; the gateway itself never deletes keys.
    #[allow(dead_code)]
    pub fn delete(&self, key: &str) -> bool {
        let mut values = self.values.lock().expect("config lock poisoned");
        let removed = values.remove(key).is_some();
        if removed {
            self.save(&values);
        }
        removed
    }

    /// Admin-surface operation; restores the documented defaults.
    #[allow(dead_code)]
    pub fn reset(&self) {
        let mut values = self.values.lock().expect("config lock poisoned");
        *values = Self::defaults(&self.config_dir);
        self.save(&values);
    }

    // ── Typed accessors ──────────────────────────────────────────────────────

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| default.to_owned())
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn service_host(&self) -> String {
        self.get_str("service_host", DEFAULT_SERVICE_HOST)
    }

    pub fn service_port(&self) -> u16 {
        self.get("service_port")
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_SERVICE_PORT)
    }

    pub fn current_model(&self) -> Option<String> {
        self.get("current_model")
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.get("models_dir")
            .and_then(|v| v.as_str().map(PathBuf::from))
            .unwrap_or_else(|| self.config_dir.join("models"))
    }

    pub fn inference_workers(&self) -> usize {
        self.get_usize("inference_workers", DEFAULT_INFERENCE_WORKERS).max(1)
    }

    pub fn inference_max_queue_size(&self) -> usize {
        self.get_usize("inference_max_queue_size", DEFAULT_MAX_QUEUE_SIZE)
    }

    pub fn inference_timeout(&self) -> f64 {
        self.get_f64("inference_timeout", DEFAULT_INFERENCE_TIMEOUT)
    }

    pub fn logging_enabled(&self) -> bool {
        self.get_bool("logging", true)
    }

    pub fn shutdown_monitor_enabled(&self) -> bool {
        self.get_bool("shutdown_monitor_enabled", true)
    }

    pub fn shutdown_check_interval(&self) -> f64 {
        self.get_f64("shutdown_check_interval", DEFAULT_SHUTDOWN_CHECK_INTERVAL)
    }

    pub fn shutdown_timeout(&self) -> f64 {
        self.get_f64("shutdown_timeout", DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Shared API key; `None` or empty disables auth.
    pub fn detection_api_key(&self) -> Option<String> {
        self.get("detection_api_key")
            .and_then(|v| v.as_str().map(str::to_owned))
            .filter(|key| !key.is_empty())
    }

    /// Apply container-deployment environment overrides.
    pub fn apply_env_overrides(&self) {
        if let Ok(enabled) = std::env::var("SHUTDOWN_MONITOR_ENABLED") {
            self.set(
                "shutdown_monitor_enabled",
                json!(enabled.eq_ignore_ascii_case("true")),
            );
        }
        for (env, key) in [
            ("SHUTDOWN_CHECK_INTERVAL", "shutdown_check_interval"),
            ("SHUTDOWN_TIMEOUT", "shutdown_timeout"),
        ] {
            if let Ok(raw) = std::env::var(env) {
                match raw.parse::<f64>() {
                    Ok(value) => self.set(key, json!(value)),
                    Err(_) => warn!(%env, value = %raw, "invalid override; keeping configured value"),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn tempdir(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "station_config_{tag}_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn defaults_match_documented_values() {
        let dir = tempdir("defaults");
        let config = ConfigStore::load(&dir);
        assert_eq!(config.service_host(), "127.0.0.1");
        assert_eq!(config.service_port(), 2020);
        assert_eq!(config.inference_workers(), 1);
        assert_eq!(config.inference_max_queue_size(), 10);
        assert_eq!(config.inference_timeout(), 30.0);
        assert!(config.detection_api_key().is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn set_persists_across_reload() {
        let dir = tempdir("persist");
        {
            let config = ConfigStore::load(&dir);
            config.set("current_model", json!("m0"));
            config.set("inference_workers", json!(4));
        }
        let reloaded = ConfigStore::load(&dir);
        assert_eq!(reloaded.current_model().as_deref(), Some("m0"));
        assert_eq!(reloaded.inference_workers(), 4);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn delete_and_reset() {
        let dir = tempdir("delete");
        let config = ConfigStore::load(&dir);
        config.set("detection_api_key", json!("secret"));
        assert_eq!(config.detection_api_key().as_deref(), Some("secret"));
        assert!(config.delete("detection_api_key"));
        assert!(!config.delete("detection_api_key"));
        assert!(config.detection_api_key().is_none());

        config.set("service_port", json!(9999));
        config.reset();
        assert_eq!(config.service_port(), 2020);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn empty_api_key_disables_auth() {
        let dir = tempdir("emptykey");
        let config = ConfigStore::load(&dir);
        config.set("detection_api_key", json!(""));
        assert!(config.detection_api_key().is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn zero_workers_is_clamped() {
        let dir = tempdir("clamp");
        let config = ConfigStore::load(&dir);
        config.set("inference_workers", json!(0));
        assert_eq!(config.inference_workers(), 1);
        fs::remove_dir_all(dir).ok();
    }
}
