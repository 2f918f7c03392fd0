//! Shared-library capability providers.
//!
//! Backends distributed as native libraries export one C symbol per
//! capability:
//!
//! ```c
//! // JSON in, JSON out.  The returned buffer is released through the
//! // library's own `station_free`.
//! char *caption(const char *args_json);
//! void station_free(char *buffer);
//! // Optional; invoked once per provider instance with the model arguments
//! // plus a `_worker_id` field.  Non-zero return aborts the load.
//! int init_backend(const char *args_json);
//! ```
//!
//! `dlopen` of the same path shares module globals across instances, so
//! library backends must keep per-call state in their arguments and be
//! thread-safe at module scope; the `_worker_id` passed at init identifies
//! the owning worker for backends that shard internal state.

use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::{debug, warn};

use crate::provider::{Args, CallOutput, CapabilityProvider, ProviderError, ProviderFactory};

type CapabilityFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type InitFn = unsafe extern "C" fn(*const c_char) -> i32;

const INIT_SYMBOL: &[u8] = b"init_backend";
const FREE_SYMBOL: &[u8] = b"station_free";

/// A capability provider backed by a loaded shared library.
pub struct DylibProvider {
    library: Library,
    capabilities: Vec<String>,
}

impl DylibProvider {
    /// Open `path`, resolve the capability table (declared ∩ exported), and
    /// run `init_backend` when the library provides it.
    pub fn load(
        path: &Path,
        declared: &[String],
        worker_id: usize,
        args: &Args,
    ) -> Result<Self, ProviderError> {
        // SAFETY: the library was provisioned from the manifest the operator
        // selected; loading it is the whole point of a dynamic backend.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ProviderError::Load(format!("{}: {e}", path.display())))?;

        let capabilities: Vec<String> = declared
            .iter()
            .filter(|name| {
                // SAFETY: only probes for symbol presence with the uniform
                // capability signature; nothing is called here.
                let found = unsafe { library.get::<CapabilityFn>(name.as_bytes()).is_ok() };
                if !found {
                    warn!(capability = %name, path = %path.display(), "declared capability not exported");
                }
                found
            })
            .cloned()
            .collect();

        let provider = Self {
            library,
            capabilities,
        };
        provider.init(worker_id, args)?;
        debug!(path = %path.display(), worker_id, capabilities = provider.capabilities.len(), "library backend loaded");
        Ok(provider)
    }

    fn init(&self, worker_id: usize, args: &Args) -> Result<(), ProviderError> {
        // SAFETY: symbol presence probe with the documented init signature.
        let init: Symbol<'_, InitFn> = match unsafe { self.library.get(INIT_SYMBOL) } {
            Ok(symbol) => symbol,
            Err(_) => return Ok(()),
        };

        let mut init_args = args.clone();
        init_args.insert("_worker_id".to_owned(), worker_id.into());
        let payload = to_c_json(&serde_json::Value::Object(init_args))?;

        // SAFETY: `payload` is a valid NUL-terminated buffer that outlives the
        // call; the library promises the documented init ABI.
        let rc = unsafe { init(payload.as_ptr()) };
        if rc != 0 {
            return Err(ProviderError::Init(format!("init_backend returned {rc}")));
        }
        Ok(())
    }

    fn call(&self, function: &str, args_json: &serde_json::Value) -> Result<String, ProviderError> {
        // SAFETY: capability membership was established at load; the symbol
        // has the uniform capability signature.
        let func: Symbol<'_, CapabilityFn> = unsafe { self.library.get(function.as_bytes()) }
            .map_err(|_| ProviderError::Unsupported(function.to_owned()))?;

        let payload = to_c_json(args_json)?;
        // SAFETY: valid NUL-terminated input; the returned buffer (when
        // non-null) is owned by the library until `station_free`.
        let raw = unsafe { func(payload.as_ptr()) };
        if raw.is_null() {
            return Err(ProviderError::Invocation(format!(
                "capability '{function}' returned no result"
            )));
        }

        // SAFETY: non-null pointer produced by the library's capability call,
        // valid until freed below.
        let output = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();

        // SAFETY: `raw` came from the library's allocator and is released
        // exactly once, through the library's own free.
        if let Ok(free) = unsafe { self.library.get::<FreeFn>(FREE_SYMBOL) } {
            unsafe { free(raw) };
        }

        Ok(output)
    }
}

impl CapabilityProvider for DylibProvider {
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn invoke(&mut self, function: &str, args: &Args) -> Result<CallOutput, ProviderError> {
        let payload = serde_json::Value::Object(args.clone());
        let output = self.call(function, &payload)?;
        let value = serde_json::from_str(&output).map_err(|e| {
            ProviderError::Invocation(format!("capability '{function}' returned invalid JSON: {e}"))
        })?;
        Ok(CallOutput::Value(value))
    }
}

fn to_c_json(value: &serde_json::Value) -> Result<CString, ProviderError> {
    CString::new(value.to_string())
        .map_err(|_| ProviderError::Invocation("arguments contain a NUL byte".to_owned()))
}

/// Factory producing one [`DylibProvider`] per worker from a provisioned
/// entry artifact.
pub struct DylibProviderFactory {
    path: PathBuf,
    declared: Vec<String>,
}

impl DylibProviderFactory {
    pub fn new(path: impl Into<PathBuf>, declared: Vec<String>) -> Self {
        Self {
            path: path.into(),
            declared,
        }
    }
}

impl ProviderFactory for DylibProviderFactory {
    fn create(
        &self,
        worker_id: usize,
        args: &Args,
    ) -> Result<Box<dyn CapabilityProvider>, ProviderError> {
        let provider = DylibProvider::load(&self.path, &self.declared, worker_id, args)?;
        Ok(Box::new(provider))
    }
}
