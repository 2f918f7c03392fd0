//! Native-dependency provisioning for backends.
//!
//! A backend may bundle a `requirements.txt` listing the shared libraries it
//! expects on the host.  Each line may carry a version constraint, an
//! environment marker, or a trailing comment; only the library name matters
//! for the loadability probe.  Missing entries are handed to the operator's
//! configured installer command in one batch.

use std::path::Path;

use tracing::{debug, info};

use crate::error::ProvisionError;

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Version-constraint operators recognized in requirement lines.
/// Two-character operators must be tested first.
const OPERATORS: &[&str] = &["==", ">=", "<=", "~=", "!=", ">", "<"];

/// Package names whose loadable library carries a different stem.
const LIBRARY_ALIASES: &[(&str, &str)] = &[
    ("opencv", "opencv_core"),
    ("openssl", "ssl"),
    ("zlib", "z"),
    ("libjpeg-turbo", "jpeg"),
];

/// Installs missing backend requirements through a host-level command.
///
/// The command receives the missing requirement lines verbatim as trailing
/// arguments, so version constraints written in the file reach the package
/// manager intact.
pub struct RequirementsInstaller {
    installer: Option<Vec<String>>,
}

impl RequirementsInstaller {
    /// An installer that can only verify, never install.
    pub fn probe_only() -> Self {
        Self { installer: None }
    }

    /// Use `command` (program + leading arguments) to install missing entries.
    pub fn with_command(command: Vec<String>) -> Self {
        Self {
            installer: Some(command),
        }
    }

    /// Ensure every requirement declared by the backend at `backend_dir` is
    /// loadable, installing the missing ones.  Idempotent on success; a
    /// non-zero installer exit is fatal.
    pub async fn ensure(&self, backend_dir: &Path) -> Result<(), ProvisionError> {
        let requirements = backend_dir.join(REQUIREMENTS_FILE);
        if !requirements.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&requirements)?;
        let mut missing: Vec<&str> = Vec::new();
        for line in content.lines() {
            let Some(name) = requirement_name(line) else {
                continue;
            };
            let library = resolve_library_name(&name);
            if is_loadable(library) {
                debug!(requirement = %name, library, "already present");
            } else {
                missing.push(line.trim());
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        let Some(installer) = self.installer.as_deref().filter(|cmd| !cmd.is_empty()) else {
            return Err(ProvisionError::DependencyInstallFailed(format!(
                "no installer configured; missing: {}",
                missing.join(", ")
            )));
        };

        info!(count = missing.len(), "installing missing requirements");
        let output = tokio::process::Command::new(&installer[0])
            .args(&installer[1..])
            .args(&missing)
            .output()
            .await
            .map_err(|e| {
                ProvisionError::DependencyInstallFailed(format!(
                    "failed to run installer '{}': {e}",
                    installer[0]
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::DependencyInstallFailed(format!(
                "installer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Extract the bare dependency name from one requirement line.
///
/// Strips trailing comments and environment markers, then splits on the first
/// version operator.  Returns `None` for blank and comment-only lines.
pub fn requirement_name(line: &str) -> Option<String> {
    let line = line.split('#').next().unwrap_or("");
    let spec = line.split(';').next().unwrap_or("").trim();
    if spec.is_empty() {
        return None;
    }

    for op in OPERATORS {
        if let Some((name, _)) = spec.split_once(op) {
            return Some(name.trim().to_owned());
        }
    }
    Some(spec.to_owned())
}

/// Map a dependency name to the library stem that is actually loadable.
pub fn resolve_library_name(name: &str) -> &str {
    let lowered = name.to_ascii_lowercase();
    LIBRARY_ALIASES
        .iter()
        .find(|(pkg, _)| *pkg == lowered)
        .map(|(_, lib)| *lib)
        .unwrap_or(name)
}

/// Probe whether the named library can be opened on this host.
fn is_loadable(name: &str) -> bool {
    let file = libloading::library_filename(name);
    // SAFETY: opening a library runs its initializers.  The names probed here
    // come from a backend the operator chose to install, which will be opened
    // for real at service start anyway.
    match unsafe { libloading::Library::new(&file) } {
        Ok(_) => true,
        Err(e) => {
            debug!(library = %file.to_string_lossy(), error = %e, "probe failed");
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn requirement_name_handles_operators() {
        assert_eq!(requirement_name("foo==1.2.3"), Some("foo".to_owned()));
        assert_eq!(requirement_name("foo >= 1.0"), Some("foo".to_owned()));
        assert_eq!(requirement_name("foo~=2.1"), Some("foo".to_owned()));
        assert_eq!(requirement_name("foo!=0.9"), Some("foo".to_owned()));
        assert_eq!(requirement_name("foo<2"), Some("foo".to_owned()));
        assert_eq!(requirement_name("foo"), Some("foo".to_owned()));
    }

    #[test]
    fn requirement_name_strips_comments_and_markers() {
        assert_eq!(requirement_name("# just a comment"), None);
        assert_eq!(requirement_name(""), None);
        assert_eq!(requirement_name("   "), None);
        assert_eq!(
            requirement_name("foo==1.0  # pinned for abi"),
            Some("foo".to_owned())
        );
        assert_eq!(
            requirement_name("foo>=1.0; os_name == 'posix'"),
            Some("foo".to_owned())
        );
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        assert_eq!(resolve_library_name("OpenCV"), "opencv_core");
        assert_eq!(resolve_library_name("zlib"), "z");
        assert_eq!(resolve_library_name("unmapped"), "unmapped");
    }

    fn tempdir(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "station_requirements_{tag}_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn absent_requirements_file_is_ok() {
        let dir = tempdir("absent");
        RequirementsInstaller::probe_only()
            .ensure(&dir)
            .await
            .expect("nothing to install");
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn comment_only_file_is_ok() {
        let dir = tempdir("comments");
        fs::write(dir.join(REQUIREMENTS_FILE), "# nothing\n\n   \n").unwrap();
        RequirementsInstaller::probe_only()
            .ensure(&dir)
            .await
            .expect("nothing to install");
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn missing_entry_without_installer_fails() {
        let dir = tempdir("noinstaller");
        fs::write(
            dir.join(REQUIREMENTS_FILE),
            "surely_not_a_real_library_name==1.0\n",
        )
        .unwrap();
        let err = RequirementsInstaller::probe_only()
            .ensure(&dir)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DependencyInstallFailed(_)));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn failing_installer_is_fatal() {
        let dir = tempdir("badinstaller");
        fs::write(dir.join(REQUIREMENTS_FILE), "surely_not_a_real_library_name\n").unwrap();
        let installer =
            RequirementsInstaller::with_command(vec!["false".to_owned()]);
        let err = installer.ensure(&dir).await.unwrap_err();
        assert!(matches!(err, ProvisionError::DependencyInstallFailed(_)));
        fs::remove_dir_all(dir).ok();
    }
}
