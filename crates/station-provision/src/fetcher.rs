//! Backend archive download and extraction.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::Client;
use tar::Archive;
use tracing::{debug, info};

use station_manifest::BackendInfo;

use crate::error::ProvisionError;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads backend archives into `backends/<backend-id>/` and verifies the
/// entry artifact.
///
/// [`ensure`](Self::ensure) is idempotent: when the entry artifact already
/// exists on disk the network is never touched.
pub struct BackendFetcher {
    backends_dir: PathBuf,
    client: Client,
}

impl BackendFetcher {
    pub fn new(backends_dir: impl Into<PathBuf>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("moondream-station/", env!("CARGO_PKG_VERSION")))
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            backends_dir: backends_dir.into(),
            client,
        }
    }

    /// Install directory for one backend.
    pub fn backend_dir(&self, backend_id: &str) -> PathBuf {
        self.backends_dir.join(backend_id)
    }

    /// Platform path of the backend's loadable entry artifact, e.g.
    /// `backends/<id>/libbackend.so` for `entry_module = "backend"`.
    pub fn entry_artifact(&self, backend_id: &str, entry_module: &str) -> PathBuf {
        self.backend_dir(backend_id)
            .join(libloading::library_filename(entry_module))
    }

    /// Make the backend's files present on disk and return the entry artifact
    /// path.  Skips the download entirely when the artifact already exists.
    pub async fn ensure(
        &self,
        backend_id: &str,
        info: &BackendInfo,
    ) -> Result<PathBuf, ProvisionError> {
        let dir = self.backend_dir(backend_id);
        let entry = self.entry_artifact(backend_id, &info.entry_module);

        if entry.exists() {
            debug!(backend_id, entry = %entry.display(), "backend already present");
            return Ok(entry);
        }

        if info.download_url.starts_with("http://") || info.download_url.starts_with("https://") {
            info!(backend_id, url = %info.download_url, "downloading backend");
            let bytes = self
                .client
                .get(&info.download_url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;

            std::fs::create_dir_all(&dir)?;
            if info.download_url.ends_with(".zip") {
                extract_zip(&bytes, &dir)?;
            } else {
                extract_tar_gz(&bytes, &dir)?;
            }
            flatten_single_dir(&dir)?;
        } else {
            let source = Path::new(&info.download_url);
            if !source.is_dir() {
                return Err(ProvisionError::DownloadFailed(format!(
                    "local backend source is not a directory: {}",
                    source.display()
                )));
            }
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            copy_dir(source, &dir)?;
        }

        if !entry.exists() {
            return Err(ProvisionError::Corrupt(format!(
                "entry artifact missing after install: {}",
                entry.display()
            )));
        }

        info!(backend_id, entry = %entry.display(), "backend installed");
        Ok(entry)
    }
}

/// Extract a `.tar.gz` archive into `dest` as-is.
fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<(), ProvisionError> {
    let tar_gz = GzDecoder::new(Cursor::new(bytes));
    let mut archive = Archive::new(tar_gz);
    archive
        .unpack(dest)
        .map_err(|e| ProvisionError::Corrupt(format!("tar extraction failed: {e}")))
}

/// Extract a ZIP archive into `dest` as-is.
fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), ProvisionError> {
    let cursor = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ProvisionError::Corrupt(format!("zip open failed: {e}")))?;
    archive
        .extract(dest)
        .map_err(|e| ProvisionError::Corrupt(format!("zip extraction failed: {e}")))
}

/// When `dir` contains exactly one entry and it is a directory, hoist that
/// directory's children into `dir` and remove it.  Archives often wrap their
/// content in a single release-named folder.
fn flatten_single_dir(dir: &Path) -> Result<(), ProvisionError> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.path().is_dir() {
        return Ok(());
    }

    let inner = only.path();
    for child in std::fs::read_dir(&inner)? {
        let child = child?;
        std::fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    std::fs::remove_dir(inner)?;
    Ok(())
}

/// Recursive directory copy.
fn copy_dir(src: &Path, dest: &Path) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn tempdir(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "station_provision_{tag}_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn local_backend(source_dir: &Path) -> BackendInfo {
        BackendInfo {
            name: "test".into(),
            download_url: source_dir.to_str().unwrap().into(),
            entry_module: "backend".into(),
            functions: vec!["caption".into()],
            version: "1.0.0".into(),
            min_version: None,
        }
    }

    fn entry_file_name() -> std::ffi::OsString {
        libloading::library_filename("backend")
    }

    #[tokio::test]
    async fn local_install_copies_and_verifies_entry() {
        let root = tempdir("local");
        let source = root.join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(entry_file_name()), b"not-a-real-library").unwrap();
        fs::write(source.join("requirements.txt"), b"# none\n").unwrap();

        let fetcher = BackendFetcher::new(root.join("backends"));
        let entry = fetcher
            .ensure("b0", &local_backend(&source))
            .await
            .expect("local install should succeed");
        assert!(entry.exists());
        assert!(fetcher.backend_dir("b0").join("requirements.txt").exists());
        fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let root = tempdir("idempotent");
        let source = root.join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(entry_file_name()), b"v1").unwrap();

        let fetcher = BackendFetcher::new(root.join("backends"));
        let info = local_backend(&source);
        fetcher.ensure("b0", &info).await.unwrap();

        // Remove the source; a second ensure must not need it.
        fs::remove_dir_all(&source).unwrap();
        let entry = fetcher.ensure("b0", &info).await.expect("skip path");
        assert!(entry.exists());
        fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn missing_entry_artifact_is_corrupt() {
        let root = tempdir("corrupt");
        let source = root.join("source");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("other_file"), b"x").unwrap();

        let fetcher = BackendFetcher::new(root.join("backends"));
        let err = fetcher.ensure("b0", &local_backend(&source)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Corrupt(_)), "got {err:?}");
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn flatten_hoists_single_wrapper_dir() {
        let root = tempdir("flatten");
        let wrapper = root.join("release-v1");
        fs::create_dir_all(&wrapper).unwrap();
        fs::write(wrapper.join("a.txt"), b"a").unwrap();
        fs::create_dir_all(wrapper.join("sub")).unwrap();
        fs::write(wrapper.join("sub").join("b.txt"), b"b").unwrap();

        flatten_single_dir(&root).unwrap();
        assert!(root.join("a.txt").exists());
        assert!(root.join("sub").join("b.txt").exists());
        assert!(!root.join("release-v1").exists());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn flatten_leaves_multi_entry_dirs_alone() {
        let root = tempdir("noflatten");
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("b.txt"), b"b").unwrap();

        flatten_single_dir(&root).unwrap();
        assert!(root.join("a.txt").exists());
        assert!(root.join("b.txt").exists());
        fs::remove_dir_all(root).ok();
    }
}
