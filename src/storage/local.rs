use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{ArchiveStorage, RemoteObject, StorageError, StorageResult, UploadSource, file_digest};

/// Local filesystem archive backend.
///
/// Artifacts are copied to `{root}/{key}`, where `key` uses `/` separators.
/// The copy lands under a temporary name and is renamed into place, then
/// read back to confirm size and checksum.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::Config(format!(
                    "invalid archive key '{key}'"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl ArchiveStorage for LocalStorage {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn verify_access(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        // Write and remove a marker file so a read-only destination fails now
        // rather than after the first export.
        let marker = self.root.join(format!(".dbcleanup-verify-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&marker, b"verify").await?;
        tokio::fs::remove_file(&marker).await?;

        debug!("Local archive destination is writable");
        Ok(())
    }

    #[instrument(skip(self, source), fields(size = source.size_bytes))]
    async fn upload(&self, source: UploadSource<'_>, key: &str) -> StorageResult<RemoteObject> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(&dest);
        debug!(src = %source.path.display(), dest = %dest.display(), "Copying artifact");

        if let Err(e) = tokio::fs::copy(source.path, &temp_path).await {
            remove_quietly(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &dest).await {
            remove_quietly(&temp_path).await;
            return Err(e.into());
        }

        let (checksum, size) = file_digest(&dest).await?;
        if size != source.size_bytes || checksum != source.checksum {
            remove_quietly(&dest).await;
            return Err(StorageError::Integrity {
                key: key.to_string(),
                detail: format!(
                    "expected {} bytes with sha256 {}, found {} bytes with sha256 {}",
                    source.size_bytes, source.checksum, size, checksum
                ),
            });
        }

        info!(path = %dest.display(), size, "Artifact archived locally");
        Ok(RemoteObject {
            location: dest.to_string_lossy().to_string(),
            size_bytes: size,
        })
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    dest.with_file_name(name)
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn staged(dir: &Path, content: &[u8]) -> (PathBuf, String) {
        let path = dir.join("log_20240601T000000Z.csv");
        tokio::fs::write(&path, content).await.unwrap();
        let (checksum, _) = file_digest(&path).await.unwrap();
        (path, checksum)
    }

    #[tokio::test]
    async fn test_upload_copies_and_verifies() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let content = b"id,dttm\n1,2024-01-01\n";
        let (path, checksum) = staged(staging.path(), content).await;

        let storage = LocalStorage::new(archive.path());
        let remote = storage
            .upload(
                UploadSource {
                    path: &path,
                    checksum: &checksum,
                    size_bytes: content.len() as u64,
                },
                "airflow/log/20240601T000000Z.csv",
            )
            .await
            .unwrap();

        let dest = archive.path().join("airflow/log/20240601T000000Z.csv");
        assert_eq!(remote.location, dest.to_string_lossy());
        assert_eq!(remote.size_bytes, content.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
        // The staged source is left for the caller to clean up.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_upload_overwrites_same_key() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let storage = LocalStorage::new(archive.path());
        let key = "airflow/log/20240601T000000Z.csv";

        for content in [&b"first"[..], &b"second run"[..]] {
            let (path, checksum) = staged(staging.path(), content).await;
            storage
                .upload(
                    UploadSource {
                        path: &path,
                        checksum: &checksum,
                        size_bytes: content.len() as u64,
                    },
                    key,
                )
                .await
                .unwrap();
        }

        let stored = tokio::fs::read(archive.path().join(key)).await.unwrap();
        assert_eq!(stored, b"second run");
        let mut entries = tokio::fs::read_dir(archive.path().join("airflow/log"))
            .await
            .unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "no temp files should be left behind");
    }

    #[tokio::test]
    async fn test_upload_checksum_mismatch_is_integrity_error() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let (path, _) = staged(staging.path(), b"payload").await;

        let storage = LocalStorage::new(archive.path());
        let result = storage
            .upload(
                UploadSource {
                    path: &path,
                    checksum: "0000",
                    size_bytes: 7,
                },
                "airflow/log/x.csv",
            )
            .await;

        assert!(matches!(result, Err(StorageError::Integrity { .. })));
        assert!(!archive.path().join("airflow/log/x.csv").exists());
    }

    #[tokio::test]
    async fn test_upload_missing_source_is_io_error() {
        let archive = TempDir::new().unwrap();
        let storage = LocalStorage::new(archive.path());
        let missing = archive.path().join("missing.csv");

        let result = storage
            .upload(
                UploadSource {
                    path: &missing,
                    checksum: "",
                    size_bytes: 0,
                },
                "airflow/log/x.csv",
            )
            .await;

        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let archive = TempDir::new().unwrap();
        let storage = LocalStorage::new(archive.path());
        assert!(storage.object_path("../escape.csv").is_err());
        assert!(storage.object_path("a//b.csv").is_err());
        assert!(storage.object_path("airflow/log/x.csv").is_ok());
    }

    #[tokio::test]
    async fn test_verify_access_creates_destination() {
        let base = TempDir::new().unwrap();
        let root = base.path().join("archive");
        let storage = LocalStorage::new(&root);

        storage.verify_access().await.unwrap();

        assert!(root.is_dir());
        let mut entries = tokio::fs::read_dir(&root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
