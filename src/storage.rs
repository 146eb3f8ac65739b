//! Blob storage for extracted documents.
//!
//! Artifacts live in per-kind buckets (`documents`, `actes`) under one
//! root directory. Jobs reference artifacts either relative to a bucket
//! (`documents/123.pdf`) or as fully qualified URLs; reads normalize both
//! forms to a path under the root.

use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Filesystem-backed bucket store.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reduce an artifact reference to a bucket-relative path.
    ///
    /// Fully qualified URLs keep their path component; a leading bucket
    /// segment is preserved. Traversal segments are rejected.
    pub fn normalize(&self, artifact_path: &str) -> Result<PathBuf> {
        let relative = match Url::parse(artifact_path) {
            Ok(url) if url.scheme() != "file" && !url.cannot_be_a_base() => {
                url.path().trim_start_matches('/').to_string()
            }
            _ => artifact_path.trim_start_matches('/').to_string(),
        };

        if relative.is_empty() {
            return Err(StorageError::InvalidPath(artifact_path.to_string()));
        }
        let path = PathBuf::from(&relative);
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::InvalidPath(artifact_path.to_string()));
        }
        Ok(path)
    }

    /// Absolute path of an artifact under the store root.
    pub fn resolve(&self, artifact_path: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.normalize(artifact_path)?))
    }

    /// Read an artifact's bytes.
    pub fn read(&self, artifact_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(artifact_path)?;
        Ok(std::fs::read(path)?)
    }

    /// Write content into a bucket and return the stored artifact path.
    pub fn write(&self, bucket: &str, name: &str, content: &[u8]) -> Result<String> {
        let dir = self.root.join(bucket);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        Ok(format!("{}/{}", bucket, name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let path = store.write("documents", "j1.pdf", b"%PDF-1.4").unwrap();
        assert_eq!(path, "documents/j1.pdf");
        assert_eq!(store.read(&path).unwrap(), b"%PDF-1.4");
    }

    #[test]
    fn test_normalize_relative_path() {
        let store = BlobStore::new("/data");
        assert_eq!(
            store.normalize("documents/j1.pdf").unwrap(),
            PathBuf::from("documents/j1.pdf")
        );
        assert_eq!(
            store.normalize("/actes/j2.pdf").unwrap(),
            PathBuf::from("actes/j2.pdf")
        );
    }

    #[test]
    fn test_normalize_full_url() {
        let store = BlobStore::new("/data");
        assert_eq!(
            store
                .normalize("https://blob.example.com/documents/j1.pdf")
                .unwrap(),
            PathBuf::from("documents/j1.pdf")
        );
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        let store = BlobStore::new("/data");
        assert!(store.normalize("../etc/passwd").is_err());
        assert!(store.normalize("documents/../../etc").is_err());
    }

    #[test]
    fn test_read_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(matches!(
            store.read("documents/missing.pdf"),
            Err(StorageError::Io(_))
        ));
    }
}
