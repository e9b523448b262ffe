//! Attachment storage
//!
//! Blobs are opaque bytes addressed by `(folder, name)`. The local store
//! keeps them under a root directory and returns the file path.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("invalid blob name '{0}'")]
    InvalidName(String),

    #[error("blob io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait BlobStore: Send + Sync {
    /// Store bytes and return where they landed
    fn put(&self, bytes: &[u8], name: &str, folder: &str) -> Result<String, BlobError>;

    fn get(&self, name: &str, folder: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// True if something was removed
    fn delete(&self, name: &str, folder: &str) -> Result<bool, BlobError>;
}

/// Keep only characters that are safe in a file name
pub fn sanitize_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Blob store backed by a local folder
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str, folder: &str) -> Result<PathBuf, BlobError> {
        let clean = sanitize_name(name);
        if clean.is_empty() {
            return Err(BlobError::InvalidName(name.to_string()));
        }
        let folder = sanitize_name(folder);
        Ok(if folder.is_empty() {
            self.root.join(clean)
        } else {
            self.root.join(folder).join(clean)
        })
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, bytes: &[u8], name: &str, folder: &str) -> Result<String, BlobError> {
        let path = self.path_for(name, folder)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "blob stored");
        Ok(path.to_string_lossy().to_string())
    }

    fn get(&self, name: &str, folder: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.path_for(name, folder)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str, folder: &str) -> Result<bool, BlobError> {
        let path = self.path_for(name, folder)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_strips_paths() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("my file (1).pdf"), "my_file__1_.pdf");
        assert_eq!(sanitize_name(".hidden"), "hidden");
        assert_eq!(sanitize_name(".."), "");
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let path = store.put(b"hello", "brief.txt", "leads").unwrap();
        assert!(path.ends_with("brief.txt"));
        assert_eq!(store.get("brief.txt", "leads").unwrap(), Some(b"hello".to_vec()));
        assert!(store.delete("brief.txt", "leads").unwrap());
        assert!(!store.delete("brief.txt", "leads").unwrap());
        assert_eq!(store.get("brief.txt", "leads").unwrap(), None);
    }

    #[test]
    fn test_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(matches!(store.put(b"x", "..", ""), Err(BlobError::InvalidName(_))));
    }
}
