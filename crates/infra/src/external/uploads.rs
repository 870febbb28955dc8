//! Binary asset uploads (avatars).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("upload failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Stores an asset and returns its public URL.
#[async_trait]
pub trait AvatarUploader: Send + Sync {
    async fn upload(&self, bytes: &[u8], folder: &str, filename: &str) -> Result<String, UploadError>;
}

fn check(bytes: &[u8]) -> Result<(), UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Rejected("file is empty".to_string()));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(UploadError::Rejected(format!(
            "file exceeds {MAX_UPLOAD_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Random object name keeping a sanitized extension of the original filename.
fn object_name(filename: &str) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    match ext {
        Some(ext) => format!("{}.{ext}", Uuid::now_v7()),
        None => Uuid::now_v7().to_string(),
    }
}

/// Keeps uploads in memory and hands out URLs under a fixed base.
#[derive(Debug)]
pub struct InMemoryAvatarUploader {
    base_url: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryAvatarUploader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }
}

impl Default for InMemoryAvatarUploader {
    fn default() -> Self {
        Self::new("https://assets.taskboard.local")
    }
}

#[async_trait]
impl AvatarUploader for InMemoryAvatarUploader {
    async fn upload(&self, bytes: &[u8], folder: &str, filename: &str) -> Result<String, UploadError> {
        check(bytes)?;
        let url = format!("{}/{}/{}", self.base_url, folder, object_name(filename));
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), bytes.to_vec());
        Ok(url)
    }
}

/// Writes uploads under a local directory served at `public_base_url`.
#[derive(Debug, Clone)]
pub struct LocalAvatarUploader {
    root: PathBuf,
    public_base_url: String,
}

impl LocalAvatarUploader {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AvatarUploader for LocalAvatarUploader {
    async fn upload(&self, bytes: &[u8], folder: &str, filename: &str) -> Result<String, UploadError> {
        check(bytes)?;
        if folder.is_empty() || !folder.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(UploadError::Rejected(format!("invalid folder: {folder}")));
        }

        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir).await?;

        let name = object_name(filename);
        tokio::fs::write(dir.join(&name), bytes).await?;
        debug!(folder, file = %name, size = bytes.len(), "upload stored");

        Ok(format!("{}/{}/{}", self.public_base_url, folder, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_keeps_safe_extension_only() {
        assert!(object_name("me.PNG").ends_with(".png"));
        assert!(!object_name("../../etc/passwd").contains('/'));
        assert!(!object_name("weird.ex$e").contains('$'));
    }

    #[tokio::test]
    async fn in_memory_upload_returns_retrievable_url() {
        let uploader = InMemoryAvatarUploader::new("https://cdn.test/");
        let url = uploader.upload(b"png-bytes", "users", "me.png").await.unwrap();

        assert!(url.starts_with("https://cdn.test/users/"));
        assert_eq!(uploader.get(&url).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let uploader = InMemoryAvatarUploader::default();
        assert!(matches!(
            uploader.upload(&[], "users", "me.png").await,
            Err(UploadError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn local_upload_writes_file() {
        let root = std::env::temp_dir().join(format!("taskboard-uploads-{}", Uuid::now_v7()));
        let uploader = LocalAvatarUploader::new(&root, "http://localhost:8080/uploads");

        let url = uploader.upload(b"jpeg", "users", "a.jpg").await.unwrap();
        let name = url.rsplit('/').next().unwrap();

        let stored = tokio::fs::read(root.join("users").join(name)).await.unwrap();
        assert_eq!(stored, b"jpeg");

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
