//! [`FileStore`] backed by a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::application::storage::{FileStore, FileStoreError, FileWriter};

/// Stores each file as `<root>/<stored name>`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), FileStoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| FileStoreError::Io {
                path: self.root.clone(),
                source,
            })
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn path_for(&self, stored_name: &str) -> PathBuf {
        self.root.join(stored_name)
    }

    async fn exists(&self, stored_name: &str) -> bool {
        fs::try_exists(self.path_for(stored_name))
            .await
            .unwrap_or(false)
    }

    async fn create(&self, stored_name: &str) -> Result<FileWriter, FileStoreError> {
        self.ensure_root().await?;
        let path = self.path_for(stored_name);
        let file = fs::File::create(&path)
            .await
            .map_err(|source| FileStoreError::Io { path, source })?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FileStoreError> {
        let source = self.path_for(from);
        match fs::rename(&source, self.path_for(to)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(from.to_string()))
            }
            Err(e) => Err(FileStoreError::Io {
                path: source,
                source: e,
            }),
        }
    }

    async fn delete(&self, stored_name: &str) -> Result<(), FileStoreError> {
        let path = self.path_for(stored_name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("deleted {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(stored_name.to_string()))
            }
            Err(source) => Err(FileStoreError::Io { path, source }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    fn scratch_store() -> LocalFileStore {
        LocalFileStore::new(std::env::temp_dir().join(format!("soundlink-store-{}", Uuid::new_v4())))
    }

    #[tokio::test]
    async fn test_create_write_then_exists() {
        // Arrange
        let store = scratch_store();

        // Act
        let mut writer = store.create("f_a.mp3").await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        // Assert
        assert!(store.exists("f_a.mp3").await);
        let bytes = fs::read(store.path_for("f_a.mp3")).await.unwrap();
        assert_eq!(bytes, b"abc");
        let _ = fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn test_create_truncates_existing_file() {
        let store = scratch_store();
        let mut first = store.create("x").await.unwrap();
        first.write_all(b"long contents").await.unwrap();
        first.shutdown().await.unwrap();
        drop(first);

        let mut second = store.create("x").await.unwrap();
        second.write_all(b"new").await.unwrap();
        second.shutdown().await.unwrap();
        drop(second);

        assert_eq!(fs::read(store.path_for("x")).await.unwrap(), b"new");
        let _ = fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let store = scratch_store();
        let mut writer = store.create("gone").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        store.delete("gone").await.unwrap();

        assert!(!store.exists("gone").await);
        let _ = fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn test_rename_replaces_target() {
        // Arrange
        let store = scratch_store();
        for (name, body) in [("old", &b"old"[..]), ("new.partial", &b"fresh"[..])] {
            let mut writer = store.create(name).await.unwrap();
            writer.write_all(body).await.unwrap();
            writer.shutdown().await.unwrap();
        }

        // Act
        store.rename("new.partial", "old").await.unwrap();

        // Assert
        assert!(!store.exists("new.partial").await);
        assert_eq!(fs::read(store.path_for("old")).await.unwrap(), b"fresh");
        let _ = fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn test_rename_missing_source_is_not_found() {
        let store = scratch_store();
        store.ensure_root().await.unwrap();

        let result = store.rename("absent", "target").await;

        assert!(matches!(result, Err(FileStoreError::NotFound(name)) if name == "absent"));
        let _ = fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_not_found() {
        let store = scratch_store();
        let result = store.delete("never-there").await;
        assert!(matches!(result, Err(FileStoreError::NotFound(name)) if name == "never-there"));
    }

    #[tokio::test]
    async fn test_exists_is_false_without_root() {
        let store = scratch_store();
        assert!(!store.exists("anything").await);
    }
}
