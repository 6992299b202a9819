use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use dwh_core::LoadError;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ObjectStore;

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, LoadError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(LoadError::transport(
                format!("invalid object key {key:?}"),
                "keys must be relative paths inside the store root",
            ));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LoadError::transport(
                format!("reading object {}", path.display()),
                err,
            )),
        }
    }

    /// Writes through a temp file and an atomic rename, replacing any previous object.
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), LoadError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await.map_err(|e| {
            LoadError::transport(format!("creating directory {}", parent.display()), e)
        })?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                LoadError::transport(format!("opening temp file {}", temp_path.display()), e)
            })?;
        file.write_all(&bytes).await.map_err(|e| {
            LoadError::transport(format!("writing temp file {}", temp_path.display()), e)
        })?;
        file.flush().await.map_err(|e| {
            LoadError::transport(format!("flushing temp file {}", temp_path.display()), e)
        })?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(LoadError::transport(
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                ),
                err,
            ));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, LoadError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(LoadError::transport(
                        format!("listing {}", dir.display()),
                        err,
                    ))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| LoadError::transport(format!("listing {}", dir.display()), e))?
            {
                let path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                let file_type = entry.file_type().await.map_err(|e| {
                    LoadError::transport(format!("inspecting {}", path.display()), e)
                })?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if !hidden {
                    if let Some(key) = self.key_for(&path).filter(|k| k.starts_with(prefix)) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), LoadError> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, LoadError> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwh_core::{Table, Value};
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_store_round_trips_tables_and_reports_missing_keys() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        assert!(store.read("meta/meta.csv").await.unwrap().is_none());

        let table = Table::from_rows(
            ["file_name", "datetime_of_processing"],
            vec![vec![Value::text("a.csv"), Value::text("2024-01-01 10:00:00")]],
        )
        .unwrap();
        store.write("meta/meta.csv", &table).await.unwrap();
        store.write("meta/meta.csv", &table).await.unwrap();

        let read = store.read("meta/meta.csv").await.unwrap().expect("written");
        assert_eq!(read, table);
        assert_eq!(store.list("meta/").await.unwrap(), vec!["meta/meta.csv"]);
    }

    #[tokio::test]
    async fn local_store_lists_nested_keys_under_prefix_only() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        for key in ["scraped/2024/b.csv", "scraped/a.csv", "other/c.csv"] {
            store.put_bytes(key, b"x\n1\n".to_vec()).await.unwrap();
        }
        assert_eq!(
            store.list("scraped/").await.unwrap(),
            vec!["scraped/2024/b.csv", "scraped/a.csv"]
        );
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_keys() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        assert!(store.get_bytes("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn unsupported_suffix_fails_before_touching_storage() {
        let store = MemoryObjectStore::new();
        let err = store.read("scraped/offers.xlsx").await.unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat { .. }));
    }
}
