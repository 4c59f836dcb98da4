use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use crate::storage::KvStorage;

/// Key-value store persisted as one JSON object on disk. Every write
/// rewrites the file through a temporary sibling and a rename, and only
/// reaches memory once the rename succeeded.
pub struct JsonFileKvStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileKvStorage {
    /// Open `path`, loading existing entries if the file exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if fs::try_exists(&path).await.unwrap_or(false) {
            let raw = fs::read_to_string(&path)
                .await
                .context(format!("Failed to read KV file: {:?}", path))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).context(format!("Corrupt KV file: {:?}", path))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .context(format!("Failed to write KV file: {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .context(format!("Failed to replace KV file: {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl KvStorage for JsonFileKvStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut staged = entries.clone();
        staged.insert(key.to_string(), value);
        self.persist(&staged).await?;
        *entries = staged;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut staged = entries.clone();
        staged.remove(key);
        self.persist(&staged).await?;
        *entries = staged;
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        self.persist(&BTreeMap::new()).await?;
        entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStorageExt;

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("kv.json");

        let kv = JsonFileKvStorage::open(&path).await.unwrap();
        kv.set_json("docHash:abc", &"123").await.unwrap();
        kv.set_json("doc:abc", &serde_json::json!({"id": "abc"})).await.unwrap();
        drop(kv);

        let reopened = JsonFileKvStorage::open(&path).await.unwrap();
        assert_eq!(
            reopened.get_json::<String>("docHash:abc").await.unwrap().as_deref(),
            Some("123")
        );
        assert_eq!(reopened.list(Some("doc:")).await.unwrap(), vec!["doc:abc"]);

        reopened.clear().await.unwrap();
        let empty = JsonFileKvStorage::open(&path).await.unwrap();
        assert!(empty.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_entries_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");

        let kv = JsonFileKvStorage::open(&path).await.unwrap();
        kv.set_json("doc:a", &"kept").await.unwrap();

        // A directory where the temporary file goes makes every write fail
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        assert!(kv.set_json("doc:b", &"lost").await.is_err());
        assert!(kv.get("doc:b").await.unwrap().is_none());

        assert!(kv.delete("doc:a").await.is_err());
        assert!(kv.clear().await.is_err());
        assert_eq!(kv.get_json::<String>("doc:a").await.unwrap().as_deref(), Some("kept"));
        assert_eq!(kv.list(None).await.unwrap(), vec!["doc:a"]);
    }
}
