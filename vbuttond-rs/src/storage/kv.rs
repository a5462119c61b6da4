/* Transaction-free key/value namespace for global strings (`settings.json`). */

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use super::StorageError;

pub const SETTINGS_FILE: &str = "settings.json";

pub struct KeyValueStore {
    path: PathBuf,
    /* serializes read-modify-write cycles on the file */
    lock: Mutex<()>,
}

impl KeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: root.into().join(SETTINGS_FILE),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    async fn write_all(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| StorageError::io(&self.path, e))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("empty key".into()));
        }
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(key.to_string(), value.to_string());
        self.write_all(&map).await?;
        debug!("Stored key '{}'", key);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        let existed = map.remove(key).is_some();
        if existed {
            self.write_all(&map).await?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::new(dir.path());

        assert_eq!(kv.get("wifi_passphrase").await.unwrap(), None);
        kv.set("wifi_passphrase", "hunter22").await.unwrap();
        kv.set("device_name", "FLipMouse").await.unwrap();
        assert_eq!(kv.get("wifi_passphrase").await.unwrap().as_deref(), Some("hunter22"));

        /* a second instance sees the persisted value */
        let reopened = KeyValueStore::new(dir.path());
        assert_eq!(reopened.get("device_name").await.unwrap().as_deref(), Some("FLipMouse"));

        assert!(kv.remove("wifi_passphrase").await.unwrap());
        assert!(!kv.remove("wifi_passphrase").await.unwrap());
        assert!(kv.set("", "x").await.is_err());
    }
}
