use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{Backup, BackupConfig, ServerConfig};

/// Everything that survives a restart. Runtime fields are never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreData {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub backup_configs: HashMap<Uuid, BackupConfig>,
    #[serde(default)]
    pub backups: HashMap<Uuid, Vec<Backup>>,
    #[serde(default)]
    pub bungeecord_port: Option<u16>,
}

/// JSON file rewritten wholesale on every save.
pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh install. A file that does not parse is
    /// moved aside to `<name>.corrupt-<timestamp>` and the manager starts
    /// empty, so the next save cannot overwrite it.
    pub async fn load(&self) -> Result<StoreData> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(StoreData::default());
        }

        let raw = fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {:?}", self.path))?;

        match serde_json::from_slice(&raw) {
            Ok(data) => Ok(data),
            Err(e) => {
                let aside = self.corrupt_path();
                tracing::error!(
                    "Failed to parse {:?}, moving it to {:?} and starting empty: {}",
                    self.path,
                    aside,
                    e
                );
                fs::rename(&self.path, &aside)
                    .await
                    .with_context(|| format!("Failed to move {:?} aside", self.path))?;
                Ok(StoreData::default())
            }
        }
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        PathBuf::from(name)
    }

    /// Builds the snapshot under the write lock so the last writer always
    /// persists the newest state.
    pub async fn save_with<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> StoreData,
    {
        let _guard = self.write_lock.lock().await;
        let data = snapshot();
        let json = serde_json::to_vec_pretty(&data).context("Failed to serialize store")?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerType;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("data.json"));
        assert_eq!(store.load().await.unwrap(), StoreData::default());
    }

    #[tokio::test]
    async fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("data.json"));

        let config = ServerConfig::new("Hub".into(), ServerType::Paper, "1.21.1".into(), 25565, 2048);
        let id = config.id;
        let mut data = StoreData {
            servers: vec![config],
            bungeecord_port: Some(25577),
            ..Default::default()
        };
        data.backup_configs.insert(id, BackupConfig::default());

        let expected = data.clone();
        store.save_with(move || data).await.unwrap();

        assert_eq!(store.load().await.unwrap(), expected);
        assert!(!dir.path().join("data.json.tmp").exists());
    }

    #[tokio::test]
    async fn reads_manager_data_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "servers": [{"id": id, "name": "Hub", "type": "purpur", "version": "1.21.1", "port": 25566, "memory": 4096}],
            "backupConfigs": {
                id.to_string(): {"enabled": true, "format": "tar.gz", "destination": "", "rotation": 3,
                    "schedule": "weekly", "scheduleTime": "04:30", "scheduleDay": 6}
            },
            "backups": {},
            "bungeecordPort": 25570
        });
        tokio::fs::write(&path, json.to_string()).await.unwrap();

        let data = Store::new(path).load().await.unwrap();
        assert_eq!(data.servers[0].server_type, ServerType::Purpur);
        assert_eq!(data.servers[0].memory, 4096);
        assert_eq!(data.backup_configs[&id].rotation, 3);
        assert_eq!(data.bungeecord_port, Some(25570));
    }

    #[tokio::test]
    async fn backup_config_fields_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "servers": [{"id": id, "name": "Survival", "type": "paper", "version": "1.21.1", "port": 25565, "memory": 2048}],
            "backupConfigs": {
                id.to_string(): {"enabled": true, "rotation": 2}
            }
        });
        tokio::fs::write(&path, json.to_string()).await.unwrap();

        let data = Store::new(path).load().await.unwrap();
        assert_eq!(data.servers.len(), 1);
        assert_eq!(data.servers[0].name, "Survival");
        let config = &data.backup_configs[&id];
        assert!(config.enabled);
        assert_eq!(config.rotation, 2);
        assert_eq!(config.format, crate::types::ArchiveFormat::Zip);
        assert_eq!(config.destination, "");
        assert_eq!(config.schedule_time, BackupConfig::default().schedule_time);
    }

    #[tokio::test]
    async fn corrupt_file_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = Store::new(&path);

        assert_eq!(store.load().await.unwrap(), StoreData::default());
        assert!(!path.exists());

        store.save_with(StoreData::default).await.unwrap();

        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("data.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join(&kept[0])).unwrap(), "{not json");
    }
}
