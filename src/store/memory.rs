use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{CommandStateStore, Folder, StoreError};
use crate::command::CommandKey;

type RecordKey = (String, String, Folder);

/// Volatile store for tests and dry runs. One lock guards every folder, so a
/// move is a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<RecordKey, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record_key(key: &CommandKey, folder: Folder) -> RecordKey {
        (key.instance_id.clone(), key.command_id.clone(), folder)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl CommandStateStore for InMemoryStateStore {
    async fn persist_data(&self, key: &CommandKey, folder: Folder, record: &Value) -> Result<(), StoreError> {
        let mut w = self.records.write().await;
        w.insert(Self::record_key(key, folder), record.clone());
        Ok(())
    }

    async fn load_data(&self, key: &CommandKey, folder: Folder) -> Result<Option<Value>, StoreError> {
        Ok(self.records.read().await.get(&Self::record_key(key, folder)).cloned())
    }

    async fn move_command_state(&self, key: &CommandKey, src: Folder, dst: Folder) -> Result<(), StoreError> {
        let mut w = self.records.write().await;
        let record = w
            .remove(&Self::record_key(key, src))
            .ok_or_else(|| StoreError::RecordNotFound { key: key.clone(), folder: src })?;
        w.insert(Self::record_key(key, dst), record);
        Ok(())
    }

    async fn remove_data(&self, key: &CommandKey, folder: Folder) -> Result<(), StoreError> {
        self.records.write().await.remove(&Self::record_key(key, folder));
        Ok(())
    }

    async fn list_commands(&self, instance_id: &str, folder: Folder) -> Result<Vec<String>, StoreError> {
        let r = self.records.read().await;
        let mut ids: Vec<String> = r
            .keys()
            .filter(|(instance, _, f)| instance == instance_id && *f == folder)
            .map(|(_, command, _)| command.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn cmd_state_dir(&self, instance_id: &str, folder: Folder) -> PathBuf {
        PathBuf::from("memory").join(instance_id).join(folder.as_str())
    }

    fn name(&self) -> &'static str {
        "InMemoryStateStore"
    }

    async fn locate(&self, key: &CommandKey) -> Result<Vec<Folder>, StoreError> {
        let r = self.records.read().await;
        Ok(Folder::ALL
            .into_iter()
            .filter(|folder| r.contains_key(&Self::record_key(key, *folder)))
            .collect())
    }
}
