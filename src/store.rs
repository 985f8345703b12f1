//! Bookkeeping of command records, addressed by (instance, command, folder).
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::{CommandKey, CommandState, DocumentInfo};
use crate::retry::Retryable;

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

/// Field of a persisted [`CommandState`] holding its [`DocumentInfo`].
pub const DOCUMENT_INFO_FIELD: &str = "documentInfo";

/// Lifecycle bucket a record lives in. A record is in exactly one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Current,
    Completed,
    Corrupt,
}

impl Folder {
    pub const ALL: [Folder; 3] = [Folder::Current, Folder::Completed, Folder::Corrupt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Current => "current",
            Folder::Completed => "completed",
            Folder::Corrupt => "corrupt",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "current" => Ok(Folder::Current),
            "completed" => Ok(Folder::Completed),
            "corrupt" => Ok(Folder::Corrupt),
            other => Err(format!("unknown folder `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for {key} in folder {folder}")]
    RecordNotFound { key: CommandKey, folder: Folder },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode or decode record {key}: {source}")]
    Serialization {
        key: CommandKey,
        #[source]
        source: serde_json::Error,
    },
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

#[async_trait]
pub trait CommandStateStore: Send + Sync {
    /// Creates or overwrites the record under `key` in `folder`.
    async fn persist_data(&self, key: &CommandKey, folder: Folder, record: &Value) -> Result<(), StoreError>;

    /// Reads the full record, `None` when absent.
    async fn load_data(&self, key: &CommandKey, folder: Folder) -> Result<Option<Value>, StoreError>;

    /// Relocates a record. Callers never see it in both folders or in neither.
    async fn move_command_state(&self, key: &CommandKey, src: Folder, dst: Folder) -> Result<(), StoreError>;

    /// Deletes a record; deleting an absent record succeeds.
    async fn remove_data(&self, key: &CommandKey, folder: Folder) -> Result<(), StoreError>;

    /// Command ids currently stored in `folder` for an instance.
    async fn list_commands(&self, instance_id: &str, folder: Folder) -> Result<Vec<String>, StoreError>;

    /// Storage location of a folder. No side effects.
    fn cmd_state_dir(&self, instance_id: &str, folder: Folder) -> PathBuf;

    fn name(&self) -> &'static str;

    async fn get_document_info(&self, key: &CommandKey, folder: Folder) -> Result<DocumentInfo, StoreError> {
        let record = self
            .load_data(key, folder)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound { key: key.clone(), folder })?;
        let info = record.get(DOCUMENT_INFO_FIELD).cloned().unwrap_or(Value::Null);
        serde_json::from_value(info).map_err(|source| StoreError::Serialization {
            key: key.clone(),
            source,
        })
    }

    async fn persist_document_info(
        &self,
        key: &CommandKey,
        folder: Folder,
        info: &DocumentInfo,
    ) -> Result<(), StoreError> {
        let mut record = self
            .load_data(key, folder)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound { key: key.clone(), folder })?;
        let info = serde_json::to_value(info).map_err(|source| StoreError::Serialization {
            key: key.clone(),
            source,
        })?;
        match record.as_object_mut() {
            Some(obj) => {
                obj.insert(DOCUMENT_INFO_FIELD.to_string(), info);
            }
            None => {
                let mut obj = serde_json::Map::new();
                obj.insert(DOCUMENT_INFO_FIELD.to_string(), info);
                record = Value::Object(obj);
            }
        }
        self.persist_data(key, folder, &record).await
    }

    /// Folders currently holding a record for `key`.
    async fn locate(&self, key: &CommandKey) -> Result<Vec<Folder>, StoreError> {
        let mut found = Vec::new();
        for folder in Folder::ALL {
            if self.load_data(key, folder).await?.is_some() {
                found.push(folder);
            }
        }
        Ok(found)
    }
}

impl fmt::Debug for dyn CommandStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStateStore")
            .field("impl", &self.name())
            .finish()
    }
}

pub async fn persist_command_state(
    store: &dyn CommandStateStore,
    state: &CommandState,
    folder: Folder,
) -> Result<(), StoreError> {
    let key = state.key();
    let record = serde_json::to_value(state).map_err(|source| StoreError::Serialization {
        key: key.clone(),
        source,
    })?;
    store.persist_data(&key, folder, &record).await
}

pub async fn load_command_state(
    store: &dyn CommandStateStore,
    key: &CommandKey,
    folder: Folder,
) -> Result<Option<CommandState>, StoreError> {
    match store.load_data(key, folder).await? {
        Some(record) => serde_json::from_value(record)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                key: key.clone(),
                source,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::tests::sample_state;

    #[test]
    fn test_folder_parse_and_display() {
        assert_eq!("Completed".parse::<Folder>().unwrap(), Folder::Completed);
        assert_eq!(Folder::Corrupt.to_string(), "corrupt");
        assert!("pending".parse::<Folder>().is_err());
    }

    #[tokio::test]
    async fn test_typed_roundtrip_through_trait_object() {
        let store: std::sync::Arc<dyn CommandStateStore> = InMemoryStateStore::new();
        let state = sample_state(&["p1", "p2"]);

        persist_command_state(store.as_ref(), &state, Folder::Current).await.unwrap();
        let loaded = load_command_state(store.as_ref(), &state.key(), Folder::Current)
            .await
            .unwrap()
            .expect("record present");
        assert_eq!(loaded, state);
        assert_eq!(format!("{:?}", store), "CommandStateStore { impl: \"InMemoryStateStore\" }");
    }

    #[tokio::test]
    async fn test_document_info_accessors() {
        let store = InMemoryStateStore::new();
        let state = sample_state(&["p1"]);
        let key = state.key();

        let missing = store.get_document_info(&key, Folder::Current).await;
        assert!(matches!(missing, Err(StoreError::RecordNotFound { .. })));

        persist_command_state(store.as_ref(), &state, Folder::Current).await.unwrap();
        let mut info = store.get_document_info(&key, Folder::Current).await.unwrap();
        assert!(!info.reported);

        info.reported = true;
        store.persist_document_info(&key, Folder::Current, &info).await.unwrap();

        let loaded = load_command_state(store.as_ref(), &key, Folder::Current)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.document_info.reported);
        assert_eq!(loaded.plugins.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_document_info_requires_record() {
        let store = InMemoryStateStore::new();
        let state = sample_state(&["p1"]);
        let err = store
            .persist_document_info(&state.key(), Folder::Completed, &state.document_info)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { folder: Folder::Completed, .. }));
        assert!(!err.is_retryable());
    }
}
