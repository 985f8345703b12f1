use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CommandStateStore, Folder, StoreError};
use crate::command::{CommandKey, DocumentInfo};

/// Records live at `<root>/<instance>/state/<folder>/<command>.json`, with
/// the instance and command ids percent-encoded.
///
/// Writes land in a temporary file next to the target and are renamed into
/// place, and a move is a single rename, so a reader sees either the old or
/// the new location but never both or neither.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &CommandKey, folder: Folder) -> PathBuf {
        self.cmd_state_dir(&key.instance_id, folder)
            .join(format!("{}.json", encode_id(&key.command_id)))
    }
}

/// Percent-encodes an id into a single path component. Only ASCII
/// alphanumerics, `-`, `_` and non-leading `.` pass through, so distinct ids
/// never share a file and no id names `.`, `..` or a hidden file.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, b) in id.bytes().enumerate() {
        match b {
            b'.' if i > 0 => out.push('.'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Inverse of [`encode_id`]; `None` for names it could not have produced.
fn decode_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoOnly {
    document_info: DocumentInfo,
}

#[async_trait]
impl CommandStateStore for FileStateStore {
    async fn persist_data(&self, key: &CommandKey, folder: Folder, record: &Value) -> Result<(), StoreError> {
        let path = self.record_path(key, folder);
        let dir = self.cmd_state_dir(&key.instance_id, folder);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialization {
            key: key.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_err(&dir, e))?;
        tmp.write_all(&bytes).map_err(|e| io_err(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| io_err(&path, e.error))?;
        debug!(%key, %folder, "persisted command record");
        Ok(())
    }

    async fn load_data(&self, key: &CommandKey, folder: Folder) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(key, folder);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    key: key.clone(),
                    source,
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn get_document_info(&self, key: &CommandKey, folder: Folder) -> Result<DocumentInfo, StoreError> {
        let path = self.record_path(key, folder);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::RecordNotFound { key: key.clone(), folder });
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_slice::<InfoOnly>(&bytes)
            .map(|r| r.document_info)
            .map_err(|source| StoreError::Serialization {
                key: key.clone(),
                source,
            })
    }

    async fn move_command_state(&self, key: &CommandKey, src: Folder, dst: Folder) -> Result<(), StoreError> {
        if src == dst {
            return match self.record_path(key, src).exists() {
                true => Ok(()),
                false => Err(StoreError::RecordNotFound { key: key.clone(), folder: src }),
            };
        }
        let from = self.record_path(key, src);
        let to = self.record_path(key, dst);
        let dst_dir = self.cmd_state_dir(&key.instance_id, dst);
        fs::create_dir_all(&dst_dir).map_err(|e| io_err(&dst_dir, e))?;

        match fs::rename(&from, &to) {
            Ok(()) => {
                debug!(%key, %src, %dst, "moved command record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::RecordNotFound { key: key.clone(), folder: src })
            }
            Err(e) => Err(io_err(&from, e)),
        }
    }

    async fn remove_data(&self, key: &CommandKey, folder: Folder) -> Result<(), StoreError> {
        let path = self.record_path(key, folder);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn list_commands(&self, instance_id: &str, folder: Folder) -> Result<Vec<String>, StoreError> {
        let dir = self.cmd_state_dir(instance_id, folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|stem| !stem.starts_with('.'))
                .and_then(decode_id)
            {
                Some(id) => ids.push(id),
                None => warn!(path = %path.display(), "skipping unexpected file in state dir"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn cmd_state_dir(&self, instance_id: &str, folder: Folder) -> PathBuf {
        self.root
            .join(encode_id(instance_id))
            .join("state")
            .join(folder.as_str())
    }

    fn name(&self) -> &'static str {
        "FileStateStore"
    }
}
