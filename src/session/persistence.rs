//! Session resumption metadata.
//!
//! One JSON file per session under the store directory, written atomically.
//! Readable on cold start so sessions survive a proxy restart.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextData;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub session_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enable_pagination: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextData>,
    pub initialize_response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn save(&self, session: &PersistedSession) -> ProxyResult<()> {
        let path = self.path_for(&session.session_id)?;
        let content = serde_json::to_vec_pretty(session)
            .map_err(|e| ProxyError::PersistenceFailed(format!("serialize session: {e}")))?;

        let write: std::io::Result<()> = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &content).await?;
            let file = tokio::fs::File::open(&tmp).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        write.map_err(|e| {
            ProxyError::PersistenceFailed(format!("write {}: {e}", path.display()))
        })
    }

    pub async fn load(&self, session_id: &str) -> ProxyResult<Option<PersistedSession>> {
        let path = match self.path_for(session_id) {
            Ok(path) => path,
            // An unpersistable id can never have been stored.
            Err(_) => return Ok(None),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| ProxyError::PersistenceFailed(format!("parse session: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::PersistenceFailed(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Remove a session file. Missing files are fine.
    pub async fn delete(&self, session_id: &str) -> ProxyResult<bool> {
        let Ok(path) = self.path_for(session_id) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::PersistenceFailed(format!(
                "delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Session ids present on disk, for cold-start restoration.
    pub async fn list(&self) -> ProxyResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(ProxyError::PersistenceFailed(format!(
                    "read {}: {e}",
                    self.dir.display()
                )))
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ProxyError::PersistenceFailed(format!("read {}: {e}", self.dir.display()))
        })? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, session_id: &str) -> ProxyResult<PathBuf> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ProxyError::PersistenceFailed(format!(
                "session id '{session_id}' is not a persistable file name"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}
