//! JSON file backend
//!
//! Keeps a mirror of all sessions and rewrites the whole file after each
//! change. Writes go to a temporary sibling first and are renamed into place.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::SessionBackend;
use crate::errors::{RelayError, Result};
use crate::types::{PickupCode, Session};

pub struct FileBackend {
    path: PathBuf,
    mirror: Mutex<HashMap<PickupCode, Session>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mirror: Mutex::new(HashMap::new()),
        }
    }

    async fn write_snapshot(&self, mirror: &HashMap<PickupCode, Session>) -> Result<()> {
        let mut sessions: Vec<&Session> = mirror.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let json = serde_json::to_vec_pretty(&sessions)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted {} sessions to {}", sessions.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn load(&self) -> Result<Vec<Session>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let sessions: Vec<Session> = serde_json::from_slice(&bytes).map_err(|e| {
            RelayError::storage(format!("corrupt session file {}: {}", self.path.display(), e))
        })?;

        let mut mirror = self.mirror.lock().await;
        mirror.clear();
        for session in &sessions {
            mirror.insert(session.code.clone(), session.clone());
        }
        Ok(sessions)
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        mirror.insert(session.code.clone(), session.clone());
        self.write_snapshot(&mirror).await
    }

    async fn remove(&self, code: &PickupCode) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        if mirror.remove(code).is_some() {
            self.write_snapshot(&mirror).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionId, FileInfo};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("sessions.json"));
        assert!(backend.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_remove_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let backend = FileBackend::new(&path);
        let mut first = Session::new(PickupCode::from("AAAA11"), ConnectionId::new());
        first.file_info = Some(FileInfo::new("a.txt", 11));
        let second = Session::new(PickupCode::from("BBBB22"), ConnectionId::new());
        backend.save(&first).await.unwrap();
        backend.save(&second).await.unwrap();
        backend.remove(&second.code).await.unwrap();

        let reopened = FileBackend::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, vec![first]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = FileBackend::new(&path).load().await.unwrap_err();
        assert!(matches!(err, RelayError::Storage { .. }));
    }
}
