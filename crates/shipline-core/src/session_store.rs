//! Filesystem checkpoints for in-flight sessions.
//!
//! Each session lives in `<dir>/<session_id>/session.json`, an envelope holding
//! the session and the SHA-256 of its canonical JSON. Writes go to a temp file
//! that is renamed into place, so a crash leaves either the old checkpoint or
//! the new one. Reads verify the digest and refuse a hand-edited checkpoint.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::capability::SessionStore;
use crate::domain::{LifecycleSession, Result, SessionId, ShiplineError};

const SESSION_FILE: &str = "session.json";
const TEMP_FILE: &str = "session.json.tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    digest: String,
    session: serde_json::Value,
}

fn digest_of(session: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_vec(session)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// [`SessionStore`] backed by a directory of digested JSON checkpoints.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
    dir: PathBuf,
}

impl FsSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_dir(&self, id: &SessionId) -> Result<PathBuf> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ShiplineError::SessionNotFound(raw.to_string()));
        }
        Ok(self.dir.join(raw))
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn save(&self, session: &LifecycleSession) -> Result<()> {
        let session_dir = self.session_dir(&session.id)?;
        tokio::fs::create_dir_all(&session_dir).await?;

        let session = serde_json::to_value(session)?;
        let checkpoint = Checkpoint {
            digest: digest_of(&session)?,
            session,
        };
        let json = serde_json::to_vec_pretty(&checkpoint)?;

        let temp_path = session_dir.join(TEMP_FILE);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, session_dir.join(SESSION_FILE)).await?;
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<LifecycleSession> {
        let session_dir = self.session_dir(id)?;
        let json = match tokio::fs::read(session_dir.join(SESSION_FILE)).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShiplineError::SessionNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&json)?;
        let actual = digest_of(&checkpoint.session)?;
        if checkpoint.digest != actual {
            return Err(ShiplineError::DigestMismatch {
                expected: checkpoint.digest,
                actual,
            });
        }
        Ok(serde_json::from_value(checkpoint.session)?)
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        let session_dir = self.session_dir(id)?;
        match tokio::fs::remove_dir_all(&session_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if !tokio::fs::try_exists(entry.path().join(SESSION_FILE)).await? {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(SessionId(name.to_string()));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ChangeSet, DeliveryRequest, RevisionId, SessionLimits, SessionState, WorkloadSelector,
    };

    fn session() -> LifecycleSession {
        LifecycleSession::new(
            DeliveryRequest {
                workspace: "ws-1".to_string(),
                change_set: ChangeSet::new("init").write("index.html", "<h1>hi</h1>"),
                selector: WorkloadSelector::new("app=web"),
                endpoint: "https://web.example.app".to_string(),
                domain: None,
            },
            SessionLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path());
        let mut session = session();
        session
            .advance(
                SessionState::Building {
                    revision: RevisionId::new("abc"),
                },
                "pushed",
            )
            .unwrap();

        store.save(&session).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded, session);
        assert!(!dir
            .path()
            .join(session.id.as_str())
            .join("session.json.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_torn_write_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path());
        let mut session = session();
        store.save(&session).await.unwrap();

        // A crash mid-save leaves a partial temp file next to the checkpoint.
        let session_dir = dir.path().join(session.id.as_str());
        std::fs::write(session_dir.join("session.json.tmp"), "{\"digest\":\"ab").unwrap();
        assert_eq!(store.load(&session.id).await.unwrap(), session);
        assert_eq!(store.list().await.unwrap(), vec![session.id.clone()]);

        // The next save replaces both the stale temp file and the checkpoint.
        session
            .advance(
                SessionState::Building {
                    revision: RevisionId::new("def"),
                },
                "pushed",
            )
            .unwrap();
        store.save(&session).await.unwrap();
        assert_eq!(store.load(&session.id).await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_tampered_checkpoint_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path());
        let session = session();
        store.save(&session).await.unwrap();

        let path = dir.path().join(session.id.as_str()).join("session.json");
        let mut json = std::fs::read_to_string(&path).unwrap();
        json = json.replace("ws-1", "ws-2");
        std::fs::write(&path, json).unwrap();

        let err = store.load(&session.id).await.unwrap_err();
        assert!(matches!(err, ShiplineError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path());
        let err = store.load(&SessionId::new()).await.unwrap_err();
        assert!(matches!(err, ShiplineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path());
        let err = store
            .load(&SessionId("../etc".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ShiplineError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path().join("sessions"));
        assert!(store.list().await.unwrap().is_empty());

        let a = session();
        let b = session();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        std::fs::write(dir.path().join("sessions/storefront.lock"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("sessions/locks")).unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        store.remove(&a.id).await.unwrap();
        store.remove(&a.id).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![b.id.clone()]);
    }
}
