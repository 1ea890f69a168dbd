//! Session persistence (spec.md §3, §4.2 supplement): durable record of a
//! session's configuration and last-known dynamic state, so the control
//! plane can report sessions across a server restart. No output bytes are
//! persisted — only enough to reconstruct identity and last state.
//!
//! Atomic write-then-rename: write to a sibling temp file, then rename,
//! so a crash mid-write never leaves a half-written record behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::session::SessionId;

/// The durable subset of a session's state (spec.md §3's config plus the
/// dynamic fields worth remembering across a restart).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: SessionId,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
    pub tunnel: HashMap<String, String>,
    pub created_at: u64,
    pub last_modified: u64,
    /// `true` if the PTY had exited as of the last write.
    pub exited: bool,
}

/// Atomic, file-per-session JSON store under `PERSIST_DIR/{id}.json`.
pub struct PersistenceStore {
    dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write a session record atomically: serialize to a temp file in the
    /// same directory, then rename over the final path.
    pub fn save(&self, record: &PersistedSession) -> Result<()> {
        let final_path = self.path_for(record.id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", record.id));
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| CoreError::ConfigError(format!("failed to serialize session: {e}")))?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn remove(&self, id: SessionId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every persisted session record found in the directory. Entries
    /// that fail to parse are skipped (logged by the caller), not fatal.
    pub fn load_all(&self) -> Result<Vec<PersistedSession>> {
        load_all_from(&self.dir)
    }
}

fn load_all_from(dir: &Path) -> Result<Vec<PersistedSession>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let body = std::fs::read(&path)?;
        if let Ok(record) = serde_json::from_slice::<PersistedSession>(&body) {
            out.push(record);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: SessionId) -> PersistedSession {
        PersistedSession {
            id,
            command: vec!["/bin/sh".to_string()],
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            title: None,
            tunnel: HashMap::new(),
            created_at: 0,
            last_modified: 0,
            exited: false,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path()).unwrap();
        let id = SessionId::new();
        store.save(&sample(id)).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, id);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path()).unwrap();
        let id = SessionId::new();
        store.remove(id).unwrap();
        store.save(&sample(id)).unwrap();
        store.remove(id).unwrap();
        store.remove(id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_entry_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"not json").unwrap();
        let store = PersistenceStore::new(dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
