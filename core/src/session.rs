//! Session manager (spec.md §4.2): owns the registry of live sessions, each
//! one pairing a PTY with its `Fanout`, keyed by `SessionId` in a
//! `DashMap`. Builds on the arbitrary `SessionConfig` in spec.md §3 and
//! adds session limits, lazy-spawn-on-attach, and persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell, RwLock};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::fanout::Fanout;
use crate::persist::{PersistedSession, PersistenceStore};
use crate::pty::{self, PtyConfig, PtyHandle, PtyRunState};

/// Unique session identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable creation-time configuration for a session (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub title: Option<String>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: vec!["bash".to_string(), "-l".to_string()],
            cwd: None,
            env: HashMap::new(),
            cols: default_cols(),
            rows: default_rows(),
            title: None,
        }
    }
}

/// A point-in-time summary of a session's dynamic state (spec.md §3), for
/// use in list/get API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub config: SessionConfigView,
    pub state: SessionState,
    pub tunnel: HashMap<String, String>,
    pub created_at: u64,
    pub last_modified: u64,
}

/// `SessionConfig` without the process environment, which should not be
/// echoed back over the API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfigView {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Exited,
}

/// Fixed-capacity circular scrollback buffer. Feeds the "recent output
/// window" named in spec.md §3 so new subscribers can be given recent
/// context without replaying the whole session.
pub struct RecentOutputWindow {
    data: std::sync::Mutex<Vec<u8>>,
    cap: usize,
}

impl RecentOutputWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            data: std::sync::Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut g = self.data.lock().expect("recent output window mutex");
        g.extend_from_slice(bytes);
        if g.len() > self.cap {
            let excess = g.len() - self.cap;
            g.drain(..excess);
        }
    }

    pub fn dump(&self) -> Vec<u8> {
        self.data.lock().expect("recent output window mutex").clone()
    }
}

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything the manager tracks for one session. The PTY handle is behind a
/// lazily-initialized cell (spec.md §4.2 "lazy spawn on first attach").
pub struct SessionContext {
    pub config: SessionConfig,
    pty: OnceCell<PtyHandle>,
    pub fanout: Arc<Fanout>,
    pub recent_output: Arc<RecentOutputWindow>,
    pub state: RwLock<SessionState>,
    pub tunnel: std::sync::Mutex<HashMap<String, String>>,
    pub created_at: u64,
    last_modified: AtomicU64,
}

impl SessionContext {
    pub fn touch(&self) {
        self.last_modified.store(unix_now_secs(), Ordering::Relaxed);
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified.load(Ordering::Relaxed)
    }

    pub async fn summary(&self, id: SessionId) -> SessionSummary {
        SessionSummary {
            id,
            config: SessionConfigView {
                command: self.config.command.clone(),
                cwd: self.config.cwd.clone(),
                cols: self.config.cols,
                rows: self.config.rows,
                title: self.config.title.clone(),
            },
            state: *self.state.read().await,
            tunnel: self.tunnel.lock().expect("tunnel mutex").clone(),
            created_at: self.created_at,
            last_modified: self.last_modified(),
        }
    }
}

pub type Registry = Arc<DashMap<SessionId, Arc<SessionContext>>>;

/// Reap sessions whose PTY exited at least this long ago.
const REAP_GRACE_SECS: u64 = 600;

/// Owns the session registry plus the optional session limit and
/// persistence store (spec.md §4.2 supplement).
pub struct SessionManager {
    registry: Registry,
    session_limit: Option<usize>,
    persistence: Option<Arc<PersistenceStore>>,
    recent_output_window_bytes: usize,
}

impl SessionManager {
    pub fn new(
        session_limit: Option<usize>,
        persistence: Option<Arc<PersistenceStore>>,
        recent_output_window_bytes: usize,
    ) -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            session_limit,
            persistence,
            recent_output_window_bytes,
        }
    }

    pub fn registry(&self) -> Registry {
        Arc::clone(&self.registry)
    }

    /// Restore session records left over from a previous run. Their PTYs are
    /// gone; they are recorded as exited and kept only so the API can report
    /// them until `cleanup_exited` reaps them.
    pub fn restore_from_disk(&self) -> Result<()> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        for record in store.load_all()? {
            let ctx = Arc::new(SessionContext {
                config: SessionConfig {
                    command: record.command,
                    cwd: record.cwd,
                    env: record.env,
                    cols: record.cols,
                    rows: record.rows,
                    title: record.title,
                },
                pty: OnceCell::new(),
                fanout: Fanout::new(record.cols, record.rows),
                recent_output: Arc::new(RecentOutputWindow::new(self.recent_output_window_bytes)),
                state: RwLock::new(SessionState::Exited),
                tunnel: std::sync::Mutex::new(record.tunnel),
                created_at: record.created_at,
                last_modified: AtomicU64::new(record.last_modified),
            });
            self.registry.insert(record.id, ctx);
        }
        info!(count = self.registry.len(), "restored sessions from disk");
        Ok(())
    }

    /// Create a new session and spawn its PTY immediately (spec.md §4.2:
    /// eager spawn is the creation-time default; lazy spawn is available
    /// through `attach_subscriber` for a session created without one).
    pub async fn create(&self, config: SessionConfig) -> Result<SessionId> {
        if let Some(limit) = self.session_limit {
            if self.registry.len() >= limit {
                return Err(CoreError::ResourceExhausted(format!(
                    "session limit of {limit} reached"
                )));
            }
        }
        let id = SessionId::new();
        let ctx = Arc::new(SessionContext {
            fanout: Fanout::new(config.cols, config.rows),
            recent_output: Arc::new(RecentOutputWindow::new(self.recent_output_window_bytes)),
            pty: OnceCell::new(),
            state: RwLock::new(SessionState::Pending),
            tunnel: std::sync::Mutex::new(HashMap::new()),
            created_at: unix_now_secs(),
            last_modified: AtomicU64::new(unix_now_secs()),
            config,
        });
        self.registry.insert(id, Arc::clone(&ctx));
        self.spawn_into(id, &ctx).await?;
        self.persist(id, &ctx);
        Ok(id)
    }

    /// Ensure the session's PTY is running, spawning it on first use if it
    /// was created without one (or restored from disk). At most one spawn
    /// happens even if many subscribers attach concurrently, via `OnceCell`.
    async fn spawn_into(&self, id: SessionId, ctx: &Arc<SessionContext>) -> Result<()> {
        let pty_config = PtyConfig {
            command: ctx.config.command.clone(),
            cwd: ctx.config.cwd.clone(),
            env: ctx.config.env.clone(),
            cols: ctx.config.cols,
            rows: ctx.config.rows,
        };
        let ctx_for_init = Arc::clone(ctx);
        let handle = ctx
            .pty
            .get_or_try_init(|| async move {
                let (handle, out_rx, state_rx) = pty::spawn(pty_config)?;
                spawn_output_pump(id, Arc::clone(&ctx_for_init), out_rx);
                spawn_state_pump(id, Arc::clone(&ctx_for_init), state_rx);
                Ok::<_, CoreError>(handle)
            })
            .await?;
        let _ = handle;
        *ctx.state.write().await = SessionState::Running;
        Ok(())
    }

    fn persist(&self, id: SessionId, ctx: &SessionContext) {
        let Some(store) = &self.persistence else {
            return;
        };
        let record = PersistedSession {
            id,
            command: ctx.config.command.clone(),
            cwd: ctx.config.cwd.clone(),
            env: ctx.config.env.clone(),
            cols: ctx.config.cols,
            rows: ctx.config.rows,
            title: ctx.config.title.clone(),
            tunnel: ctx.tunnel.lock().expect("tunnel mutex").clone(),
            created_at: ctx.created_at,
            last_modified: ctx.last_modified(),
            exited: false,
        };
        if let Err(e) = store.save(&record) {
            warn!(session = %id, error = %e, "failed to persist session");
        }
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<SessionContext>> {
        self.registry
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut out = Vec::with_capacity(self.registry.len());
        for entry in self.registry.iter() {
            out.push(entry.value().summary(*entry.key()).await);
        }
        out
    }

    pub async fn write_input(&self, id: SessionId, bytes: Vec<u8>) -> Result<()> {
        let ctx = self.get(id)?;
        if *ctx.state.read().await == SessionState::Exited {
            return Err(CoreError::Conflict(format!("session {id} has exited")));
        }
        self.spawn_into(id, &ctx).await?;
        ctx.touch();
        ctx.pty
            .get()
            .expect("spawn_into guarantees pty is initialized")
            .write_input(bytes)
    }

    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        let ctx = self.get(id)?;
        if *ctx.state.read().await == SessionState::Exited {
            return Err(CoreError::Conflict(format!("session {id} has exited")));
        }
        self.spawn_into(id, &ctx).await?;
        ctx.touch();
        ctx.pty
            .get()
            .expect("spawn_into guarantees pty is initialized")
            .resize(cols, rows)?;
        ctx.fanout
            .publish_resize(unix_now_secs() as f64, cols, rows)
            .await;
        Ok(())
    }

    pub fn set_tunnel_metadata(&self, id: SessionId, metadata: HashMap<String, String>) -> Result<()> {
        let ctx = self.get(id)?;
        *ctx.tunnel.lock().expect("tunnel mutex") = metadata;
        ctx.touch();
        Ok(())
    }

    pub fn delete(&self, id: SessionId) -> Result<()> {
        let (_, ctx) = self
            .registry
            .remove(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if let Some(handle) = ctx.pty.get() {
            let _ = handle.close();
        }
        if let Some(store) = &self.persistence {
            let _ = store.remove(id);
        }
        Ok(())
    }

    /// Reap sessions that exited more than `REAP_GRACE_SECS` ago.
    pub async fn cleanup_exited(&self) {
        let mut to_remove = Vec::new();
        for entry in self.registry.iter() {
            let state = *entry.value().state.read().await;
            if state == SessionState::Exited
                && unix_now_secs().saturating_sub(entry.value().last_modified()) > REAP_GRACE_SECS
            {
                to_remove.push(*entry.key());
            }
        }
        for id in to_remove {
            info!(session = %id, "reaping exited session");
            let _ = self.delete(id);
        }
    }
}

fn spawn_output_pump(id: SessionId, ctx: Arc<SessionContext>, mut out_rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        tracing::trace!(session = %id, "output pump started");
        while let Some(chunk) = out_rx.recv().await {
            ctx.recent_output.push(&chunk);
            ctx.touch();
            ctx.fanout
                .publish_output(unix_now_secs() as f64, &chunk)
                .await;
        }
    });
}

fn spawn_state_pump(
    id: SessionId,
    ctx: Arc<SessionContext>,
    mut state_rx: mpsc::Receiver<PtyRunState>,
) {
    tokio::spawn(async move {
        while let Some(state) = state_rx.recv().await {
            match state {
                PtyRunState::Running => {
                    *ctx.state.write().await = SessionState::Running;
                }
                PtyRunState::Exited { exit_code } => {
                    *ctx.state.write().await = SessionState::Exited;
                    ctx.touch();
                    ctx.fanout
                        .publish_exit(exit_code as i32, &id.to_string())
                        .await;
                    info!(session = %id, exit_code, "session exited");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(None, None, 1024 * 1024)
    }

    #[tokio::test]
    async fn create_spawns_and_lists_session() {
        let mgr = manager();
        let id = mgr
            .create(SessionConfig {
                command: vec!["/bin/echo".to_string(), "hi".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        let list = mgr.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let mgr = SessionManager::new(Some(1), None, 1024);
        mgr.create(SessionConfig {
            command: vec!["/bin/sh".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
        let result = mgr
            .create(SessionConfig {
                command: vec!["/bin/sh".to_string()],
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(CoreError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn delete_removes_from_registry() {
        let mgr = manager();
        let id = mgr
            .create(SessionConfig {
                command: vec!["/bin/sh".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        mgr.delete(id).unwrap();
        assert!(mgr.get(id).is_err());
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let mgr = manager();
        let result = mgr.get(SessionId::new());
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn write_input_reaches_exited_echo_session() {
        let mgr = manager();
        let id = mgr
            .create(SessionConfig {
                command: vec!["/bin/cat".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        let ctx = mgr.get(id).unwrap();
        let (_sub_id, mut rx) = ctx.fanout.attach_text().await;
        mgr.write_input(id, b"hello\n".to_vec()).await.unwrap();

        let mut saw_hello = false;
        for _ in 0..20 {
            if let Ok(Some(record)) =
                tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await
            {
                if let crate::wire::TextRecord::Output { data, .. } = record {
                    if String::from_utf8_lossy(&data).contains("hello") {
                        saw_hello = true;
                        break;
                    }
                }
            }
        }
        assert!(saw_hello);
    }

    #[tokio::test]
    async fn write_input_to_exited_session_is_conflict() {
        let mgr = manager();
        let id = mgr
            .create(SessionConfig {
                command: vec!["/bin/true".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        let ctx = mgr.get(id).unwrap();
        // Wait for /bin/true to exit and the state pump to observe it.
        for _ in 0..50 {
            if *ctx.state.read().await == SessionState::Exited {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(*ctx.state.read().await, SessionState::Exited);

        let result = mgr.write_input(id, b"hi\n".to_vec()).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        let result = mgr.resize(id, 100, 40).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }
}
