mod bridge;
mod docker;

pub use bridge::bridge_socket;
pub use docker::DockerSpawner;

use crate::config::SessionConfig;
use crate::error::{ApiError, ErrorCode, RelayResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Connected,
    Closed,
    Error,
}

impl SessionStatus {
    fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Connected => 1,
            SessionStatus::Closed => 2,
            SessionStatus::Error => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Created,
            1 => SessionStatus::Connected,
            2 => SessionStatus::Closed,
            _ => SessionStatus::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }
}

/// How an attached process ended. `code` is `None` when the exit status could
/// not be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<u32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Informational text for a non-zero exit; `None` for a clean exit.
    pub fn notice(&self) -> Option<String> {
        match self.code {
            Some(0) => None,
            Some(code) => Some(format!(
                "\r\n\x1b[33mProcess exited with code {code}\x1b[0m\r\n"
            )),
            None => Some("\r\n\x1b[33mProcess exited\x1b[0m\r\n".to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ProcessEvent {
    Output(Bytes),
    /// Always the last event; no output follows it.
    Exited(ProcessExit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: String,
    pub container_id: String,
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

#[async_trait]
pub trait AttachedProcess: Send + Sync {
    async fn write(&self, data: &[u8]) -> RelayResult<usize>;
    async fn resize(&self, cols: u16, rows: u16) -> RelayResult<()>;
    async fn kill(&self) -> RelayResult<()>;
}

pub struct SpawnedProcess {
    pub process: Box<dyn AttachedProcess>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> RelayResult<SpawnedProcess>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

struct SessionInit {
    id: String,
    user_id: String,
    workspace_id: String,
    container_id: Option<String>,
    cols: u16,
    rows: u16,
}

pub struct Session {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    container_id: Mutex<Option<String>>,
    status: AtomicU8,
    cols: AtomicU16,
    rows: AtomicU16,
    process: Mutex<Option<Arc<dyn AttachedProcess>>>,
    created_at: u64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Session {
    fn new(init: SessionInit) -> Self {
        Self {
            id: init.id,
            user_id: init.user_id,
            workspace_id: init.workspace_id,
            container_id: Mutex::new(non_empty(init.container_id)),
            status: AtomicU8::new(SessionStatus::Created.as_u8()),
            cols: AtomicU16::new(init.cols.max(1)),
            rows: AtomicU16::new(init.rows.max(1)),
            process: Mutex::new(None),
            created_at: now_ms(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Atomically move from `from` to `to`; false if the session was not in `from`.
    fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enter a terminal status unless one was already reached.
    fn finish(&self, status: SessionStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if SessionStatus::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(status.as_u8())
                }
            });
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id
            .lock()
            .expect("container mutex poisoned")
            .clone()
    }

    /// A container can only be (re)bound before the process is spawned.
    fn assign_container(&self, container_id: &str) {
        if container_id.trim().is_empty() || self.status() != SessionStatus::Created {
            return;
        }
        let mut guard = self.container_id.lock().expect("container mutex poisoned");
        *guard = Some(container_id.to_string());
    }

    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::SeqCst),
            self.rows.load(Ordering::SeqCst),
        )
    }

    pub fn has_process(&self) -> bool {
        self.process
            .lock()
            .expect("process mutex poisoned")
            .is_some()
    }

    fn process_handle(&self) -> Option<Arc<dyn AttachedProcess>> {
        self.process.lock().expect("process mutex poisoned").clone()
    }

    /// Returns false (and leaves the slot empty) if the session was torn down
    /// while the process was starting.
    fn install_process(&self, process: Arc<dyn AttachedProcess>) -> bool {
        let mut slot = self.process.lock().expect("process mutex poisoned");
        if self.status() != SessionStatus::Connected {
            return false;
        }
        *slot = Some(process);
        true
    }

    pub async fn write(&self, data: &[u8]) -> RelayResult<usize> {
        let process = self
            .process_handle()
            .ok_or_else(|| ApiError::new(ErrorCode::ProcessExit, "Process is not running"))?;
        let written = process.write(data).await?;
        self.bytes_out.fetch_add(written as u64, Ordering::SeqCst);
        Ok(written)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        let cols = cols.max(1);
        let rows = rows.max(1);
        self.cols.store(cols, Ordering::SeqCst);
        self.rows.store(rows, Ordering::SeqCst);
        if let Some(process) = self.process_handle() {
            process.resize(cols, rows).await?;
        }
        Ok(())
    }

    pub fn record_output(&self, len: usize) {
        self.bytes_in.fetch_add(len as u64, Ordering::SeqCst);
    }

    /// Kill and drop the attached process. Returns whether one was running.
    async fn terminate(&self) -> bool {
        let process = self.process.lock().expect("process mutex poisoned").take();
        match process {
            Some(process) => {
                if let Err(err) = process.kill().await {
                    tracing::debug!(session_id = %self.id, error = %err, "Kill failed; process likely gone");
                }
                true
            }
            None => false,
        }
    }

    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        SessionInfo {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
            container_id: self.container_id(),
            status: self.status(),
            cols,
            rows,
            created_at: self.created_at,
            bytes_in: self.bytes_in.load(Ordering::SeqCst),
            bytes_out: self.bytes_out.load(Ordering::SeqCst),
        }
    }
}

/// A connected session together with the stream of its process events.
pub struct Attachment {
    pub session: Arc<Session>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: SessionConfig,
    spawner: Arc<dyn ProcessSpawner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, spawner: Arc<dyn ProcessSpawner>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            spawner,
        })
    }

    pub fn with_docker(config: SessionConfig) -> Arc<Self> {
        let spawner = Arc::new(DockerSpawner::new(config.clone()));
        Self::new(config, spawner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Explicit creation from the management API, under a fresh id.
    pub async fn create_session(&self, request: CreateSessionRequest) -> RelayResult<Arc<Session>> {
        if request.user_id.trim().is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "userId is required").into());
        }
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(SessionInit {
            id: id.clone(),
            user_id: request.user_id,
            workspace_id: request
                .workspace_id
                .unwrap_or_else(|| self.config.default_workspace_id.clone()),
            container_id: request.container_id,
            cols: request.cols.unwrap_or(self.config.default_cols),
            rows: request.rows.unwrap_or(self.config.default_rows),
        }));

        let mut sessions = self.sessions.write().await;
        self.ensure_capacity(sessions.len())?;
        sessions.insert(id.clone(), session.clone());
        tracing::info!(session_id = %id, user_id = %session.user_id, "Session created");
        Ok(session)
    }

    /// Look up `session_id`, synthesizing a `created` session under the default
    /// identity if none exists. Insert-if-absent under one write lock.
    pub async fn resolve_or_create(
        &self,
        session_id: &str,
        container_id: Option<&str>,
    ) -> RelayResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        match sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                if let Some(container_id) = container_id {
                    session.assign_container(container_id);
                }
                Ok(session)
            }
            Entry::Vacant(entry) => {
                self.ensure_capacity(count)?;
                tracing::info!(
                    session_id = %session_id,
                    container_id = ?container_id,
                    "Auto-creating session on first connection"
                );
                let session = Arc::new(Session::new(SessionInit {
                    id: session_id.to_string(),
                    user_id: self.config.default_user_id.clone(),
                    workspace_id: self.config.default_workspace_id.clone(),
                    container_id: container_id.map(str::to_string),
                    cols: self.config.default_cols,
                    rows: self.config.default_rows,
                }));
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Resolve the session, claim it and spawn its process.
    ///
    /// Exactly one caller can win the `created -> connected` claim for a given
    /// session, so concurrent connections never spawn twice.
    pub async fn open_attachment(
        &self,
        session_id: &str,
        container_id: Option<&str>,
    ) -> RelayResult<Attachment> {
        let session = self.resolve_or_create(session_id, container_id).await?;

        let Some(container_id) = session.container_id() else {
            if session.transition(SessionStatus::Created, SessionStatus::Error) {
                self.remove(&session).await;
            }
            tracing::error!(session_id = %session_id, "No container id for session");
            return Err(ApiError::new(ErrorCode::NoTargetContainer, "No container specified").into());
        };

        if !session.transition(SessionStatus::Created, SessionStatus::Connected) {
            return Err(ApiError::new(
                ErrorCode::SessionBusy,
                format!("Session {session_id} is already attached"),
            )
            .into());
        }

        let (cols, rows) = session.size();
        let request = SpawnRequest {
            session_id: session_id.to_string(),
            container_id: container_id.clone(),
            command: startup_command(&self.config, session_id),
            cols,
            rows,
        };
        tracing::info!(
            session_id = %session_id,
            container_id = %container_id,
            command = ?request.command,
            "Spawning attached process"
        );

        let spawned = match self.spawner.spawn(request).await {
            Ok(spawned) => spawned,
            Err(err) => {
                self.release(&session, SessionStatus::Error).await;
                let detail = match err.into_api() {
                    ApiError {
                        message,
                        details: Some(details),
                        ..
                    } => format!("{message}: {details}"),
                    api => api.message,
                };
                tracing::error!(session_id = %session_id, error = %detail, "Failed to start terminal");
                return Err(ApiError::new(ErrorCode::SpawnFailure, "Failed to start terminal")
                    .with_details(detail)
                    .into());
            }
        };

        let process: Arc<dyn AttachedProcess> = Arc::from(spawned.process);
        if !session.install_process(process.clone()) {
            let _ = process.kill().await;
            self.remove(&session).await;
            return Err(ApiError::new(ErrorCode::ProcessExit, "Session closed during startup").into());
        }

        Ok(Attachment {
            session,
            events: spawned.events,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> RelayResult<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "Session not found").into())
    }

    pub async fn list_sessions(&self, user_id: Option<&str>) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<SessionInfo> = sessions
            .values()
            .filter(|session| user_id.is_none_or(|user_id| session.user_id == user_id))
            .map(|session| session.info())
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        entries
    }

    /// Management kill: the process dies and the record goes with it. The
    /// bridge notices the exit and closes the socket.
    pub async fn kill_session(&self, session_id: &str) -> RelayResult<()> {
        let session = self.get_session(session_id).await?;
        self.release(&session, SessionStatus::Closed).await;
        tracing::info!(session_id = %session_id, "Session killed");
        Ok(())
    }

    /// Tear a session down: enter a terminal status, kill the process if it is
    /// still running and drop the registry entry.
    pub async fn release(&self, session: &Arc<Session>, status: SessionStatus) {
        session.finish(status);
        let killed = session.terminate().await;
        self.remove(session).await;
        tracing::debug!(session_id = %session.id, killed, status = ?session.status(), "Session released");
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Kill every process and drain the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.finish(SessionStatus::Closed);
            session.terminate().await;
        }
    }

    /// Removes the entry only if it still refers to this very session.
    async fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&session.id)
            && Arc::ptr_eq(current, session)
        {
            sessions.remove(&session.id);
        }
    }

    fn ensure_capacity(&self, count: usize) -> RelayResult<()> {
        if self.config.max_sessions > 0 && count >= self.config.max_sessions {
            return Err(ApiError::new(ErrorCode::TooManySessions, "Too many sessions").into());
        }
        Ok(())
    }
}

/// Command run inside the container for `session_id`.
///
/// The main session streams the dev-server log first when it exists; Ctrl-C
/// (or a missing log) drops into the interactive shell. Every other session
/// gets the shell directly.
pub fn startup_command(config: &SessionConfig, session_id: &str) -> Vec<String> {
    if session_id != config.main_session_id {
        return vec![config.shell.clone()];
    }
    let log = shell_quote(&config.main_log_path);
    let script = format!(
        "if [ -f {log} ]; then \
         printf '\\r\\n\\033[38;5;39m●\\033[0m \\033[1mDevelopment Server Active\\033[0m\\r\\n'; \
         printf '\\033[90m  Streaming logs. Press Ctrl+C to use terminal.\\033[0m\\r\\n\\r\\n'; \
         trap : INT; tail -f {log}; trap - INT; \
         fi; exec {shell}",
        shell = shell_quote(&config.shell),
    );
    vec![config.shell.clone(), "-c".to_string(), script]
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'_' | b'-'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
