#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use termrelay::config::SessionConfig;
use termrelay::error::{ApiError, ErrorCode, RelayResult};
use termrelay::router::{EdgeState, edge_router};
use termrelay::server::{ServiceState, service_router};
use termrelay::session::{
    AttachedProcess, ProcessEvent, ProcessExit, ProcessSpawner, SessionManager, SpawnRequest,
    SpawnedProcess,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stand-in for a container shell: echoes input, exits with code 3 on
/// `exit\n` and with code 0 on a trailing Ctrl-D, and reports exit 137 when
/// killed.
pub struct EchoProcess {
    tx: Mutex<Option<mpsc::Sender<ProcessEvent>>>,
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub killed: AtomicBool,
}

impl EchoProcess {
    pub fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::Sender<ProcessEvent>> {
        self.tx.lock().unwrap().clone()
    }
}

struct Handle(Arc<EchoProcess>);

#[async_trait]
impl AttachedProcess for Handle {
    async fn write(&self, data: &[u8]) -> RelayResult<usize> {
        self.0.input.lock().unwrap().extend_from_slice(data);
        let exit_code = if data == b"exit\n" {
            Some(3)
        } else if data.ends_with(b"\x04") {
            Some(0)
        } else {
            None
        };
        if let Some(code) = exit_code {
            let tx = self.0.tx.lock().unwrap().take();
            if let Some(tx) = tx {
                let _ = tx
                    .send(ProcessEvent::Exited(ProcessExit { code: Some(code) }))
                    .await;
            }
            return Ok(data.len());
        }
        if let Some(tx) = self.0.sender() {
            let _ = tx
                .send(ProcessEvent::Output(Bytes::copy_from_slice(data)))
                .await;
        }
        Ok(data.len())
    }

    async fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        self.0.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn kill(&self) -> RelayResult<()> {
        self.0.killed.store(true, Ordering::SeqCst);
        let tx = self.0.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.try_send(ProcessEvent::Exited(ProcessExit { code: Some(137) }));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct EchoSpawner {
    pub requests: Mutex<Vec<SpawnRequest>>,
    pub processes: Mutex<Vec<Arc<EchoProcess>>>,
    /// Spawning into this container fails.
    pub broken_container: Option<String>,
}

impl EchoSpawner {
    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn process(&self, index: usize) -> Arc<EchoProcess> {
        self.processes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ProcessSpawner for EchoSpawner {
    async fn spawn(&self, request: SpawnRequest) -> RelayResult<SpawnedProcess> {
        if self.broken_container.as_deref() == Some(request.container_id.as_str()) {
            return Err(ApiError::new(ErrorCode::IoError, "container is not running").into());
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(ProcessEvent::Output(Bytes::from(format!(
            "attached {}\r\n",
            request.container_id
        ))));
        let process = Arc::new(EchoProcess {
            tx: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
        });
        self.requests.lock().unwrap().push(request);
        self.processes.lock().unwrap().push(process.clone());
        Ok(SpawnedProcess {
            process: Box::new(Handle(process)),
            events: rx,
        })
    }
}

pub struct Service {
    pub addr: SocketAddr,
    pub manager: Arc<SessionManager>,
    pub spawner: Arc<EchoSpawner>,
}

impl Service {
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

pub async fn start_service(spawner: EchoSpawner) -> Service {
    let spawner = Arc::new(spawner);
    let manager = SessionManager::new(SessionConfig::default(), spawner.clone());
    let state = ServiceState {
        manager: manager.clone(),
        public_ws_base: "ws://localhost:3006".to_string(),
    };
    let addr = serve(service_router(state)).await;
    Service {
        addr,
        manager,
        spawner,
    }
}

/// A `docker` stand-in: a shell script that ignores its arguments and runs
/// `body` on the PTY. Keep the directory alive for the test's duration.
pub fn fake_docker(body: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("docker");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    (dir, path.to_string_lossy().into_owned())
}

/// Session service backed by the real PTY spawner, pointed at `docker_path`.
pub async fn start_pty_service(docker_path: &str) -> (SocketAddr, Arc<SessionManager>) {
    let config = SessionConfig {
        docker_path: docker_path.to_string(),
        ..SessionConfig::default()
    };
    let manager = SessionManager::with_docker(config);
    let state = ServiceState {
        manager: manager.clone(),
        public_ws_base: "ws://localhost:3006".to_string(),
    };
    (serve(service_router(state)).await, manager)
}

pub async fn start_edge(upstream: String) -> SocketAddr {
    serve(edge_router(EdgeState::new(upstream))).await
}

async fn serve(router: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

pub async fn connect(url: &str) -> Client {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");
    socket
}

/// Next data or close frame; pings and pongs are skipped.
pub async fn next_message(socket: &mut Client) -> Option<Message> {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")?;
        match message {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(message) => return Some(message),
            Err(_) => return None,
        }
    }
}

pub fn payload(message: &Message) -> Vec<u8> {
    match message {
        Message::Text(text) => text.as_bytes().to_vec(),
        Message::Binary(data) => data.clone(),
        other => panic!("expected a data frame, got {other:?}"),
    }
}

pub fn close_code(message: &Message) -> Option<u16> {
    match message {
        Message::Close(Some(frame)) => Some(u16::from(frame.code)),
        _ => None,
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_until_empty(manager: &SessionManager) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.is_empty().await {
        assert!(Instant::now() < deadline, "registry never drained");
        sleep(Duration::from_millis(10)).await;
    }
}
