use crate::config::SessionConfig;
use crate::error::{ApiError, ErrorCode, RelayResult};
use crate::session::{
    AttachedProcess, ProcessEvent, ProcessExit, ProcessSpawner, SpawnRequest, SpawnedProcess,
};
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

/// Runs each session's command inside its container via `docker exec -it`,
/// on a local PTY so the container side sees a real terminal.
pub struct DockerSpawner {
    config: SessionConfig,
}

impl DockerSpawner {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessSpawner for DockerSpawner {
    async fn spawn(&self, request: SpawnRequest) -> RelayResult<SpawnedProcess> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                ApiError::new(ErrorCode::SpawnFailure, "Failed to allocate PTY")
                    .with_details(err.to_string())
            })?;

        let mut cmd = CommandBuilder::new(&self.config.docker_path);
        cmd.env("TERM", &self.config.term);
        cmd.args(exec_args(&self.config, &request));

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            ApiError::new(ErrorCode::SpawnFailure, "Failed to spawn docker exec")
                .with_details(err.to_string())
        })?;
        // Keeping the slave open would hide EOF once the child exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to clone PTY reader")
                .with_details(err.to_string())
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to take PTY writer")
                .with_details(err.to_string())
        })?;
        let killer = child.clone_killer();

        let (tx, rx) = mpsc::channel(self.config.output_channel_capacity.max(1));
        let session_id = request.session_id.clone();
        thread::Builder::new()
            .name(format!("pty-{session_id}"))
            .spawn(move || pump_output(&session_id, reader, child, tx))?;

        tracing::debug!(
            session_id = %request.session_id,
            container_id = %request.container_id,
            "docker exec started"
        );

        Ok(SpawnedProcess {
            process: Box::new(DockerProcess {
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(Mutex::new(pair.master)),
                killer: Arc::new(Mutex::new(killer)),
            }),
            events: rx,
        })
    }
}

/// Reads the PTY until EOF, then reaps the child. `Exited` is always the
/// final event, after every output chunk.
fn pump_output(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if tx.blocking_send(ProcessEvent::Output(chunk)).is_err() {
                    break;
                }
            }
            // Linux reports EIO on the master once the slave side is gone.
            Err(err) => {
                tracing::debug!(session_id = %session_id, error = %err, "PTY read ended");
                break;
            }
        }
    }

    let exit = match child.wait() {
        Ok(status) => ProcessExit {
            code: Some(status.exit_code()),
        },
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "Failed to reap docker exec");
            ProcessExit { code: None }
        }
    };
    tracing::debug!(session_id = %session_id, code = ?exit.code, "docker exec exited");
    let _ = tx.blocking_send(ProcessEvent::Exited(exit));
}

struct DockerProcess {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
}

#[async_trait]
impl AttachedProcess for DockerProcess {
    async fn write(&self, data: &[u8]) -> RelayResult<usize> {
        let data = data.to_vec();
        let writer = self.writer.clone();

        tokio::task::spawn_blocking(move || -> RelayResult<usize> {
            let mut writer = writer.lock().expect("writer mutex poisoned");
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to write to process")
                        .with_details(err.to_string())
                })?;
            Ok(data.len())
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join write").with_details(err.to_string())
        })?
    }

    async fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        let master = self.master.clone();

        tokio::task::spawn_blocking(move || -> RelayResult<()> {
            let master = master.lock().expect("master mutex poisoned");
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to resize PTY")
                        .with_details(err.to_string())
                        .into()
                })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join resize").with_details(err.to_string())
        })?
    }

    async fn kill(&self) -> RelayResult<()> {
        let killer = self.killer.clone();

        tokio::task::spawn_blocking(move || -> RelayResult<()> {
            let mut killer = killer.lock().expect("killer mutex poisoned");
            killer.kill().map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to kill docker exec")
                    .with_details(err.to_string())
                    .into()
            })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join kill").with_details(err.to_string())
        })?
    }
}

/// Arguments after the docker binary:
/// `exec -it -w <dir> -e TERM=.. -e COLORTERM=.. <container> <command..>`.
fn exec_args(config: &SessionConfig, request: &SpawnRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-it".to_string()];
    if !config.working_dir.is_empty() {
        args.push("-w".to_string());
        args.push(config.working_dir.clone());
    }
    args.push("-e".to_string());
    args.push(format!("TERM={}", config.term));
    if !config.colorterm.is_empty() {
        args.push("-e".to_string());
        args.push(format!("COLORTERM={}", config.colorterm));
    }
    args.push(request.container_id.clone());
    args.extend(request.command.iter().cloned());
    args
}
