use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Overall connectivity socket, separate from the per-tab terminal sockets.
/// Reconnects after a fixed delay whenever it closes or fails to connect;
/// the task stops when the link is dropped.
pub struct ConnectivityLink {
    state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl ConnectivityLink {
    pub fn spawn(url: impl Into<String>, retry_delay: Duration) -> Self {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        let task = tokio::spawn(run_link(url.into(), retry_delay, tx));
        Self { state: rx, task }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

impl Drop for ConnectivityLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_link(url: String, retry_delay: Duration, state: watch::Sender<LinkState>) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        state.send_replace(LinkState::Connecting);
        match connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                tracing::info!(url = %url, attempt, "Connectivity link up");
                attempt = 0;
                state.send_replace(LinkState::Connected);
                while let Some(message) = socket.next().await {
                    match message {
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            tracing::debug!(url = %url, error = %err, "Connectivity link error");
                            break;
                        }
                    }
                }
                tracing::info!(url = %url, "Connectivity link down");
            }
            Err(err) => {
                tracing::debug!(url = %url, attempt, error = %err, "Connectivity link connect failed");
            }
        }
        state.send_replace(LinkState::Disconnected);
        sleep(retry_delay).await;
    }
}
