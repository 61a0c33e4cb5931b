use crate::control::{ControlFrame, parse_control_frame};
use crate::error::{ApiError, ErrorCode};
use crate::session::{Attachment, ProcessEvent, Session, SessionManager, SessionStatus};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Teardown {
    ProcessExited,
    SocketClosed,
}

/// Serve one terminal connection: claim the session, then shuttle bytes both
/// ways until either end goes away. The process never outlives the socket and
/// the socket never outlives the process.
pub async fn bridge_socket(
    socket: WebSocket,
    manager: Arc<SessionManager>,
    session_id: String,
    container_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Attachment {
        session,
        mut events,
    } = match manager
        .open_attachment(&session_id, container_id.as_deref())
        .await
    {
        Ok(attachment) => attachment,
        Err(err) => {
            let api = err.into_api();
            tracing::warn!(session_id = %session_id, error = %api, "Rejecting terminal connection");
            reject(&mut ws_tx, &api).await;
            return;
        }
    };
    tracing::info!(
        session_id = %session_id,
        container_id = ?session.container_id(),
        "Terminal connected"
    );

    // Input is written by its own task in arrival order. This loop has to keep
    // draining output and watching the socket while a PTY write is blocked.
    let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(write_input(session.clone(), input_rx));

    let teardown = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ProcessEvent::Output(chunk)) => {
                    session.record_output(chunk.len());
                    if let Err(err) = ws_tx.send(Message::Binary(chunk.to_vec())).await {
                        tracing::debug!(session_id = %session_id, error = %err, "Socket send failed");
                        break Teardown::SocketClosed;
                    }
                }
                Some(ProcessEvent::Exited(exit)) => {
                    tracing::info!(session_id = %session_id, code = ?exit.code, "Process exited");
                    if let Some(notice) = exit.notice() {
                        let _ = ws_tx.send(Message::Text(notice)).await;
                    }
                    break Teardown::ProcessExited;
                }
                None => break Teardown::ProcessExited,
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = input_tx.send(text.into_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = input_tx.send(data);
                }
                Some(Ok(Message::Close(_))) | None => break Teardown::SocketClosed,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(session_id = %session_id, error = %err, "Socket receive failed");
                    break Teardown::SocketClosed;
                }
            },
        }
    };

    drop(input_tx);
    writer.abort();
    manager.release(&session, SessionStatus::Closed).await;

    match teardown {
        Teardown::ProcessExited => {
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "Process exited".into(),
                })))
                .await;
        }
        Teardown::SocketClosed => {
            tracing::info!(session_id = %session_id, "Terminal disconnected");
        }
    }
    let _ = ws_tx.close().await;
}

async fn write_input(session: Arc<Session>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(payload) = input.recv().await {
        forward_input(&session, &payload).await;
    }
}

/// Resize frames are applied in queue order with the surrounding input.
async fn forward_input(session: &Session, payload: &[u8]) {
    match parse_control_frame(payload) {
        Some(ControlFrame::Resize { cols, rows }) => {
            if let Err(err) = session.resize(cols, rows).await {
                tracing::warn!(session_id = %session.id, error = %err, "Resize failed");
            }
        }
        None => {
            if let Err(err) = session.write(payload).await {
                tracing::warn!(session_id = %session.id, error = %err, "Write to process failed");
            }
        }
    }
}

/// Shows the failure inside the terminal, then closes with a code the client
/// can act on.
async fn reject(ws_tx: &mut SplitSink<WebSocket, Message>, api: &ApiError) {
    let _ = ws_tx.send(Message::Text(api.terminal_notice())).await;
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: rejection_close_code(&api.error_code),
            reason: api.message.clone().into(),
        })))
        .await;
    let _ = ws_tx.close().await;
}

pub(crate) fn rejection_close_code(code: &ErrorCode) -> u16 {
    match code {
        ErrorCode::InvalidArgument | ErrorCode::ConnectionRejected => close_code::POLICY,
        ErrorCode::SessionBusy | ErrorCode::TooManySessions => close_code::AGAIN,
        ErrorCode::NoTargetContainer => close_code::NORMAL,
        _ => close_code::ERROR,
    }
}
