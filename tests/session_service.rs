use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use futures::SinkExt;
use serde_json::{Value, json};
use std::sync::Arc;
use termrelay::config::SessionConfig;
use termrelay::server::{ServiceState, service_router};
use termrelay::session::SessionManager;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

mod common;
use common::{
    EchoSpawner, close_code, connect, fake_docker, next_message, payload, start_pty_service,
    start_service, wait_until, wait_until_empty,
};

#[tokio::test]
async fn relays_input_output_and_resize_then_kills_on_close() {
    let service = start_service(EchoSpawner::default()).await;
    let mut socket = connect(&format!("{}/ws/main?containerId=c1", service.ws_url())).await;

    let greeting = next_message(&mut socket).await.expect("greeting");
    assert!(matches!(greeting, Message::Binary(_)));
    assert_eq!(payload(&greeting), b"attached c1\r\n");

    socket.send(Message::Text("ls\n".to_string())).await.expect("send");
    let echoed = next_message(&mut socket).await.expect("echo");
    assert_eq!(payload(&echoed), b"ls\n");

    socket
        .send(Message::Text(r#"{"type":"resize","cols":100,"rows":40}"#.to_string()))
        .await
        .expect("send resize");
    let process = service.spawner.process(0);
    wait_until(|| !process.resizes().is_empty()).await;
    assert_eq!(process.resizes(), vec![(100, 40)]);
    assert_eq!(process.input(), b"ls\n");

    let session = service.manager.get_session("main").await.expect("registered");
    assert_eq!(session.size(), (100, 40));
    assert_eq!(session.user_id, "auto");

    socket.close(None).await.expect("close");
    wait_until_empty(&service.manager).await;
    assert!(process.is_killed());
}

#[tokio::test]
async fn non_control_json_is_written_verbatim() {
    let service = start_service(EchoSpawner::default()).await;
    let mut socket = connect(&format!("{}/ws/tab-2?containerId=c1", service.ws_url())).await;
    next_message(&mut socket).await.expect("greeting");

    let json = r#"{"type":"resize","cols":"wide","rows":40}"#;
    socket.send(Message::Text(json.to_string())).await.expect("send");
    let echoed = next_message(&mut socket).await.expect("echo");
    assert_eq!(payload(&echoed), json.as_bytes());

    let process = service.spawner.process(0);
    assert!(process.resizes().is_empty());
    assert_eq!(service.spawner.requests.lock().unwrap()[0].command, vec!["/bin/sh"]);
}

#[tokio::test]
async fn missing_container_gets_notice_then_close() {
    let service = start_service(EchoSpawner::default()).await;
    let mut socket = connect(&format!("{}/ws/main", service.ws_url())).await;

    let notice = next_message(&mut socket).await.expect("notice");
    assert_eq!(
        payload(&notice),
        b"\r\n\x1b[1;31mError: No container specified\x1b[0m\r\n"
    );
    let close = next_message(&mut socket).await;
    assert!(matches!(close, Some(Message::Close(_)) | None));
    assert_eq!(service.spawner.spawn_count(), 0);
    assert!(service.manager.is_empty().await);
}

#[tokio::test]
async fn spawn_failure_closes_with_internal_error() {
    let service = start_service(EchoSpawner {
        broken_container: Some("dead".to_string()),
        ..EchoSpawner::default()
    })
    .await;
    let mut socket = connect(&format!("{}/ws/main?containerId=dead", service.ws_url())).await;

    let notice = next_message(&mut socket).await.expect("notice");
    let text = String::from_utf8(payload(&notice)).expect("utf8");
    assert!(text.contains("Failed to start terminal"), "{text}");
    let close = next_message(&mut socket).await.expect("close frame");
    assert_eq!(close_code(&close), Some(1011));
    assert!(service.manager.is_empty().await);
}

#[tokio::test]
async fn process_exit_closes_socket_and_removes_session() {
    let service = start_service(EchoSpawner::default()).await;
    let mut socket = connect(&format!("{}/ws/tab-3?containerId=c1", service.ws_url())).await;
    next_message(&mut socket).await.expect("greeting");

    socket.send(Message::Text("exit\n".to_string())).await.expect("send");

    let notice = next_message(&mut socket).await.expect("exit notice");
    let text = String::from_utf8(payload(&notice)).expect("utf8");
    assert!(text.contains("Process exited with code 3"), "{text}");
    let close = next_message(&mut socket).await.expect("close frame");
    assert_eq!(close_code(&close), Some(1000));
    wait_until_empty(&service.manager).await;
}

#[tokio::test]
async fn second_connection_to_attached_session_is_refused() {
    let service = start_service(EchoSpawner::default()).await;
    let url = format!("{}/ws/main?containerId=c1", service.ws_url());
    let mut first = connect(&url).await;
    next_message(&mut first).await.expect("greeting");

    let mut second = connect(&url).await;
    let notice = next_message(&mut second).await.expect("notice");
    let text = String::from_utf8(payload(&notice)).expect("utf8");
    assert!(text.contains("Session main is already attached"), "{text}");
    let close = next_message(&mut second).await.expect("close frame");
    assert_eq!(close_code(&close), Some(1013));

    // The first attachment is untouched.
    first.send(Message::Text("pwd\n".to_string())).await.expect("send");
    assert_eq!(payload(&next_message(&mut first).await.expect("echo")), b"pwd\n");
    assert_eq!(service.spawner.spawn_count(), 1);
}

#[tokio::test]
async fn concurrent_first_connections_spawn_one_process() {
    let service = start_service(EchoSpawner::default()).await;
    let url = format!("{}/ws/race?containerId=c1", service.ws_url());
    let (mut a, mut b) = tokio::join!(connect(&url), connect(&url));

    let first_a = next_message(&mut a).await.expect("frame");
    let first_b = next_message(&mut b).await.expect("frame");
    let attached = [&first_a, &first_b]
        .iter()
        .filter(|message| matches!(message, Message::Binary(_)))
        .count();
    assert_eq!(attached, 1);
    assert_eq!(service.spawner.spawn_count(), 1);
    assert_eq!(service.manager.len().await, 1);
}

fn app() -> (axum::Router, Arc<SessionManager>) {
    let manager = SessionManager::new(SessionConfig::default(), Arc::new(EchoSpawner::default()));
    let router = service_router(ServiceState {
        manager: manager.clone(),
        public_ws_base: "ws://localhost:3006/".to_string(),
    });
    (router, manager)
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn rest_create_list_and_delete() {
    let (app, manager) = app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/session")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"userId": "u1", "workspaceId": "w1", "containerId": "c1"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["success"], true);
    let session_id = created["sessionId"].as_str().unwrap().to_string();
    assert_eq!(
        created["websocketUrl"],
        format!("ws://localhost:3006/ws/{session_id}")
    );

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions/u1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    let sessions = listed["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], session_id.as_str());
    assert_eq!(sessions[0]["status"], "created");
    assert_eq!(sessions[0]["workspaceId"], "w1");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{session_id}"))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(manager.is_empty().await);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{session_id}"))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Session not found");
}

#[tokio::test]
async fn health_reports_session_count() {
    let (app, manager) = app();
    manager
        .resolve_or_create("main", Some("c1"))
        .await
        .expect("create");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
}

fn paste(total: usize) -> String {
    let line = "the quick brown fox jumps over the lazy dog 0123456789ab\n";
    line.repeat(total / line.len())
}

#[tokio::test]
async fn large_paste_keeps_output_flowing_through_a_real_pty() {
    let (_dir, docker) = fake_docker("exec cat");
    let (addr, manager) = start_pty_service(&docker).await;
    let mut socket = connect(&format!("ws://{addr}/ws/paste?containerId=c1")).await;

    let text = paste(1024 * 1024);
    socket.send(Message::Text(text.clone())).await.expect("send paste");

    // cat alone writes every line back; the PTY echo only adds to that.
    let mut received = 0;
    while received < text.len() {
        match next_message(&mut socket).await.expect("output") {
            Message::Binary(data) => received += data.len(),
            other => panic!("unexpected {other:?}"),
        }
    }

    socket.close(None).await.expect("close");
    wait_until_empty(&manager).await;
}

#[tokio::test]
async fn close_tears_down_while_a_paste_is_still_blocked() {
    let (_dir, docker) = fake_docker("exec sleep 30");
    let (addr, manager) = start_pty_service(&docker).await;
    let mut socket = connect(&format!("ws://{addr}/ws/stuck?containerId=c1")).await;

    socket
        .send(Message::Text(paste(1024 * 1024)))
        .await
        .expect("send paste");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(manager.len().await, 1);

    socket.close(None).await.expect("close");
    wait_until_empty(&manager).await;
}
