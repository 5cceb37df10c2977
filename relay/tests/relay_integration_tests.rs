//! End-to-end tests driving the relay over a real WebSocket connection.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use test_agent_relay::error::TransportError;
use test_agent_relay::report::ReportStyle;
use test_agent_relay::{RelayServer, RunStatus, SessionOutcome};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(
    tests: &[&str],
    connect_timeout: Duration,
) -> (SocketAddr, JoinHandle<Result<SessionOutcome, TransportError>>) {
    let server = RelayServer::bind(
        "127.0.0.1:0".parse().expect("loopback address"),
        tests.iter().map(|t| t.to_string()).collect(),
        ReportStyle::Tbpl.format(),
        connect_timeout,
    )
    .await
    .expect("server to bind");
    let addr = server.local_addr().expect("local addr");
    (addr, tokio::spawn(server.run()))
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("client to connect");
    ws
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("frame to send");
}

async fn send_test_data(ws: &mut Client, event: &str, data: Value) {
    let inner = json!([event, data]).to_string();
    send(ws, json!(["test data", [inner]])).await;
}

#[tokio::test]
async fn full_run_reports_failure() {
    let (addr, server) = start_server(&["apps/a_test.js"], Duration::from_secs(5)).await;
    let mut ws = connect(addr).await;

    let command: Value = serde_json::from_str(&next_text(&mut ws).await).expect("command JSON");
    assert_eq!(command, json!(["run tests", {"tests": ["/apps/a_test.js"]}]));

    send(&mut ws, json!(["set test envs", ["global"]])).await;
    send_test_data(&mut ws, "start", json!({})).await;
    send_test_data(&mut ws, "suite", json!({"title": "a"})).await;
    send_test_data(&mut ws, "pass", json!({"fullTitle": "a works"})).await;
    send_test_data(&mut ws, "fail", json!({"fullTitle": "a breaks"})).await;
    send_test_data(&mut ws, "suite end", json!({"title": "a"})).await;
    send_test_data(&mut ws, "end", json!({})).await;

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");

    let SessionOutcome::Completed { status, report } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(
        report.to_string(),
        "\ntest report: (global)\n\
         TEST-PASS | a works\n\
         TEST-UNEXPECTED-FAIL | a breaks\n\
         Passed: 1\nFailed: 1\nTodo: 0\n"
    );

    // The relay closes the socket once the run is complete.
    let closed = matches!(ws.next().await, Some(Ok(Message::Close(_))) | None | Some(Err(_)));
    assert!(closed);
}

#[tokio::test]
async fn multiple_environments_and_noise() {
    let (addr, server) = start_server(&["/a_test.js"], Duration::from_secs(5)).await;
    let mut ws = connect(addr).await;
    next_text(&mut ws).await;

    send(&mut ws, json!(["set test envs", ["env1", "env2"]])).await;
    ws.send(Message::Text("garbage".to_string()))
        .await
        .expect("frame to send");
    send(&mut ws, json!(["unknown event", {}])).await;

    // Before its start event env2 traffic is dropped.
    send_test_data(&mut ws, "end", json!({"testAgentEnvId": "env2"})).await;

    send_test_data(&mut ws, "start", json!({"testAgentEnvId": "env1"})).await;
    send_test_data(&mut ws, "pass", json!({"testAgentEnvId": "env1", "fullTitle": "x"})).await;
    send_test_data(&mut ws, "end", json!({"testAgentEnvId": "env1"})).await;
    send_test_data(&mut ws, "start", json!({"testAgentEnvId": "env2"})).await;
    send_test_data(&mut ws, "end", json!({"testAgentEnvId": "env2"})).await;

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");
    assert_eq!(outcome.status(), RunStatus::Passed);
    assert_eq!(outcome.status().exit_code(), 0);
}

#[tokio::test]
async fn early_disconnect_aborts_run() {
    let (addr, server) = start_server(&["a_test.js"], Duration::from_secs(5)).await;
    let mut ws = connect(addr).await;
    next_text(&mut ws).await;

    send(&mut ws, json!(["set test envs", ["global"]])).await;
    send_test_data(&mut ws, "start", json!({})).await;
    ws.close(None).await.expect("client close");

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");
    assert!(matches!(outcome, SessionOutcome::Aborted { .. }));
    assert_eq!(outcome.status().exit_code(), 2);
}

#[tokio::test]
async fn second_connection_is_refused() {
    let (addr, server) = start_server(&["a_test.js"], Duration::from_secs(5)).await;
    let mut first = connect(addr).await;
    next_text(&mut first).await;

    let mut second = connect(addr).await;
    match second.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected policy close, got {other:?}"),
    }

    send(&mut first, json!(["set test envs", ["global"]])).await;
    send_test_data(&mut first, "start", json!({})).await;
    send_test_data(&mut first, "end", json!({})).await;

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");
    assert_eq!(outcome.status(), RunStatus::Passed);
}

#[tokio::test]
async fn no_connection_times_out_as_aborted() {
    let (_addr, server) = start_server(&["a_test.js"], Duration::from_millis(100)).await;

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");
    assert_eq!(outcome.status(), RunStatus::Aborted);
}

#[tokio::test]
async fn silent_socket_does_not_block_the_agent() {
    // Shorter than the per-handshake limit: the agent must not queue behind it.
    let (addr, server) = start_server(&["a_test.js"], Duration::from_secs(3)).await;

    let _silent = TcpStream::connect(addr).await.expect("raw connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ws = connect(addr).await;
    next_text(&mut ws).await;
    send(&mut ws, json!(["set test envs", ["global"]])).await;
    send_test_data(&mut ws, "start", json!({})).await;
    send_test_data(&mut ws, "end", json!({})).await;

    let outcome = server
        .await
        .expect("server task")
        .expect("server to finish");
    assert_eq!(outcome.status(), RunStatus::Passed);
}
