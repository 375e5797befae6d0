//! Integration tests for the streaming completion client.
//!
//! Each test runs a one-shot HTTP server on a local TCP port that replays a
//! scripted SSE body, then checks the events the client emitted.

use lmngen_lib::llm::{CompletionClient, StreamEvent, WireMessage};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// One piece of the scripted response body.
enum Piece {
    Bytes(&'static str),
    /// Flush and pause so the client sees a chunk boundary.
    Pause,
    /// Wait until the test says to continue.
    Gate(oneshot::Receiver<()>),
}

/// Serve a single request. Resolves to the request body the client sent.
async fn serve_once(status: &'static str, script: Vec<Piece>) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let body = read_request_body(&mut sock).await;

        let head = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
            status
        );
        sock.write_all(head.as_bytes()).await.unwrap();
        for piece in script {
            match piece {
                Piece::Bytes(b) => {
                    if sock.write_all(b.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Piece::Pause => {
                    let _ = sock.flush().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Piece::Gate(rx) => {
                    let _ = sock.flush().await;
                    let _ = rx.await;
                }
            }
        }
        let _ = sock.shutdown().await;
        body
    });

    (format!("http://127.0.0.1:{}/v1/chat/completions", port), server)
}

async fn read_request_body(sock: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = sock.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(split) = text.find("\r\n\r\n") {
            let length = text[..split]
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if buf.len() >= split + 4 + length {
                return String::from_utf8_lossy(&buf[split + 4..split + 4 + length]).to_string();
            }
        }
    }
    String::new()
}

fn user(content: &str) -> Vec<WireMessage> {
    vec![
        WireMessage {
            role: "system".into(),
            content: "You are a helpful assistant.".into(),
        },
        WireMessage {
            role: "user".into(),
            content: content.into(),
        },
    ]
}

async fn collect(endpoint: &str, messages: Vec<WireMessage>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    CompletionClient::new()
        .stream(endpoint, messages, |e| events.push(e))
        .await;
    events
}

fn tokens(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn tokens_concatenate_and_complete_once() {
    let (endpoint, server) = serve_once(
        "200 OK",
        vec![
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"<think>x</think>\"}}]}\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"lo!\"}}]}\n\n"),
            Piece::Bytes(
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3,\"total_tokens\":12},\
                 \"timings\":{\"prompt_ms\":10.0,\"predicted_ms\":30.0,\"predicted_per_second\":100.0}}\n\n",
            ),
            Piece::Bytes("data: [DONE]\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n"),
        ],
    )
    .await;

    let events = collect(&endpoint, user("Hello")).await;

    assert_eq!(tokens(&events), "<think>x</think>Hello!");
    let completed: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Completed(_)))
        .collect();
    assert_eq!(completed, vec![&StreamEvent::Completed("<think>x</think>Hello!".into())]);
    assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));

    let stats = events.iter().find_map(|e| match e {
        StreamEvent::Stats(v) => Some(v.clone()),
        _ => None,
    });
    assert_eq!(stats.unwrap()["usage"]["total_tokens"], 12);

    let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
    assert_eq!(body["max_tokens"], -1);
    assert_eq!(body["n_predict"], -1);
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][1]["content"], "Hello");
}

#[tokio::test]
async fn malformed_events_do_not_disturb_the_reply() {
    let (endpoint, _server) = serve_once(
        "200 OK",
        vec![
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n"),
            Piece::Bytes("data: {this is not json\n\n"),
            Piece::Bytes(": keep-alive comment\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"nodelta\":true}]}\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n\n"),
            Piece::Bytes("data: [DONE]\n\n"),
        ],
    )
    .await;

    let events = collect(&endpoint, user("x")).await;
    assert_eq!(tokens(&events), "AB");
    assert_eq!(events.last(), Some(&StreamEvent::Completed("AB".into())));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
}

#[tokio::test]
async fn events_split_across_network_chunks() {
    let (endpoint, _server) = serve_once(
        "200 OK",
        vec![
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"con"),
            Piece::Pause,
            Piece::Bytes("tent\":\"caf\u{e9}\"}}]}\r\n"),
            Piece::Pause,
            Piece::Bytes("\r\ndata: [DO"),
            Piece::Pause,
            Piece::Bytes("NE]\r\n\r\n"),
        ],
    )
    .await;

    let events = collect(&endpoint, user("x")).await;
    assert_eq!(events, vec![
        StreamEvent::Token("caf\u{e9}".into()),
        StreamEvent::Completed("caf\u{e9}".into()),
    ]);
}

#[tokio::test]
async fn natural_end_without_sentinel_still_completes() {
    let (endpoint, _server) = serve_once(
        "200 OK",
        vec![
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"one\"}}]}\n\n"),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\" two\"}}]}"),
        ],
    )
    .await;

    let events = collect(&endpoint, user("x")).await;
    assert_eq!(events.last(), Some(&StreamEvent::Completed("one two".into())));
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn http_error_status_is_an_error_event() {
    let (endpoint, _server) = serve_once("503 Service Unavailable", vec![Piece::Bytes("loading model")]).await;

    let events = collect(&endpoint, user("x")).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(msg) => assert!(msg.contains("503"), "unexpected message: {}", msg),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn unreachable_server_is_a_retryable_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let endpoint = format!("http://127.0.0.1:{}/v1/chat/completions", port);
    let events = collect(&endpoint, user("Hello")).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(msg) if msg.contains("loading the model")));
}

#[tokio::test]
async fn server_vanishing_mid_reply_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_request_body(&mut sock).await;
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n";
        // Promise far more body than is sent, then go away like a killed process.
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n",
            partial.len() + 4096
        );
        sock.write_all(head.as_bytes()).await.unwrap();
        sock.write_all(partial.as_bytes()).await.unwrap();
        sock.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sock);
    });

    let endpoint = format!("http://127.0.0.1:{}/v1/chat/completions", port);
    let events = collect(&endpoint, user("x")).await;

    assert_eq!(events.first(), Some(&StreamEvent::Token("half".into())));
    assert!(
        matches!(events.last(), Some(StreamEvent::Error(msg)) if msg.contains("lost")),
        "unexpected events: {:?}",
        events
    );
    assert_eq!(events.iter().filter(|e| matches!(e, StreamEvent::Error(_))).count(), 1);
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Completed(_))));
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_stream_emits_nothing_further() {
    let (release_tx, release_rx) = oneshot::channel();
    let (endpoint, _server) = serve_once(
        "200 OK",
        vec![
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n"),
            Piece::Gate(release_rx),
            Piece::Bytes("data: {\"choices\":[{\"delta\":{\"content\":\"second\"}}]}\n\n"),
            Piece::Bytes("data: [DONE]\n\n"),
        ],
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = CompletionClient::new().spawn(
        &tokio::runtime::Handle::current(),
        endpoint,
        user("x"),
        7u32,
        tx,
    );

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(first, Some((7, StreamEvent::Token("first".into()))));

    handle.cancel();
    let _ = release_tx.send(());

    let rest = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(rest, None, "no events may follow a cancel");
}
