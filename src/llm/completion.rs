//! Streaming chat-completion client for llama-server's OpenAI-compatible
//! `/v1/chat/completions` endpoint.
//!
//! A completion runs as a tokio task that pushes typed [`StreamEvent`]s into a
//! channel. The last event of every stream is exactly one `Completed` or
//! `Error`; transport failures never escape as faults. Cancelling suppresses
//! every event not yet emitted.

use super::streaming::{flush_sse_buffer, parse_sse_events};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const DONE_SENTINEL: &str = "[DONE]";

const THINK_CLOSE: &str = "</think>";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One message as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Request body. `-1` token limits let the server generate until EOS.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<WireMessage>,
    pub max_tokens: i64,
    pub n_predict: i64,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<WireMessage>) -> Self {
        Self {
            messages,
            max_tokens: -1,
            n_predict: -1,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A non-empty content delta.
    Token(String),
    /// A chunk carrying `usage`/`timings` and no content, passed through raw.
    Stats(Value),
    /// Stream finished; carries the full accumulated reply.
    Completed(String),
    /// Transport failure, human-readable.
    Error(String),
}

/// What a single SSE data payload means to the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Done,
    Token(String),
    Stats(Value),
    Skip,
}

/// Interpret one SSE `data` payload. Malformed payloads are `Skip`.
pub fn interpret_chunk(data: &str) -> ChunkOutcome {
    if data.trim() == DONE_SENTINEL {
        return ChunkOutcome::Done;
    }

    let Ok(chunk) = serde_json::from_str::<Value>(data) else {
        log::debug!("[STREAM] Skipping malformed event: {}", truncate(data, 120));
        return ChunkOutcome::Skip;
    };

    let token = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());

    if let Some(token) = token {
        return ChunkOutcome::Token(token.to_string());
    }
    if chunk.get("usage").is_some() || chunk.get("timings").is_some() {
        return ChunkOutcome::Stats(chunk);
    }
    ChunkOutcome::Skip
}

/// Visible assistant content: everything after the first `</think>`, or the
/// whole reply when the model never emitted one.
pub fn visible_reply(raw: &str) -> &str {
    match raw.find(THINK_CLOSE) {
        Some(idx) => &raw[idx + THINK_CLOSE.len()..],
        None => raw,
    }
}

/// Cancels one in-flight completion.
#[derive(Debug)]
pub struct StreamHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Stop emitting events. The socket is torn down when the task next
    /// yields; that part is best-effort.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Shared HTTP client for completions.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
}

impl CompletionClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("[STREAM] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http }
    }

    /// Start streaming on `runtime`. Every event is sent as `(tag, event)`.
    pub fn spawn<T>(
        &self,
        runtime: &tokio::runtime::Handle,
        endpoint: String,
        messages: Vec<WireMessage>,
        tag: T,
        events: UnboundedSender<(T, StreamEvent)>,
    ) -> StreamHandle
    where
        T: Clone + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let http = self.http.clone();

        let task = runtime.spawn(async move {
            let emit = move |event: StreamEvent| {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                // Receiver gone means nobody is listening any more.
                let _ = events.send((tag.clone(), event));
            };
            stream_completion(&http, &endpoint, messages, emit).await;
        });

        StreamHandle { cancelled, task }
    }

    /// Stream one completion to completion, reporting through `emit`.
    pub async fn stream(&self, endpoint: &str, messages: Vec<WireMessage>, emit: impl FnMut(StreamEvent)) {
        stream_completion(&self.http, endpoint, messages, emit).await
    }
}

impl Default for CompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn stream_completion(
    http: &reqwest::Client,
    endpoint: &str,
    messages: Vec<WireMessage>,
    mut emit: impl FnMut(StreamEvent),
) {
    let start = std::time::Instant::now();
    let body = CompletionRequest::new(messages);
    log::info!("[STREAM] POST {} ({} messages)", endpoint, body.messages.len());

    let mut resp = match http.post(endpoint).json(&body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            log::warn!("[STREAM] Request failed: {}", e);
            emit(StreamEvent::Error(describe_transport_error(endpoint, &e)));
            return;
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        log::warn!("[STREAM] HTTP {} from server: {}", status, truncate(&detail, 200));
        emit(StreamEvent::Error(format!(
            "Inference server returned HTTP {}{}",
            status,
            if detail.is_empty() { String::new() } else { format!(": {}", truncate(&detail, 200)) }
        )));
        return;
    }

    let mut buffer: Vec<u8> = Vec::new();
    let mut reply = String::new();
    let mut token_count = 0usize;

    'read: loop {
        let chunk = match resp.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                if let Some(event) = flush_sse_buffer(&mut buffer) {
                    if apply(&event.data, &mut reply, &mut emit) == Applied::Token {
                        token_count += 1;
                    }
                }
                break 'read;
            }
            Err(e) => {
                log::warn!("[STREAM] Connection dropped after {} tokens: {}", token_count, e);
                emit(StreamEvent::Error(format!("Connection to the inference server was lost: {}", e)));
                return;
            }
        };

        buffer.extend_from_slice(&chunk);
        for event in parse_sse_events(&mut buffer) {
            match apply(&event.data, &mut reply, &mut emit) {
                Applied::Done => break 'read,
                Applied::Token => token_count += 1,
                Applied::Other => {}
            }
        }
    }

    log::info!(
        "[STREAM] Completed: {} tokens, {} chars in {}ms",
        token_count,
        reply.len(),
        start.elapsed().as_millis()
    );
    emit(StreamEvent::Completed(reply));
}

#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Done,
    Token,
    Other,
}

/// Emit the events for one payload.
fn apply(data: &str, reply: &mut String, emit: &mut impl FnMut(StreamEvent)) -> Applied {
    match interpret_chunk(data) {
        ChunkOutcome::Done => Applied::Done,
        ChunkOutcome::Token(t) => {
            reply.push_str(&t);
            emit(StreamEvent::Token(t));
            Applied::Token
        }
        ChunkOutcome::Stats(v) => {
            emit(StreamEvent::Stats(v));
            Applied::Other
        }
        ChunkOutcome::Skip => Applied::Other,
    }
}

fn describe_transport_error(endpoint: &str, e: &reqwest::Error) -> String {
    if e.is_connect() {
        format!(
            "Could not connect to the inference server at {} (it may still be loading the model)",
            endpoint
        )
    } else if e.is_timeout() {
        format!("Request to {} timed out", endpoint)
    } else {
        format!("Request to {} failed: {}", endpoint, e)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn done_sentinel() {
        assert_eq!(interpret_chunk("[DONE]"), ChunkOutcome::Done);
        assert_eq!(interpret_chunk(" [DONE] "), ChunkOutcome::Done);
    }

    #[test]
    fn content_delta_is_token() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hi"}}]}"#;
        assert_eq!(interpret_chunk(data), ChunkOutcome::Token("Hi".into()));
    }

    #[test]
    fn empty_or_missing_content_is_skipped() {
        assert_eq!(interpret_chunk(r#"{"choices":[{"delta":{"content":""}}]}"#), ChunkOutcome::Skip);
        assert_eq!(interpret_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), ChunkOutcome::Skip);
        assert_eq!(interpret_chunk(r#"{"choices":[]}"#), ChunkOutcome::Skip);
    }

    #[test]
    fn usage_chunk_is_stats() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":1}}"#;
        assert_eq!(
            interpret_chunk(data),
            ChunkOutcome::Stats(json!({"choices": [], "usage": {"prompt_tokens": 1}}))
        );
        let finish = r#"{"choices":[{"finish_reason":"stop","delta":{}}],"timings":{"predicted_n":3}}"#;
        assert!(matches!(interpret_chunk(finish), ChunkOutcome::Stats(_)));
    }

    #[test]
    fn malformed_payload_is_skipped() {
        assert_eq!(interpret_chunk("{not json"), ChunkOutcome::Skip);
        assert_eq!(interpret_chunk(r#"{"choices":"nope"}"#), ChunkOutcome::Skip);
    }

    #[test]
    fn request_body_shape() {
        let body = CompletionRequest::new(vec![WireMessage {
            role: "user".into(),
            content: "Hello".into(),
        }]);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "messages": [{"role": "user", "content": "Hello"}],
                "max_tokens": -1,
                "n_predict": -1,
                "stream": true
            })
        );
    }

    #[test]
    fn visible_reply_after_think_marker() {
        assert_eq!(visible_reply("<think>hmm</think>\nAnswer"), "\nAnswer");
        assert_eq!(visible_reply("a</think>b</think>c"), "b</think>c");
        assert_eq!(visible_reply("No reasoning here"), "No reasoning here");
        assert_eq!(visible_reply(""), "");
    }

    #[tokio::test]
    async fn connection_refused_is_error_event() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut events = Vec::new();
        let endpoint = format!("http://127.0.0.1:{}/v1/chat/completions", port);
        CompletionClient::new()
            .stream(&endpoint, Vec::new(), |e| events.push(e))
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(msg) if msg.contains("Could not connect")));
    }

    #[tokio::test]
    async fn spawned_stream_takes_send_only_tags() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Cell is Send but not Sync.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = CompletionClient::new().spawn(
            &tokio::runtime::Handle::current(),
            format!("http://127.0.0.1:{}/v1/chat/completions", port),
            Vec::new(),
            std::cell::Cell::new(3u32),
            tx,
        );

        let (tag, event) = rx.recv().await.unwrap();
        assert_eq!(tag.get(), 3);
        assert!(matches!(event, StreamEvent::Error(_)));
        assert!(rx.recv().await.is_none());
    }
}
