//! SSE framing: splits a byte stream into server-sent events.
//!
//! Bytes are buffered raw so multi-byte UTF-8 sequences split across network
//! chunks decode correctly once the event is complete.

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, empty when absent.
    pub event_type: String,
    /// All `data:` lines of the event joined with `\n`.
    pub data: String,
}

/// Parse complete SSE events from a buffer, removing them from it.
///
/// Events are separated by a blank line (`\n\n` or `\r\n\r\n`). A trailing
/// partial event stays in the buffer until more bytes arrive. Events with
/// neither a type nor data (comments, keep-alives) are dropped.
pub fn parse_sse_events(buffer: &mut Vec<u8>) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some((end, sep_len)) = find_event_boundary(buffer) {
        let block: Vec<u8> = buffer.drain(..end + sep_len).take(end).collect();
        if let Some(event) = decode_block(&block) {
            events.push(event);
        }
    }

    events
}

/// Decode whatever is left in the buffer once the stream has ended.
pub fn flush_sse_buffer(buffer: &mut Vec<u8>) -> Option<SseEvent> {
    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        buffer.clear();
        return None;
    }
    let block = std::mem::take(buffer);
    decode_block(&block)
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event_type = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event_type = value.trim().to_string(),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if event_type.is_empty() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event_type,
        data: data_lines.join("\n"),
    })
}
