//! Streaming engine.
//!
//! One cooperative loop per request: drain complete SSE frames from the
//! upstream body, parse the JSON payload, feed it to a format-specific
//! rewriter and flush whatever frames the rewriter produced. The engine owns
//! the wire guarantees: exactly one terminal `data: [DONE]` for protocols
//! that use it, upstream framing headers never forwarded, and accumulated
//! usage handed to billing even when the client disconnects mid-stream.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::Value;

use crate::logger;

use super::client::{drain_sse_lines, is_done_marker, parse_sse_line, SseLine};
use super::meta::Usage;

/// Lifecycle of a streaming rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Started,
    InContentBlock,
    ToolCallAccumulating,
    Finishing,
}

/// Rewrites upstream SSE frames into client-protocol frames.
pub trait SseRewriter: Send {
    /// Handle one upstream data frame. `event` carries the preceding
    /// `event:` field when the upstream protocol uses named events.
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String>;

    /// Upstream finished (saw `[DONE]` or EOF). Emit closing frames; the
    /// engine appends the terminal `[DONE]` itself when applicable.
    fn finish(&mut self) -> Vec<String>;

    /// Whether the client protocol terminates with `data: [DONE]`.
    fn emits_done(&self) -> bool {
        true
    }

    fn usage(&self) -> Usage;
}

/// Accumulates tool-call argument fragments across stream chunks. Shared by
/// every rewriter that has to reassemble tool calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PendingToolCall>,
}

#[derive(Debug, Default, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallAccumulator {
    /// Merge one delta fragment at `index`. Later fragments may repeat the
    /// id/name or carry only argument text.
    pub fn push(&mut self, index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) {
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = id {
            if !id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                entry.name = name.to_string();
            }
        }
        if let Some(args) = args {
            entry.arguments.push_str(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn get(&self, index: usize) -> Option<&PendingToolCall> {
        self.calls.get(&index)
    }

    /// Completed calls in index order.
    pub fn drain_ordered(&mut self) -> Vec<PendingToolCall> {
        std::mem::take(&mut self.calls).into_values().collect()
    }

    /// Approximate text length of the accumulated arguments, used when usage
    /// must be estimated.
    pub fn argument_chars(&self) -> usize {
        self.calls.values().map(|c| c.arguments.len()).sum()
    }
}

/// Splits an upstream byte stream into `(event, data)` frames.
#[derive(Default)]
struct FrameDecoder {
    buffer: Vec<u8>,
    pending_event: Option<String>,
}

impl FrameDecoder {
    /// Returns the complete data frames contained in `chunk`, each paired
    /// with the `event:` name that preceded it, if any.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<(Option<String>, String)>, super::error::RelayError> {
        let lines = drain_sse_lines(&mut self.buffer, chunk)?;
        let mut frames = Vec::new();
        for line in lines {
            match parse_sse_line(&line) {
                SseLine::Event(name) => self.pending_event = Some(name),
                SseLine::Data(data) => {
                    frames.push((self.pending_event.take(), data));
                }
                SseLine::Other => {}
            }
        }
        Ok(frames)
    }
}

fn frames_to_bytes(frames: Vec<String>) -> Bytes {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(frame.as_bytes());
    }
    Bytes::from(out)
}

/// Format one `data:` frame, optionally with a named event.
pub fn sse_frame(event: Option<&str>, payload: &Value) -> String {
    match event {
        Some(name) => format!("event: {}\ndata: {}\n\n", name, payload),
        None => format!("data: {}\n\n", payload),
    }
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Drive `rewriter` over the upstream body and serve the result as an SSE
/// response. `on_complete` receives the final usage exactly once, at stream
/// end or when the client goes away.
pub fn sse_response<R, F>(upstream: reqwest::Response, rewriter: R, on_complete: F) -> Response
where
    R: SseRewriter + 'static,
    F: FnOnce(Usage) + Send + 'static,
{
    let rewriter = Arc::new(Mutex::new(rewriter));
    let decoder = Arc::new(Mutex::new(FrameDecoder::default()));
    let upstream_done = Arc::new(Mutex::new(false));
    let upstream_errored = Arc::new(Mutex::new(false));

    let rewriter_map = Arc::clone(&rewriter);
    let decoder_map = Arc::clone(&decoder);
    let done_map = Arc::clone(&upstream_done);
    let errored_map = Arc::clone(&upstream_errored);

    let body_stream = upstream.bytes_stream().map(move |result| match result {
        Ok(bytes) => {
            let frames = {
                let mut decoder = decoder_map.lock().unwrap();
                match decoder.push(bytes.as_ref()) {
                    Ok(frames) => frames,
                    Err(e) => {
                        logger::error("stream", &format!("frame decode failed: {}", e));
                        *errored_map.lock().unwrap() = true;
                        return Err(std::io::Error::other(e.to_string()));
                    }
                }
            };

            let mut output = Vec::new();
            for (event, data) in frames {
                if is_done_marker(&data) {
                    // Swallow the upstream sentinel; the finalizer emits ours.
                    let mut done = done_map.lock().unwrap();
                    if !*done {
                        *done = true;
                        let mut rw = rewriter_map.lock().unwrap();
                        output.extend(rw.finish());
                    }
                    continue;
                }
                match serde_json::from_str::<Value>(&data) {
                    Ok(json) => {
                        let mut rw = rewriter_map.lock().unwrap();
                        output.extend(rw.on_frame(event.as_deref(), &json));
                    }
                    Err(e) => {
                        logger::error(
                            "stream",
                            &format!(
                                "unparsable SSE JSON: {}, data={}",
                                e,
                                &data[..data.len().min(200)]
                            ),
                        );
                    }
                }
            }
            Ok(frames_to_bytes(output))
        }
        Err(e) => {
            logger::error("stream", &format!("upstream stream error: {}", e));
            Err(std::io::Error::other(e.to_string()))
        }
    });

    // Terminal frame ordering: rewriter closing frames (if the upstream
    // never sent [DONE]), then exactly one [DONE] of our own. A mid-stream
    // upstream failure instead closes the stream bare (the client observes
    // EOF, no extra envelope). The billing callback fires in every exit
    // path because the chained future runs when the stream is
    // dropped-complete as well.
    let rewriter_fin = Arc::clone(&rewriter);
    let done_fin = Arc::clone(&upstream_done);
    let errored_fin = Arc::clone(&upstream_errored);
    let completion = Arc::new(Mutex::new(Some(on_complete)));
    let completion_fin = Arc::clone(&completion);

    let finalized = body_stream
        .inspect(move |result| {
            if result.is_err() {
                *upstream_errored.lock().unwrap() = true;
            }
        })
        .chain(futures_util::stream::once(async move {
            let mut output = Vec::new();
            {
                let mut rw = rewriter_fin.lock().unwrap();
                let mut done = done_fin.lock().unwrap();
                let errored = *errored_fin.lock().unwrap();
                if !errored {
                    if !*done {
                        *done = true;
                        output.extend(rw.finish());
                    }
                    if rw.emits_done() {
                        output.push(DONE_FRAME.to_string());
                    }
                }
                let usage = rw.usage();
                if let Some(cb) = completion_fin.lock().unwrap().take() {
                    cb(usage);
                }
            }
            Ok::<Bytes, std::io::Error>(frames_to_bytes(output))
        }))
        .filter_map(|result| async move {
            match result {
                Ok(bytes) if bytes.is_empty() => None,
                Ok(bytes) => Some(Ok::<Bytes, std::io::Error>(bytes)),
                Err(e) => {
                    logger::error("stream", &format!("stream relay error: {}", e));
                    None
                }
            }
        });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(finalized))
        .unwrap_or_else(|e| {
            logger::error("stream", &format!("failed to build stream response: {}", e));
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

// ============================================================================
// Passthrough rewriters
// ============================================================================

/// Chat Completions passthrough: frames go through unchanged while usage is
/// tracked from `usage` chunks, falling back to delta text estimates.
pub struct ChatPassthrough {
    usage: Usage,
    saw_usage_chunk: bool,
    estimated_completion: i64,
}

impl ChatPassthrough {
    pub fn new(estimated_prompt_tokens: i64) -> Self {
        Self {
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_usage_chunk: false,
            estimated_completion: 0,
        }
    }
}

/// Pull prompt/completion counts out of a Chat usage object.
pub fn apply_chat_usage(usage: &mut Usage, json: &Value) -> bool {
    let Some(u) = json.get("usage").filter(|u| !u.is_null()) else {
        return false;
    };
    if let Some(v) = u.get("prompt_tokens").and_then(Value::as_i64) {
        usage.prompt_tokens = v;
    }
    if let Some(v) = u.get("completion_tokens").and_then(Value::as_i64) {
        usage.completion_tokens = v;
    }
    if let Some(v) = u
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
    {
        usage.prompt_tokens_details.cached_tokens = v;
    }
    usage.recompute_total();
    true
}

impl SseRewriter for ChatPassthrough {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        if apply_chat_usage(&mut self.usage, data) {
            self.saw_usage_chunk = true;
        }
        if !self.saw_usage_chunk {
            if let Some(choices) = data.get("choices").and_then(Value::as_array) {
                for choice in choices {
                    if let Some(content) = choice
                        .get("delta")
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        self.estimated_completion += super::meta::estimate_tokens(content);
                    }
                }
            }
        }
        vec![sse_frame(None, data)]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_usage_chunk {
            usage.completion_tokens = self.estimated_completion;
            usage.recompute_total();
        }
        usage
    }
}

/// Claude Messages passthrough: events are re-framed unchanged; usage comes
/// from `message_start` (input side) and `message_delta` (output side).
pub struct ClaudePassthrough {
    usage: Usage,
    saw_output_usage: bool,
    estimated_completion: i64,
}

impl ClaudePassthrough {
    pub fn new(estimated_prompt_tokens: i64) -> Self {
        Self {
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_output_usage: false,
            estimated_completion: 0,
        }
    }
}

/// Claude usage counts cache reads and writes as part of the prompt.
pub fn claude_input_tokens(usage: &Value) -> i64 {
    let base = usage
        .get("input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cache_write = usage
        .get("cache_creation_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cache_read = usage
        .get("cache_read_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    base + cache_write + cache_read
}

impl SseRewriter for ClaudePassthrough {
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String> {
        match data.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(u) = data.get("message").and_then(|m| m.get("usage")) {
                    self.usage.prompt_tokens = claude_input_tokens(u);
                    self.usage.prompt_tokens_details.cached_tokens = u
                        .get("cache_read_input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    self.usage.recompute_total();
                }
            }
            Some("message_delta") => {
                if let Some(v) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.usage.completion_tokens = v;
                    self.usage.recompute_total();
                    self.saw_output_usage = true;
                }
            }
            Some("content_block_delta") => {
                if let Some(text) = data
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                {
                    self.estimated_completion += super::meta::estimate_tokens(text);
                }
            }
            _ => {}
        }
        vec![sse_frame(event, data)]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn emits_done(&self) -> bool {
        // Claude streams end with message_stop, not [DONE].
        false
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_output_usage {
            usage.completion_tokens = self.estimated_completion;
            usage.recompute_total();
        }
        usage
    }
}

/// Chains two rewriters: `inner` lowers the upstream protocol to Chat
/// chunks; `outer` consumes those chunks and emits the client protocol.
/// Used when a fallback crosses two wire formats (e.g. Responses client on
/// a Gemini channel).
pub struct ComposedStream {
    inner: Box<dyn SseRewriter>,
    outer: Box<dyn SseRewriter>,
}

impl ComposedStream {
    pub fn new(inner: Box<dyn SseRewriter>, outer: Box<dyn SseRewriter>) -> Self {
        Self { inner, outer }
    }

    fn relay_frames(&mut self, frames: Vec<String>) -> Vec<String> {
        let mut out = Vec::new();
        for frame in frames {
            for line in frame.lines() {
                if let SseLine::Data(data) = parse_sse_line(line) {
                    if is_done_marker(&data) {
                        continue;
                    }
                    if let Ok(json) = serde_json::from_str::<Value>(&data) {
                        out.extend(self.outer.on_frame(None, &json));
                    }
                }
            }
        }
        out
    }
}

impl SseRewriter for ComposedStream {
    fn on_frame(&mut self, event: Option<&str>, data: &Value) -> Vec<String> {
        let inner_frames = self.inner.on_frame(event, data);
        self.relay_frames(inner_frames)
    }

    fn finish(&mut self) -> Vec<String> {
        let inner_frames = self.inner.finish();
        let mut out = self.relay_frames(inner_frames);
        out.extend(self.outer.finish());
        out
    }

    fn emits_done(&self) -> bool {
        self.outer.emits_done()
    }

    fn usage(&self) -> Usage {
        // The inner rewriter saw the upstream's real usage fields.
        let inner = self.inner.usage();
        if inner.total_tokens > 0 {
            inner
        } else {
            self.outer.usage()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accumulator_merges_fragments() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(0, Some("call_1"), Some("get_weather"), Some("{\"lo"));
        acc.push(0, None, None, Some("cation\":\"SF\"}"));
        acc.push(1, Some("call_2"), Some("search"), None);

        let calls = acc.drain_ordered();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, "{\"location\":\"SF\"}");
        assert_eq!(calls[1].name, "search");
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn frame_decoder_pairs_events_with_data() {
        let mut dec = FrameDecoder::default();
        let frames = dec
            .push(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\ndata: {\"a\":1}\n\n")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.as_deref(), Some("message_start"));
        assert_eq!(frames[1].0, None);
    }

    #[test]
    fn frame_decoder_handles_split_reads() {
        let mut dec = FrameDecoder::default();
        assert!(dec.push(b"data: {\"id\":").unwrap().is_empty());
        let frames = dec.push(b"1}\n").unwrap();
        assert_eq!(frames, vec![(None, "{\"id\":1}".to_string())]);
    }

    #[test]
    fn chat_passthrough_tracks_usage_chunk() {
        let mut rw = ChatPassthrough::new(10);
        rw.on_frame(
            None,
            &json!({"choices": [{"delta": {"content": "hello world"}}]}),
        );
        // Estimates are used until a real usage chunk shows up.
        assert!(rw.usage().completion_tokens > 0);

        rw.on_frame(
            None,
            &json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 2}}),
        );
        let usage = rw.usage();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 5);
    }

    #[test]
    fn claude_passthrough_reads_both_usage_events() {
        let mut rw = ClaudePassthrough::new(1);
        rw.on_frame(
            Some("message_start"),
            &json!({"type": "message_start", "message": {"usage": {
                "input_tokens": 7, "cache_read_input_tokens": 3}}}),
        );
        rw.on_frame(
            Some("message_delta"),
            &json!({"type": "message_delta", "usage": {"output_tokens": 9}}),
        );
        let usage = rw.usage();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.prompt_tokens_details.cached_tokens, 3);
        assert_eq!(usage.completion_tokens, 9);
        assert!(!rw.emits_done());
    }

    #[test]
    fn sse_frame_shapes() {
        assert_eq!(
            sse_frame(None, &json!({"a": 1})),
            "data: {\"a\":1}\n\n"
        );
        assert_eq!(
            sse_frame(Some("message_stop"), &json!({"type": "message_stop"})),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }
}
