//! Chat / Claude Messages -> Gemini conversion.
//!
//! Gemini speaks `contents`/`parts` with camelCase config. Requests convert
//! from the internal Chat representation; Claude requests are lowered to
//! Chat first, then through here. Responses and streams rewrite back into
//! whichever shape the client asked in.

use serde_json::{json, Map, Value};

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::meta::{estimate_tokens, Usage};
use crate::relay::stream::{sse_frame, SseRewriter, StreamPhase};

use super::claude::{chat_response_to_claude, ChatToClaudeStream};

// ============================================================================
// Request conversion
// ============================================================================

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    (!data.is_empty()).then(|| (mime.to_string(), data.to_string()))
}

fn chat_content_to_gemini_parts(content: &Value) -> RelayResult<Vec<Value>> {
    let mut parts = Vec::new();
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
        }
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(json!({"text": text}));
                        }
                    }
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        match parse_data_url(url) {
                            Some((mime, data)) => parts.push(json!({
                                "inlineData": {"mimeType": mime, "data": data}
                            })),
                            None => parts.push(json!({
                                "fileData": {"fileUri": url}
                            })),
                        }
                    }
                    Some(other) => {
                        return Err(RelayError::UnsupportedContentBlock(format!(
                            "content part type '{}' cannot reach Gemini",
                            other
                        )))
                    }
                    None => {}
                }
            }
        }
        _ => {}
    }
    Ok(parts)
}

fn chat_tools_to_gemini(tools: &Value) -> Option<Value> {
    let mut declarations = Vec::new();
    for tool in tools.as_array()? {
        if tool.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let function = tool.get("function")?;
        let name = function.get("name").and_then(Value::as_str)?;
        let mut decl = Map::new();
        decl.insert("name".into(), Value::String(name.to_string()));
        if let Some(desc) = function.get("description") {
            decl.insert("description".into(), desc.clone());
        }
        if let Some(params) = function.get("parameters") {
            decl.insert("parameters".into(), params.clone());
        }
        declarations.push(Value::Object(decl));
    }
    (!declarations.is_empty()).then(|| json!([{"functionDeclarations": declarations}]))
}

fn chat_tool_choice_to_gemini(choice: &Value) -> Option<Value> {
    let (mode, names) = match choice {
        Value::String(raw) => match raw.to_ascii_lowercase().as_str() {
            "auto" => ("AUTO", None),
            "none" => ("NONE", None),
            "required" => ("ANY", None),
            _ => return None,
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)?;
            ("ANY", Some(vec![name.to_string()]))
        }
        _ => return None,
    };
    let mut config = Map::new();
    config.insert("mode".into(), Value::String(mode.to_string()));
    if let Some(names) = names {
        config.insert(
            "allowedFunctionNames".into(),
            Value::Array(names.into_iter().map(Value::String).collect()),
        );
    }
    Some(json!({"functionCallingConfig": config}))
}

fn generation_config(payload: &Value) -> Option<Value> {
    let mut config = Map::new();
    if let Some(v) = payload.get("temperature") {
        config.insert("temperature".into(), v.clone());
    }
    if let Some(v) = payload.get("top_p") {
        config.insert("topP".into(), v.clone());
    }
    if let Some(v) = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
    {
        config.insert("maxOutputTokens".into(), v.clone());
    }
    if let Some(stop) = payload.get("stop") {
        let sequences = match stop {
            Value::String(text) => json!([text]),
            other => other.clone(),
        };
        config.insert("stopSequences".into(), sequences);
    }
    (!config.is_empty()).then(|| Value::Object(config))
}

/// Chat request -> Gemini generateContent request. The model travels in the
/// URL, not the body.
pub fn chat_to_gemini_request(payload: &Value) -> RelayResult<Value> {
    let mut out = Map::new();
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents = Vec::new();

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for msg in messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");

            if role.eq_ignore_ascii_case("system") {
                if let Some(text) = msg.get("content").and_then(Value::as_str) {
                    system_parts.push(json!({"text": text}));
                }
                continue;
            }

            if role.eq_ignore_ascii_case("tool") {
                // Tool results come back as function responses from the
                // user side.
                let name = msg
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or("tool");
                let content = msg.get("content").and_then(Value::as_str).unwrap_or("");
                contents.push(json!({
                    "role": "user",
                    "parts": [{"functionResponse": {
                        "name": name,
                        "response": {"result": content},
                    }}],
                }));
                continue;
            }

            let gemini_role = if role.eq_ignore_ascii_case("assistant") {
                "model"
            } else {
                "user"
            };
            let mut parts = Vec::new();
            if let Some(content) = msg.get("content") {
                parts.extend(chat_content_to_gemini_parts(content)?);
            }
            if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let name = call
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("tool");
                    let args_raw = call
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let args = serde_json::from_str::<Value>(args_raw)
                        .unwrap_or_else(|_| Value::String(args_raw.to_string()));
                    parts.push(json!({"functionCall": {"name": name, "args": args}}));
                }
            }
            if !parts.is_empty() {
                contents.push(json!({"role": gemini_role, "parts": parts}));
            }
        }
    }

    out.insert("contents".into(), Value::Array(contents));
    if !system_parts.is_empty() {
        out.insert(
            "systemInstruction".into(),
            json!({"parts": system_parts}),
        );
    }
    if let Some(config) = generation_config(payload) {
        out.insert("generationConfig".into(), config);
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = chat_tools_to_gemini(tools) {
            out.insert("tools".into(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        if let Some(mapped) = chat_tool_choice_to_gemini(choice) {
            out.insert("toolConfig".into(), mapped);
        }
    }

    Ok(Value::Object(out))
}

// ============================================================================
// Response conversion
// ============================================================================

fn gemini_finish_to_chat(reason: &str) -> &'static str {
    match reason.to_ascii_uppercase().as_str() {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}

/// Usage from `usageMetadata`.
pub fn gemini_usage(response: &Value) -> Usage {
    let Some(meta) = response.get("usageMetadata") else {
        return Usage::default();
    };
    let mut usage = Usage::new(
        meta.get("promptTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        meta.get("candidatesTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    );
    usage.prompt_tokens_details.cached_tokens = meta
        .get("cachedContentTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    usage
}

struct ExtractedCandidate {
    text: String,
    tool_calls: Vec<Value>,
    finish_reason: Option<String>,
}

fn extract_candidate(response: &Value) -> ExtractedCandidate {
    let mut out = ExtractedCandidate {
        text: String::new(),
        tool_calls: Vec::new(),
        finish_reason: None,
    };
    let Some(candidate) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return out;
    };
    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        out.finish_reason = Some(reason.to_string());
    }
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            // Thought parts stay internal.
            if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.text.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                let args = call.get("args").cloned().unwrap_or(json!({}));
                out.tool_calls.push(json!({
                    "id": format!("call_{}", out.tool_calls.len()),
                    "type": "function",
                    "function": {
                        "name": call.get("name").and_then(Value::as_str).unwrap_or("tool"),
                        "arguments": serde_json::to_string(&args)
                            .unwrap_or_else(|_| "{}".into()),
                    },
                }));
            }
        }
    }
    out
}

/// Gemini JSON response -> Chat response.
pub fn gemini_response_to_chat(response: &Value, model: &str) -> Value {
    let candidate = extract_candidate(response);
    let usage = gemini_usage(response);

    let finish_reason = if !candidate.tool_calls.is_empty() {
        "tool_calls".to_string()
    } else {
        gemini_finish_to_chat(candidate.finish_reason.as_deref().unwrap_or("STOP")).to_string()
    };

    let mut message = Map::new();
    message.insert("role".into(), Value::String("assistant".into()));
    message.insert("content".into(), Value::String(candidate.text));
    if !candidate.tool_calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(candidate.tool_calls));
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }
    })
}

/// Gemini JSON response -> Claude Messages response, via the Chat shape so
/// tool calls and stop reasons map once.
pub fn gemini_response_to_claude(response: &Value, model: &str) -> Value {
    chat_response_to_claude(&gemini_response_to_chat(response, model), model)
}

// ============================================================================
// Stream rewriters
// ============================================================================

/// Shared Gemini stream state: converts each streamGenerateContent event
/// into zero or more Chat chunk payloads.
struct GeminiChunkState {
    chunk_id: String,
    created: i64,
    model: String,
    usage: Usage,
    saw_usage: bool,
    estimated_completion: i64,
    finish_reason: Option<String>,
    started: bool,
}

impl GeminiChunkState {
    fn new(model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            usage: Usage::new(estimated_prompt_tokens, 0),
            saw_usage: false,
            estimated_completion: 0,
            finish_reason: None,
            started: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.chunk_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }

    fn on_event(&mut self, data: &Value) -> Vec<Value> {
        let mut chunks = Vec::new();
        if !self.started {
            self.started = true;
            chunks.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
        }

        let streamed_usage = gemini_usage(data);
        if streamed_usage.total_tokens > 0 {
            self.usage = streamed_usage;
            self.saw_usage = true;
        }

        let candidate = extract_candidate(data);
        if !candidate.text.is_empty() {
            self.estimated_completion += estimate_tokens(&candidate.text);
            chunks.push(self.chunk(json!({"content": candidate.text}), None));
        }
        for (i, call) in candidate.tool_calls.into_iter().enumerate() {
            let mut with_index = call;
            with_index["index"] = json!(i);
            chunks.push(self.chunk(json!({"tool_calls": [with_index]}), None));
            self.finish_reason = Some("tool_calls".into());
        }
        if let Some(reason) = candidate.finish_reason {
            if self.finish_reason.is_none() {
                self.finish_reason = Some(gemini_finish_to_chat(&reason).to_string());
            }
        }
        chunks
    }

    fn usage(&self) -> Usage {
        let mut usage = self.usage.clone();
        if !self.saw_usage {
            usage.completion_tokens = self.estimated_completion;
        }
        usage.recompute_total();
        usage
    }
}

/// Gemini stream -> Chat chunks for Chat clients.
pub struct GeminiToChatStream {
    phase: StreamPhase,
    state: GeminiChunkState,
    emitted_terminal: bool,
}

impl GeminiToChatStream {
    pub fn new(model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            phase: StreamPhase::Idle,
            state: GeminiChunkState::new(model, estimated_prompt_tokens),
            emitted_terminal: false,
        }
    }
}

impl SseRewriter for GeminiToChatStream {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        self.phase = StreamPhase::InContentBlock;
        self.state
            .on_event(data)
            .into_iter()
            .map(|chunk| sse_frame(None, &chunk))
            .collect()
    }

    fn finish(&mut self) -> Vec<String> {
        if self.emitted_terminal {
            return Vec::new();
        }
        self.emitted_terminal = true;
        self.phase = StreamPhase::Finishing;
        let reason = self
            .state
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".into());
        let usage = self.state.usage();
        vec![
            sse_frame(None, &self.state.chunk(json!({}), Some(&reason))),
            sse_frame(
                None,
                &json!({
                    "id": self.state.chunk_id,
                    "object": "chat.completion.chunk",
                    "created": self.state.created,
                    "model": self.state.model,
                    "choices": [],
                    "usage": {
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                        "total_tokens": usage.total_tokens,
                    },
                }),
            ),
        ]
    }

    fn usage(&self) -> Usage {
        self.state.usage()
    }
}

/// Gemini stream -> Claude events: lower each Gemini event to Chat chunks,
/// then reuse the Chat->Claude rewriter so block bookkeeping lives in one
/// place.
pub struct GeminiToClaudeStream {
    state: GeminiChunkState,
    claude: ChatToClaudeStream,
}

impl GeminiToClaudeStream {
    pub fn new(model: &str, estimated_prompt_tokens: i64) -> Self {
        Self {
            state: GeminiChunkState::new(model, estimated_prompt_tokens),
            claude: ChatToClaudeStream::new(model, estimated_prompt_tokens),
        }
    }
}

impl SseRewriter for GeminiToClaudeStream {
    fn on_frame(&mut self, _event: Option<&str>, data: &Value) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in self.state.on_event(data) {
            out.extend(self.claude.on_frame(None, &chunk));
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        // Hand the terminal finish_reason to the Claude rewriter so its
        // message_delta carries the right stop reason.
        if let Some(reason) = self.state.finish_reason.clone() {
            let terminal = self
                .state
                .chunk(json!({}), Some(reason.as_str()));
            let mut out = self.claude.on_frame(None, &terminal);
            out.extend(self.claude.finish());
            return out;
        }
        self.claude.finish()
    }

    fn emits_done(&self) -> bool {
        false
    }

    fn usage(&self) -> Usage {
        // Prefer Gemini's usageMetadata; the Claude rewriter only estimates.
        let gemini_usage = self.state.usage();
        if gemini_usage.total_tokens > 0 {
            gemini_usage
        } else {
            self.claude.usage()
        }
    }
}
