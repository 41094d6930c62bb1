//! Relay controllers.
//!
//! One orchestration function per endpoint family. Each ties the pipeline
//! together: authenticate through the store, pick a channel, build the
//! request meta, resolve pricing, validate tools, pre-consume quota,
//! convert and issue the upstream request, rewrite the answer, and hand
//! usage to the detached post-consume.

pub mod adaptor;
pub mod autoroute;
pub mod client;
pub mod convert;
pub mod detect;
pub mod error;
pub mod limits;
pub mod meta;
pub mod quota;
pub mod stream;
pub mod tasks;
pub mod toolcost;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::logger;
use crate::metrics::{MetricEvent, Recorder};
use crate::pricing::{ModelPricing, PricingCatalog};
use crate::store::{ChannelRow, Store, TokenRow, UserRow};

use adaptor::{Adaptor, Endpoint};
use detect::PayloadFormat;
use error::{RelayError, RelayResult};
use meta::{estimate_tokens, RelayMeta, RequestState, RewriteMode, Usage};
use quota::PreConsumed;
use stream::{ComposedStream, SseRewriter};
use toolcost::ToolPolicy;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<PricingCatalog>,
    pub recorder: Arc<dyn Recorder>,
}

/// Public router with the full API surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses_endpoint))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/images/edits", post(images_edits))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/videos", post(videos_create))
        .route("/v1/videos/:id", get(videos_status))
        .route("/v2/rerank", post(rerank))
        .route("/v1/moderations", post(moderations))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:id", get(get_model))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(client::MAX_REQUEST_BODY))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ============================================================================
// Shared pipeline pieces
// ============================================================================

/// Which public protocol the client is speaking; decides the error
/// envelope and the response rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextFamily {
    Chat,
    Responses,
    Claude,
}

impl TextFamily {
    fn payload_format(self) -> PayloadFormat {
        match self {
            TextFamily::Chat => PayloadFormat::Chat,
            TextFamily::Responses => PayloadFormat::Responses,
            TextFamily::Claude => PayloadFormat::Claude,
        }
    }

    fn from_format(format: PayloadFormat) -> Option<Self> {
        match format {
            PayloadFormat::Chat => Some(TextFamily::Chat),
            PayloadFormat::Responses => Some(TextFamily::Responses),
            PayloadFormat::Claude => Some(TextFamily::Claude),
            PayloadFormat::Unknown => None,
        }
    }

    fn request_path(self) -> &'static str {
        match self {
            TextFamily::Chat => "/v1/chat/completions",
            TextFamily::Responses => "/v1/responses",
            TextFamily::Claude => "/v1/messages",
        }
    }

    fn render_error(self, err: RelayError) -> Response {
        match self {
            TextFamily::Claude => err.into_claude_response(),
            _ => err.into_response(),
        }
    }
}

fn parse_body(body: &Bytes) -> RelayResult<Value> {
    if body.is_empty() {
        return Err(RelayError::MalformedRequest("empty request body".into()));
    }
    serde_json::from_slice(body)
        .map_err(|e| RelayError::MalformedRequest(format!("invalid JSON: {}", e)))
}

fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Token lookup through the store seam. The auth middleware proper lives
/// outside the core; this is the minimal contract it fulfills.
fn authenticate(state: &AppState, headers: &HeaderMap) -> RelayResult<(TokenRow, UserRow)> {
    let key = bearer_or_api_key(headers)
        .ok_or_else(|| RelayError::AuthFailed("missing API key".into()))?;
    let token = state
        .store
        .token_by_key(&key)
        .map_err(|_| RelayError::AuthFailed("unknown API key".into()))?;
    if !token.enabled {
        return Err(RelayError::AuthFailed("token is disabled".into()));
    }
    let user = state
        .store
        .user(token.user_id)
        .map_err(|_| RelayError::AuthFailed("token owner not found".into()))?;
    if !user.enabled {
        return Err(RelayError::Forbidden("user is disabled".into()));
    }
    Ok((token, user))
}

/// Weighted channel choice: highest priority tier first, weighted random
/// inside the tier. Once chosen the request is committed to this channel.
fn pick_channel(store: &Arc<dyn Store>, model: &str, group: &str) -> RelayResult<ChannelRow> {
    let channels = store.channels_for_model(model, group)?;
    if channels.is_empty() {
        return Err(RelayError::ModelNotAvailable(format!(
            "no enabled channel serves model '{}' for group '{}'",
            model, group
        )));
    }
    let top = channels.iter().map(|c| c.priority).max().unwrap_or(0);
    let tier: Vec<ChannelRow> = channels
        .into_iter()
        .filter(|c| c.priority == top)
        .collect();
    let total_weight: u64 = tier.iter().map(|c| c.weight.max(1) as u64).sum();
    let mut roll = {
        use rand::Rng;
        rand::thread_rng().gen_range(0..total_weight)
    };
    for channel in &tier {
        let w = channel.weight.max(1) as u64;
        if roll < w {
            return Ok(channel.clone());
        }
        roll -= w;
    }
    Ok(tier.into_iter().next().expect("tier is non-empty"))
}

fn is_streaming(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

fn extract_model(payload: &Value) -> RelayResult<String> {
    payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::MalformedRequest("missing or empty 'model' field".into()))
}

fn build_meta(
    state: &AppState,
    token: &TokenRow,
    user: &UserRow,
    channel: &ChannelRow,
    origin_model: &str,
    request_path: &str,
    is_stream: bool,
) -> RelayMeta {
    RelayMeta {
        api_type: channel.channel_type.api_type(),
        channel_type: channel.channel_type,
        channel_id: channel.id,
        user_id: user.id,
        token_id: token.id,
        token_name: token.name.clone(),
        group: user.group.clone(),
        origin_model: origin_model.to_string(),
        actual_model: channel.map_model(origin_model),
        model_mapping: channel.model_mapping.clone(),
        request_path: request_path.to_string(),
        is_stream,
        start_time: Instant::now(),
        prompt_tokens: 0,
        base_url: channel.base_url.clone(),
        key: channel.key.clone(),
        group_ratio: state.catalog.group_ratio(&user.group),
        response_api_fallback: false,
        claude_conversion: false,
        claude_native: false,
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().simple().to_string(),
    }
}

fn estimate_prompt_tokens(family: TextFamily, payload: &Value) -> i64 {
    let mut text = String::new();
    if let Some(messages) = payload.get("messages") {
        text.push_str(&messages.to_string());
    }
    if let Some(input) = payload.get("input") {
        text.push_str(&input.to_string());
    }
    if let Some(system) = payload.get("system") {
        text.push_str(&system.to_string());
    }
    if family == TextFamily::Responses {
        if let Some(instructions) = payload.get("instructions") {
            text.push_str(&instructions.to_string());
        }
    }
    estimate_tokens(&text)
}

fn requested_max_tokens(payload: &Value) -> Option<i64> {
    payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .or_else(|| payload.get("max_output_tokens"))
        .and_then(Value::as_i64)
}

/// Wire plan for one text request: where it goes, what leaves the gateway,
/// and how the answer comes back.
struct WirePlan {
    endpoint: Endpoint,
    body: Value,
    json_modes: Vec<RewriteMode>,
    rewriter: Box<dyn SseRewriter>,
}

fn prepare_wire(
    family: TextFamily,
    adaptor: &Adaptor,
    meta: &mut RelayMeta,
    req_state: &mut RequestState,
    payload: &Value,
) -> RelayResult<WirePlan> {
    use self::meta::ApiType;

    let est = {
        // Converted prompts keep the same text volume; the inbound estimate
        // stands for every wire shape.
        meta.prompt_tokens
    };

    let plan = match family {
        TextFamily::Chat => match meta.api_type {
            ApiType::OpenAI | ApiType::Azure => {
                let upgrade = meta.channel_type.supports_native_responses()
                    && !convert::responses::chat_only_model(&meta.actual_model)
                    && meta.request_path.starts_with("/v1/chat/completions");
                if upgrade {
                    req_state.rewrite = RewriteMode::ResponsesToChat;
                    WirePlan {
                        endpoint: Endpoint::Responses,
                        body: convert::responses::chat_to_responses_request(
                            payload,
                            &meta.actual_model,
                        )?,
                        json_modes: vec![RewriteMode::ResponsesToChat],
                        rewriter: Box::new(convert::responses::ResponsesToChatStream::new(
                            &meta.origin_model,
                            est,
                        )),
                    }
                } else {
                    WirePlan {
                        endpoint: Endpoint::Chat,
                        body: adaptor.convert_request(meta, req_state, payload)?,
                        json_modes: vec![],
                        rewriter: Box::new(stream::ChatPassthrough::new(est)),
                    }
                }
            }
            ApiType::Anthropic | ApiType::Bedrock => {
                req_state.rewrite = RewriteMode::ClaudeToChat;
                WirePlan {
                    endpoint: Endpoint::ClaudeMessages,
                    body: adaptor.convert_request(meta, req_state, payload)?,
                    json_modes: vec![RewriteMode::ClaudeToChat],
                    rewriter: Box::new(convert::claude::ClaudeToChatStream::new(
                        &meta.origin_model,
                        est,
                    )),
                }
            }
            ApiType::Gemini | ApiType::VertexAI => {
                req_state.rewrite = RewriteMode::GeminiToChat;
                WirePlan {
                    endpoint: Endpoint::Chat,
                    body: adaptor.convert_request(meta, req_state, payload)?,
                    json_modes: vec![RewriteMode::GeminiToChat],
                    rewriter: Box::new(convert::gemini::GeminiToChatStream::new(
                        &meta.origin_model,
                        est,
                    )),
                }
            }
        },
        TextFamily::Responses => {
            if meta.channel_type.supports_native_responses() {
                let mut body = payload.clone();
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("model".into(), Value::String(meta.actual_model.clone()));
                }
                WirePlan {
                    endpoint: Endpoint::Responses,
                    body,
                    json_modes: vec![],
                    rewriter: Box::new(convert::responses::ResponsesPassthrough::new(est)),
                }
            } else {
                // Downgrade to Chat; the rewriters re-emit Responses shapes
                // and billing keeps reporting the model the client named.
                meta.response_api_fallback = true;
                req_state.rewrite = RewriteMode::ChatToResponses;
                let chat = convert::responses::responses_to_chat_request(
                    payload,
                    &meta.actual_model,
                )?;
                let outer: Box<dyn SseRewriter> = Box::new(
                    convert::responses::ChatToResponsesStream::new(&meta.origin_model, est),
                );
                match meta.api_type {
                    ApiType::Anthropic | ApiType::Bedrock => WirePlan {
                        endpoint: Endpoint::ClaudeMessages,
                        body: adaptor.convert_request(meta, req_state, &chat)?,
                        json_modes: vec![
                            RewriteMode::ClaudeToChat,
                            RewriteMode::ChatToResponses,
                        ],
                        rewriter: Box::new(ComposedStream::new(
                            Box::new(convert::claude::ClaudeToChatStream::new(
                                &meta.origin_model,
                                est,
                            )),
                            outer,
                        )),
                    },
                    ApiType::Gemini | ApiType::VertexAI => WirePlan {
                        endpoint: Endpoint::Chat,
                        body: adaptor.convert_request(meta, req_state, &chat)?,
                        json_modes: vec![
                            RewriteMode::GeminiToChat,
                            RewriteMode::ChatToResponses,
                        ],
                        rewriter: Box::new(ComposedStream::new(
                            Box::new(convert::gemini::GeminiToChatStream::new(
                                &meta.origin_model,
                                est,
                            )),
                            outer,
                        )),
                    },
                    _ => WirePlan {
                        endpoint: Endpoint::Chat,
                        body: adaptor.convert_request(meta, req_state, &chat)?,
                        json_modes: vec![RewriteMode::ChatToResponses],
                        rewriter: outer,
                    },
                }
            }
        }
        TextFamily::Claude => match meta.api_type {
            ApiType::Anthropic | ApiType::Bedrock => {
                meta.claude_native = true;
                WirePlan {
                    endpoint: Endpoint::ClaudeMessages,
                    body: adaptor.convert_claude_request(meta, req_state, payload)?,
                    json_modes: vec![],
                    rewriter: Box::new(stream::ClaudePassthrough::new(est)),
                }
            }
            ApiType::Gemini | ApiType::VertexAI => {
                meta.claude_conversion = true;
                req_state.rewrite = RewriteMode::GeminiToClaude;
                WirePlan {
                    endpoint: Endpoint::Chat,
                    body: adaptor.convert_claude_request(meta, req_state, payload)?,
                    json_modes: vec![RewriteMode::GeminiToClaude],
                    rewriter: Box::new(convert::gemini::GeminiToClaudeStream::new(
                        &meta.origin_model,
                        est,
                    )),
                }
            }
            _ => {
                meta.claude_conversion = true;
                req_state.rewrite = RewriteMode::ChatToClaude;
                WirePlan {
                    endpoint: Endpoint::Chat,
                    body: adaptor.convert_claude_request(meta, req_state, payload)?,
                    json_modes: vec![RewriteMode::ChatToClaude],
                    rewriter: Box::new(convert::claude::ChatToClaudeStream::new(
                        &meta.origin_model,
                        est,
                    )),
                }
            }
        },
    };
    Ok(plan)
}

/// Usage extraction for passthrough JSON bodies, keyed by what the wire
/// actually spoke.
fn passthrough_usage(family: TextFamily, body: &Value) -> Usage {
    match family {
        TextFamily::Chat => {
            let mut usage = Usage::default();
            stream::apply_chat_usage(&mut usage, body);
            usage
        }
        TextFamily::Responses => convert::responses::responses_usage(body),
        TextFamily::Claude => convert::claude::claude_usage(body),
    }
}

/// Built-in tool invocation counts an upstream reported in its response
/// body; merged with whatever the stream rewriters counted.
fn count_tool_invocations(body: &Value) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    // Claude: usage.server_tool_use.web_search_requests
    if let Some(n) = body
        .get("usage")
        .and_then(|u| u.get("server_tool_use"))
        .and_then(|s| s.get("web_search_requests"))
        .and_then(Value::as_i64)
    {
        if n > 0 {
            counts.insert("web_search".to_string(), n);
        }
    }
    // Responses: output items per built-in call
    if let Some(output) = body.get("output").and_then(Value::as_array) {
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("web_search_call") => {
                    *counts.entry("web_search".to_string()).or_insert(0) += 1;
                }
                Some("file_search_call") => {
                    *counts.entry("file_search".to_string()).or_insert(0) += 1;
                }
                Some("code_interpreter_call") => {
                    *counts.entry("code_interpreter".to_string()).or_insert(0) += 1;
                }
                _ => {}
            }
        }
    }
    counts
}

// ============================================================================
// Text endpoint families (chat / responses / claude)
// ============================================================================

async fn chat_completions(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_text(state, uri, headers, body, TextFamily::Chat).await
}

async fn responses_endpoint(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_text(state, uri, headers, body, TextFamily::Responses).await
}

async fn claude_messages(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_text(state, uri, headers, body, TextFamily::Claude).await
}

async fn dispatch_text(
    state: AppState,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    family: TextFamily,
) -> Response {
    let payload = match parse_body(&body) {
        Ok(p) => p,
        Err(e) => return family.render_error(e),
    };

    match autoroute::decide(family.payload_format(), &payload, false) {
        autoroute::RouteDecision::Proceed => relay_text(&state, &headers, payload, family).await,
        autoroute::RouteDecision::Rehandle(detected) => {
            // One internal re-dispatch into the canonical handler.
            let target = TextFamily::from_format(detected).unwrap_or(family);
            relay_text(&state, &headers, payload, target).await
        }
        autoroute::RouteDecision::Redirect(location) => {
            let target = match uri.query() {
                Some(q) => format!("{}?{}", location, q),
                None => location.to_string(),
            };
            Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, target)
                .body(axum::body::Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

async fn relay_text(
    state: &AppState,
    headers: &HeaderMap,
    payload: Value,
    family: TextFamily,
) -> Response {
    match relay_text_inner(state, headers, payload, family).await {
        Ok(response) => response,
        Err(e) => family.render_error(e),
    }
}

async fn relay_text_inner(
    state: &AppState,
    headers: &HeaderMap,
    payload: Value,
    family: TextFamily,
) -> RelayResult<Response> {
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let is_stream = is_streaming(&payload);
    let mut meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        family.request_path(),
        is_stream,
    );
    meta.prompt_tokens = estimate_prompt_tokens(family, &payload);

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let policy = ToolPolicy::merge(channel.tooling.as_ref(), &adaptor.default_tooling(), &pricing);
    let builtins = toolcost::builtin_tools_in_request(&payload, family.payload_format());
    policy.validate(&builtins)?;

    let estimated = quota::estimate_chat_quota(
        &pricing,
        meta.prompt_tokens,
        requested_max_tokens(&payload),
        meta.group_ratio,
    );
    let pre = quota::pre_consume(&state.store, &meta, estimated)?;

    match relay_text_upstream(state, &adaptor, meta, payload, family, pricing, policy, pre).await {
        Ok(response) => Ok(response),
        Err((meta, e)) => {
            quota::refund(&state.store, &meta, pre);
            state.recorder.emit(MetricEvent::RequestFailed {
                model: meta.origin_model.clone(),
                channel_id: meta.channel_id,
                status: e.status().as_u16(),
            });
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay_text_upstream(
    state: &AppState,
    adaptor: &Adaptor,
    mut meta: RelayMeta,
    payload: Value,
    family: TextFamily,
    pricing: ModelPricing,
    policy: ToolPolicy,
    pre: PreConsumed,
) -> Result<Response, (RelayMeta, RelayError)> {
    let mut req_state = RequestState::default();
    let plan = match prepare_wire(family, adaptor, &mut meta, &mut req_state, &payload) {
        Ok(plan) => plan,
        Err(e) => return Err((meta, e)),
    };
    req_state.converted_request = Some(plan.body.clone());

    logger::info(
        "relay",
        &format!(
            "request started: family={:?}, model={} -> {}, channel={} ({}), stream={}",
            family,
            meta.origin_model,
            meta.actual_model,
            meta.channel_id,
            adaptor.channel_name(&meta),
            meta.is_stream
        ),
    );

    let upstream = match adaptor.do_request(&meta, &plan.endpoint, &plan.body).await {
        Ok(r) => r,
        Err(e) => return Err((meta, e)),
    };

    let status = upstream.status();
    if !status.is_success() {
        let (status, body) = match client::read_json_body(upstream).await {
            Ok(v) => v,
            Err(e) => return Err((meta, e)),
        };
        return Err((meta, RelayError::Upstream { status, body }));
    }

    if meta.is_stream {
        let store = Arc::clone(&state.store);
        let recorder = Arc::clone(&state.recorder);
        let cfg_quota_per_usd = crate::config::load().quota_per_usd;
        let meta_for_billing = meta.clone();
        let response = stream::sse_response(upstream, plan.rewriter, move |mut usage| {
            // Client disconnects land here too; whatever usage accumulated
            // is billed, nothing is refunded.
            if usage.prompt_tokens == 0 {
                usage.prompt_tokens = meta_for_billing.prompt_tokens;
                usage.recompute_total();
            }
            let summary =
                toolcost::reconcile_tool_costs(&policy, &req_state.tool_invocations, cfg_quota_per_usd);
            usage.tools_cost = summary.total_cost;
            quota::spawn_post_consume(store, recorder, meta_for_billing, pricing, usage, pre);
        });
        Ok(response)
    } else {
        let (_, body) = match client::read_json_body(upstream).await {
            Ok(v) => v,
            Err(e) => return Err((meta, e)),
        };

        let mut usage = passthrough_usage(wire_family(family, &plan.json_modes), &body);
        let mut out_body = body.clone();
        for mode in &plan.json_modes {
            let (rewritten, mode_usage) = adaptor::rewrite_json_response(*mode, &meta, &out_body);
            if usage.total_tokens == 0 {
                usage = mode_usage;
            }
            out_body = rewritten;
        }
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = meta.prompt_tokens;
            usage.recompute_total();
        }

        let mut counts = count_tool_invocations(&body);
        for (name, n) in &req_state.tool_invocations {
            *counts.entry(name.clone()).or_insert(0) += n;
        }
        let summary = toolcost::reconcile_tool_costs(
            &policy,
            &counts,
            crate::config::load().quota_per_usd,
        );
        usage.tools_cost = summary.total_cost;
        req_state.tool_cost_summary = Some(summary);
        req_state.usage = usage.clone();

        quota::spawn_post_consume(
            Arc::clone(&state.store),
            Arc::clone(&state.recorder),
            meta.clone(),
            pricing,
            usage,
            pre,
        );
        Ok(Json(out_body).into_response())
    }
}

/// The wire format of the raw upstream body, before JSON rewrites run.
fn wire_family(client_family: TextFamily, json_modes: &[RewriteMode]) -> TextFamily {
    match json_modes.first() {
        None => client_family,
        Some(RewriteMode::ClaudeToChat) => TextFamily::Claude,
        Some(RewriteMode::ResponsesToChat) => TextFamily::Responses,
        Some(RewriteMode::ChatToClaude) | Some(RewriteMode::ChatToResponses) => TextFamily::Chat,
        // Gemini bodies are handled by the rewrite itself; treat as Chat so
        // the passthrough extractor finds nothing and defers.
        Some(RewriteMode::GeminiToChat) | Some(RewriteMode::GeminiToClaude) => TextFamily::Chat,
        Some(RewriteMode::Passthrough) => client_family,
    }
}

// ============================================================================
// Embeddings
// ============================================================================

async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match embeddings_inner(&state, &headers, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn embeddings_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let mut meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/embeddings",
        false,
    );
    let input_text = payload
        .get("input")
        .map(|i| i.to_string())
        .unwrap_or_default();
    meta.prompt_tokens = estimate_tokens(&input_text);

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let estimated =
        quota::estimate_chat_quota(&pricing, meta.prompt_tokens, None, meta.group_ratio);
    let pre = quota::pre_consume(&state.store, &meta, estimated)?;

    let mut wire = payload.clone();
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
    }

    let outcome = async {
        let upstream = adaptor.do_request(&meta, &Endpoint::Embeddings, &wire).await?;
        let (status, body) = client::read_json_body(upstream).await?;
        if status >= 400 {
            return Err(RelayError::Upstream { status, body });
        }
        Ok(body)
    }
    .await;

    match outcome {
        Ok(body) => {
            let mut usage = Usage::default();
            stream::apply_chat_usage(&mut usage, &body);
            if usage.prompt_tokens == 0 {
                usage.prompt_tokens = meta.prompt_tokens;
                usage.recompute_total();
            }
            quota::spawn_post_consume(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                usage,
                pre,
            );
            Ok(Json(body).into_response())
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(e)
        }
    }
}

// ============================================================================
// Images
// ============================================================================

async fn images_generations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match images_inner(&state, &headers, body, Endpoint::ImagesGenerations).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn images_edits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match images_inner(&state, &headers, body, Endpoint::ImagesEdits).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn images_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
    endpoint: Endpoint,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/images/generations",
        false,
    );

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let image_price = pricing.image.clone().unwrap_or_default();

    // Request validation against the image pricing envelope.
    let n = payload.get("n").and_then(Value::as_i64).unwrap_or(1);
    if n < image_price.min_images as i64 || n > image_price.max_images as i64 {
        return Err(RelayError::MalformedRequest(format!(
            "n must be between {} and {}",
            image_price.min_images, image_price.max_images
        )));
    }
    if let Some(prompt) = payload.get("prompt").and_then(Value::as_str) {
        if prompt.chars().count() > image_price.max_prompt_len {
            return Err(RelayError::MalformedRequest(format!(
                "prompt exceeds {} characters",
                image_price.max_prompt_len
            )));
        }
    }
    let size = payload
        .get("size")
        .and_then(Value::as_str)
        .unwrap_or("1024x1024");
    let quality = payload.get("quality").and_then(Value::as_str);

    let cfg = crate::config::load();
    let quota_cost = match pricing.per_call_quota(cfg.quota_per_usd) {
        Some(per_call) => {
            (per_call as f64 * image_price.tier(size, quality) * meta.group_ratio).ceil() as i64
                * n.max(1)
        }
        None => quota::per_unit_quota(
            image_price.usd_per_image,
            image_price.tier(size, quality),
            meta.group_ratio,
            n.max(1),
            cfg.quota_per_usd,
        ),
    };

    let pre = quota::pre_consume(&state.store, &meta, quota_cost.max(1))?;
    let wire = adaptor.convert_image_request(&meta, &payload)?;

    let outcome = async {
        let upstream = adaptor.do_request(&meta, &endpoint, &wire).await?;
        let (status, body) = client::read_json_body(upstream).await?;
        if status >= 400 {
            return Err(RelayError::Upstream { status, body });
        }
        Ok(body)
    }
    .await;

    match outcome {
        Ok(body) => {
            let mut usage = Usage::default();
            // gpt-image-1 style responses add token buckets on top of the
            // per-image price.
            let mut total = quota_cost.max(1);
            if let Some(u) = body.get("usage") {
                usage.prompt_tokens = u
                    .get("input_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                usage.completion_tokens = u
                    .get("output_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                usage.recompute_total();
                total += image_token_quota(&image_price, u, meta.group_ratio, cfg.quota_per_usd);
            }
            quota::spawn_post_consume_fixed(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                usage,
                pre,
                total,
            );
            Ok(Json(body).into_response())
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(e)
        }
    }
}

/// Token-bucket surcharge for image models that bill text/image tokens at
/// distinct USD-per-1M rates.
fn image_token_quota(
    price: &crate::pricing::ImagePrice,
    usage: &Value,
    group_ratio: f64,
    quota_per_usd: i64,
) -> i64 {
    let mut usd = 0.0;
    let details = usage.get("input_tokens_details");
    let text_tokens = details
        .and_then(|d| d.get("text_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let image_tokens = details
        .and_then(|d| d.get("image_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cached = details
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if let Some(rate) = price.text_token_usd_per_m {
        usd += (text_tokens.saturating_sub(cached)) as f64 * rate / 1_000_000.0;
    }
    if let Some(rate) = price.cached_text_token_usd_per_m {
        usd += cached as f64 * rate / 1_000_000.0;
    }
    if let Some(rate) = price.image_token_usd_per_m {
        usd += image_tokens as f64 * rate / 1_000_000.0;
    }
    if let Some(rate) = price.output_image_token_usd_per_m {
        usd += output_tokens as f64 * rate / 1_000_000.0;
    }
    if usd <= 0.0 {
        return 0;
    }
    crate::pricing::usd_to_quota(usd * group_ratio, quota_per_usd)
}

// ============================================================================
// Audio
// ============================================================================

async fn audio_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match audio_speech_inner(&state, &headers, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn audio_speech_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let mut meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/audio/speech",
        false,
    );
    let input_len = payload
        .get("input")
        .and_then(Value::as_str)
        .map(|s| s.chars().count() as i64)
        .unwrap_or(0);
    // Speech bills by input characters, expressed as tokens.
    meta.prompt_tokens = input_len.max(1);

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let estimated =
        quota::estimate_chat_quota(&pricing, meta.prompt_tokens, None, meta.group_ratio);
    let pre = quota::pre_consume(&state.store, &meta, estimated)?;

    let mut wire = payload.clone();
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
    }

    let outcome = adaptor.do_request(&meta, &Endpoint::AudioSpeech, &wire).await;
    match outcome {
        Ok(upstream) if upstream.status().is_success() => {
            // Binary audio body; copy it through with its content type.
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("audio/mpeg")
                .to_string();
            let audio = upstream.bytes().await.map_err(|e| {
                RelayError::UpstreamUnreachable(format!("failed to read audio body: {}", e))
            })?;
            let usage = Usage::new(meta.prompt_tokens, 0);
            quota::spawn_post_consume(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                usage,
                pre,
            );
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(axum::body::Body::from(audio))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
        Ok(upstream) => {
            let (status, body) = client::read_json_body(upstream).await?;
            quota::refund(&state.store, &meta, pre);
            Err(RelayError::Upstream { status, body })
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(e)
        }
    }
}

async fn audio_transcriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match audio_upload_inner(&state, &headers, body, Endpoint::AudioTranscriptions).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn audio_translations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match audio_upload_inner(&state, &headers, body, Endpoint::AudioTranslations).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

/// Multipart audio uploads are relayed byte-for-byte; the model name lives
/// in a form field the gateway leaves alone, so routing uses the
/// `x-model` hint header or falls back to whisper-1.
async fn audio_upload_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
    endpoint: Endpoint,
) -> RelayResult<Response> {
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = headers
        .get("x-model")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("whisper-1")
        .to_string();
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/audio/transcriptions",
        false,
    );

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let audio_price = pricing.audio.clone().unwrap_or_default();
    // Duration is unknown before upstream transcribes; hold one minute.
    let estimate_tokens_held = (60.0 * audio_price.tokens_per_second) as i64;
    let estimated = quota::estimate_chat_quota(
        &pricing,
        estimate_tokens_held.max(1),
        None,
        meta.group_ratio,
    );
    let pre = quota::pre_consume(&state.store, &meta, estimated)?;

    let url = adaptor.request_url(&meta, &endpoint)?;
    let mut upstream_headers = HeaderMap::new();
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        upstream_headers.insert(header::CONTENT_TYPE, ct.clone());
    }
    adaptor.setup_headers(&meta, &mut upstream_headers)?;

    let outcome = client::json_client()
        .post(&url)
        .headers(upstream_headers)
        .body(body.to_vec())
        .send()
        .await;

    match outcome {
        Ok(upstream) if upstream.status().is_success() => {
            let (_, body) = client::read_json_body(upstream).await?;
            let duration_secs = body
                .get("duration")
                .and_then(Value::as_f64)
                .unwrap_or(60.0);
            let mut usage = Usage::new(
                (duration_secs * audio_price.tokens_per_second).ceil() as i64,
                0,
            );
            usage.prompt_tokens_details.audio_tokens = usage.prompt_tokens;
            quota::spawn_post_consume(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                usage,
                pre,
            );
            Ok(Json(body).into_response())
        }
        Ok(upstream) => {
            let (status, body) = client::read_json_body(upstream).await?;
            quota::refund(&state.store, &meta, pre);
            Err(RelayError::Upstream { status, body })
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(RelayError::UpstreamUnreachable(e.to_string()))
        }
    }
}

// ============================================================================
// Video (async tasks)
// ============================================================================

async fn videos_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match videos_create_inner(&state, &headers, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn videos_create_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/videos",
        false,
    );

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let video_price = pricing.video.clone().unwrap_or_default();
    let seconds = payload
        .get("seconds")
        .or_else(|| payload.get("duration"))
        .and_then(Value::as_i64)
        .unwrap_or(5)
        .max(1);
    let resolution = payload
        .get("size")
        .or_else(|| payload.get("resolution"))
        .and_then(Value::as_str);

    let cfg = crate::config::load();
    let quota_cost = quota::per_unit_quota(
        video_price.usd_per_second,
        video_price.tier(resolution),
        meta.group_ratio,
        seconds,
        cfg.quota_per_usd,
    )
    .max(1);
    let pre = quota::pre_consume(&state.store, &meta, quota_cost)?;

    let mut wire = payload.clone();
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
    }

    let outcome = async {
        let upstream = adaptor.do_request(&meta, &Endpoint::Videos, &wire).await?;
        let (status, body) = client::read_json_body(upstream).await?;
        if status >= 400 {
            return Err(RelayError::Upstream { status, body });
        }
        Ok(body)
    }
    .await;

    match outcome {
        Ok(body) => {
            // Bind before the body reaches the client so a poll can never
            // race an absent row. The job already exists upstream, so a
            // failed insert is logged rather than turned into an error.
            if let Some(task_id) = tasks::task_id_from_response(&body) {
                if let Err(e) =
                    tasks::bind(&state.store, &meta, "video", &task_id, "POST", &payload)
                {
                    logger::error(
                        "tasks",
                        &format!("failed to bind task {}: {}", task_id, e),
                    );
                }
            }
            quota::spawn_post_consume_fixed(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                Usage::default(),
                pre,
                quota_cost,
            );
            Ok(Json(body).into_response())
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(e)
        }
    }
}

async fn videos_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match videos_status_inner(&state, &headers, &task_id).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn videos_status_inner(
    state: &AppState,
    headers: &HeaderMap,
    task_id: &str,
) -> RelayResult<Response> {
    let (token, user) = authenticate(state, headers)?;
    let binding = tasks::lookup(&state.store, task_id)?;
    if binding.user_id != user.id {
        return Err(RelayError::Forbidden("task belongs to another user".into()));
    }

    // Poll the channel that accepted the job.
    let channel = state.store.channel(binding.channel_id)?;
    let meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &binding.origin_model,
        "/v1/videos",
        false,
    );
    let adaptor = adaptor::for_api_type(meta.api_type);
    let url = adaptor.request_url(&meta, &Endpoint::VideoStatus(task_id.to_string()))?;
    let mut upstream_headers = HeaderMap::new();
    adaptor.setup_headers(&meta, &mut upstream_headers)?;

    let upstream = client::get(client::json_client(), &url, upstream_headers).await?;
    let (status, body) = client::read_json_body(upstream).await?;
    if status >= 400 {
        return Err(RelayError::Upstream { status, body });
    }

    if let Some(task_status) = body.get("status").and_then(Value::as_str) {
        tasks::reconcile_terminal(&state.store, task_id, task_status);
    }
    Ok(Json(body).into_response())
}

// ============================================================================
// Rerank + moderations
// ============================================================================

async fn rerank(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match rerank_inner(&state, &headers, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn rerank_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = extract_model(&payload)?;
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let mut meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v2/rerank",
        false,
    );
    let mut text = payload
        .get("query")
        .map(|q| q.to_string())
        .unwrap_or_default();
    if let Some(docs) = payload.get("documents") {
        text.push_str(&docs.to_string());
    }
    meta.prompt_tokens = estimate_tokens(&text);

    let adaptor = adaptor::for_api_type(meta.api_type);
    let pricing = state.catalog.resolve(
        &origin_model,
        Some(&channel.model_configs),
        &adaptor.default_model_pricing(),
    );
    let estimated =
        quota::estimate_chat_quota(&pricing, meta.prompt_tokens, None, meta.group_ratio);
    let pre = quota::pre_consume(&state.store, &meta, estimated)?;

    let mut wire = payload.clone();
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
    }

    let outcome = async {
        let upstream = adaptor.do_request(&meta, &Endpoint::Rerank, &wire).await?;
        let (status, body) = client::read_json_body(upstream).await?;
        if status >= 400 {
            return Err(RelayError::Upstream { status, body });
        }
        Ok(body)
    }
    .await;

    match outcome {
        Ok(body) => {
            let mut usage = Usage::new(meta.prompt_tokens, 0);
            if let Some(total) = body
                .get("usage")
                .and_then(|u| u.get("total_tokens"))
                .and_then(Value::as_i64)
            {
                usage = Usage::new(total, 0);
            }
            quota::spawn_post_consume(
                Arc::clone(&state.store),
                Arc::clone(&state.recorder),
                meta,
                pricing,
                usage,
                pre,
            );
            Ok(Json(body).into_response())
        }
        Err(e) => {
            quota::refund(&state.store, &meta, pre);
            Err(e)
        }
    }
}

/// Moderations are free passthrough: authenticated, routed, never billed.
async fn moderations(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match moderations_inner(&state, &headers, body).await {
        Ok(r) => r,
        Err(e) => e.into_response(),
    }
}

async fn moderations_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let payload = parse_body(&body)?;
    let (token, user) = authenticate(state, headers)?;
    let _guard = limits::acquire(token.id, user.id)?;

    let origin_model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("omni-moderation-latest")
        .to_string();
    let channel = pick_channel(&state.store, &origin_model, &user.group)?;
    let meta = build_meta(
        state,
        &token,
        &user,
        &channel,
        &origin_model,
        "/v1/moderations",
        false,
    );
    let adaptor = adaptor::for_api_type(meta.api_type);

    let mut wire = payload.clone();
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("model".into(), Value::String(meta.actual_model.clone()));
    }
    let upstream = adaptor.do_request(&meta, &Endpoint::Moderations, &wire).await?;
    let (status, body) = client::read_json_body(upstream).await?;
    if status >= 400 {
        return Err(RelayError::Upstream { status, body });
    }
    Ok(Json(body).into_response())
}

// ============================================================================
// Model catalog
// ============================================================================

fn visible_models(state: &AppState, group: &str) -> RelayResult<Vec<(String, &'static str)>> {
    let channels = state.store.list_channels()?;
    let mut seen = std::collections::BTreeMap::new();
    for channel in channels {
        if channel.status != crate::store::ChannelStatus::Enabled {
            continue;
        }
        if !channel.groups.is_empty() && !channel.groups.iter().any(|g| g == group) {
            continue;
        }
        let owner = channel.channel_type.name();
        for model in &channel.models {
            seen.entry(model.clone()).or_insert(owner);
        }
    }
    Ok(seen.into_iter().collect())
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (_, user) = match authenticate(&state, &headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let models = match visible_models(&state, &user.group) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let data: Vec<Value> = models
        .into_iter()
        .map(|(id, owned_by)| {
            json!({
                "id": id,
                "object": "model",
                "created": 1700000000,
                "owned_by": owned_by,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (_, user) = match authenticate(&state, &headers) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let models = match visible_models(&state, &user.group) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    match models.into_iter().find(|(id, _)| *id == model_id) {
        Some((id, owned_by)) => Json(json!({
            "id": id,
            "object": "model",
            "created": 1700000000,
            "owned_by": owned_by,
        }))
        .into_response(),
        None => RelayError::ModelNotAvailable(format!("model '{}' not found", model_id))
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::CapturingRecorder;
    use crate::store::{ChannelStatus, MemStore};

    fn seeded_state() -> (AppState, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        store.insert_user(UserRow {
            id: 1,
            quota: 1_000_000,
            used_quota: 0,
            group: "default".into(),
            role: "common".into(),
            enabled: true,
        });
        store.insert_token(
            TokenRow {
                id: 1,
                user_id: 1,
                name: "cli".into(),
                quota: 500_000,
                used_quota: 0,
                unlimited: false,
                enabled: true,
            },
            "sk-live",
        );
        store.insert_channel(ChannelRow {
            id: 10,
            channel_type: meta::ChannelType::Anthropic,
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
            base_url: None,
            key: "ak".into(),
            models: vec!["claude-3-5-sonnet".into()],
            groups: vec![],
            model_mapping: vec![],
            model_configs: Default::default(),
            tooling: None,
            used_quota: 0,
        });
        store.insert_channel(ChannelRow {
            id: 11,
            channel_type: meta::ChannelType::OpenAI,
            status: ChannelStatus::Enabled,
            priority: 5,
            weight: 3,
            base_url: None,
            key: "sk".into(),
            models: vec!["gpt-4o".into()],
            groups: vec![],
            model_mapping: vec![("gpt-4o".into(), "gpt-4o-2024-08-06".into())],
            model_configs: Default::default(),
            tooling: None,
            used_quota: 0,
        });
        let state = AppState {
            store: store.clone() as Arc<dyn Store>,
            catalog: Arc::new(PricingCatalog::new()),
            recorder: Arc::new(CapturingRecorder::default()),
        };
        (state, store)
    }

    fn auth_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-live".parse().unwrap());
        headers
    }

    #[test]
    fn authenticate_resolves_token_and_user() {
        let (state, _) = seeded_state();
        let (token, user) = authenticate(&state, &auth_headers()).unwrap();
        assert_eq!(token.id, 1);
        assert_eq!(user.id, 1);

        let mut bad = HeaderMap::new();
        bad.insert("x-api-key", "nope".parse().unwrap());
        assert!(matches!(
            authenticate(&state, &bad),
            Err(RelayError::AuthFailed(_))
        ));
        assert!(matches!(
            authenticate(&state, &HeaderMap::new()),
            Err(RelayError::AuthFailed(_))
        ));
    }

    #[test]
    fn pick_channel_respects_model_and_group() {
        let (state, _) = seeded_state();
        let channel = pick_channel(&state.store, "gpt-4o", "default").unwrap();
        assert_eq!(channel.id, 11);
        assert!(matches!(
            pick_channel(&state.store, "unknown-model", "default"),
            Err(RelayError::ModelNotAvailable(_))
        ));
    }

    #[test]
    fn meta_applies_model_mapping_and_preserves_origin() {
        let (state, _) = seeded_state();
        let (token, user) = authenticate(&state, &auth_headers()).unwrap();
        let channel = pick_channel(&state.store, "gpt-4o", "default").unwrap();
        let meta = build_meta(
            &state,
            &token,
            &user,
            &channel,
            "gpt-4o",
            "/v1/chat/completions",
            false,
        );
        assert_eq!(meta.origin_model, "gpt-4o");
        assert_eq!(meta.actual_model, "gpt-4o-2024-08-06");
        assert!(!meta.actual_model.is_empty());
    }

    #[test]
    fn chat_on_openai_channel_upgrades_to_responses() {
        let (state, _) = seeded_state();
        let (token, user) = authenticate(&state, &auth_headers()).unwrap();
        let channel = pick_channel(&state.store, "gpt-4o", "default").unwrap();
        let mut meta = build_meta(
            &state,
            &token,
            &user,
            &channel,
            "gpt-4o",
            "/v1/chat/completions",
            false,
        );
        let adaptor = adaptor::for_api_type(meta.api_type);
        let mut req_state = RequestState::default();
        let payload = json!({"model": "gpt-4o",
                             "messages": [{"role": "user", "content": "hi"}]});
        let plan = prepare_wire(
            TextFamily::Chat,
            &adaptor,
            &mut meta,
            &mut req_state,
            &payload,
        )
        .unwrap();
        assert_eq!(plan.endpoint, Endpoint::Responses);
        assert_eq!(plan.json_modes, vec![RewriteMode::ResponsesToChat]);
        assert!(plan.body.get("input").is_some());
    }

    #[test]
    fn responses_on_anthropic_channel_falls_back_with_two_rewrites() {
        let (state, _) = seeded_state();
        let (token, user) = authenticate(&state, &auth_headers()).unwrap();
        let channel = pick_channel(&state.store, "claude-3-5-sonnet", "default").unwrap();
        let mut meta = build_meta(
            &state,
            &token,
            &user,
            &channel,
            "claude-3-5-sonnet",
            "/v1/responses",
            false,
        );
        let adaptor = adaptor::for_api_type(meta.api_type);
        let mut req_state = RequestState::default();
        let payload = json!({"model": "claude-3-5-sonnet", "input": "hi"});
        let plan = prepare_wire(
            TextFamily::Responses,
            &adaptor,
            &mut meta,
            &mut req_state,
            &payload,
        )
        .unwrap();
        assert!(meta.response_api_fallback);
        assert_eq!(plan.endpoint, Endpoint::ClaudeMessages);
        assert_eq!(
            plan.json_modes,
            vec![RewriteMode::ClaudeToChat, RewriteMode::ChatToResponses]
        );
        // The wire body is Claude Messages shaped.
        assert!(plan.body.get("max_tokens").is_some());
        assert!(plan.body.get("input").is_none());
    }

    #[test]
    fn claude_on_anthropic_channel_is_native_passthrough() {
        let (state, _) = seeded_state();
        let (token, user) = authenticate(&state, &auth_headers()).unwrap();
        let channel = pick_channel(&state.store, "claude-3-5-sonnet", "default").unwrap();
        let mut meta = build_meta(
            &state,
            &token,
            &user,
            &channel,
            "claude-3-5-sonnet",
            "/v1/messages",
            false,
        );
        let adaptor = adaptor::for_api_type(meta.api_type);
        let mut req_state = RequestState::default();
        let payload = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}],
        });
        let plan = prepare_wire(
            TextFamily::Claude,
            &adaptor,
            &mut meta,
            &mut req_state,
            &payload,
        )
        .unwrap();
        assert!(meta.claude_native);
        assert!(plan.json_modes.is_empty());
        assert_eq!(plan.body["messages"], payload["messages"]);
    }

    #[test]
    fn tool_counts_from_upstream_bodies() {
        let claude_body = json!({
            "usage": {"server_tool_use": {"web_search_requests": 2}},
        });
        let counts = count_tool_invocations(&claude_body);
        assert_eq!(counts.get("web_search"), Some(&2));

        let responses_body = json!({
            "output": [
                {"type": "web_search_call"},
                {"type": "message"},
                {"type": "code_interpreter_call"},
            ],
        });
        let counts = count_tool_invocations(&responses_body);
        assert_eq!(counts.get("web_search"), Some(&1));
        assert_eq!(counts.get("code_interpreter"), Some(&1));
    }

    #[test]
    fn visible_models_respect_groups() {
        let (state, store) = seeded_state();
        store.insert_channel(ChannelRow {
            id: 12,
            channel_type: meta::ChannelType::OpenAI,
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
            base_url: None,
            key: "k".into(),
            models: vec!["vip-only-model".into()],
            groups: vec!["vip".into()],
            model_mapping: vec![],
            model_configs: Default::default(),
            tooling: None,
            used_quota: 0,
        });
        let models = visible_models(&state, "default").unwrap();
        let ids: Vec<String> = models.into_iter().map(|(id, _)| id).collect();
        assert!(ids.contains(&"gpt-4o".to_string()));
        assert!(ids.contains(&"claude-3-5-sonnet".to_string()));
        assert!(!ids.contains(&"vip-only-model".to_string()));
    }

    #[test]
    fn wire_family_mapping() {
        assert_eq!(wire_family(TextFamily::Chat, &[]), TextFamily::Chat);
        assert_eq!(
            wire_family(TextFamily::Chat, &[RewriteMode::ClaudeToChat]),
            TextFamily::Claude
        );
        assert_eq!(
            wire_family(TextFamily::Responses, &[RewriteMode::ChatToResponses]),
            TextFamily::Chat
        );
        assert_eq!(
            wire_family(TextFamily::Chat, &[RewriteMode::ResponsesToChat]),
            TextFamily::Responses
        );
    }
}
