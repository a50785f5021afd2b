// OpenAI-compatible surface: request pipeline (parse → resolve → overlay
// → proxy), streaming and buffered relay, engine-specific error
// normalization, and the public model listing endpoints.

pub mod proxy;

use std::collections::HashSet;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::Response;
use axum::{Extension, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{ClientIp, Principal};
use crate::error::ApiError;
use crate::lifecycle::{Engine, ModelTask};
use crate::registry::{BreakerState, ResolveError};
use crate::state::AppState;
use crate::usage::UsageRecord;
use crate::RequestId;
use proxy::{ProxyFailure, UsageGuard};

/// Fill in gaps from the model's request_defaults overlay; fields already
/// present in the client body always win.
fn apply_request_defaults(body: &mut Value, defaults: &Value) {
    let (Some(obj), Some(defs)) = (body.as_object_mut(), defaults.as_object()) else {
        return;
    };
    for (key, value) in defs {
        obj.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn error_message_from_body(body: &[u8]) -> Option<String> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    parsed["error"]["message"]
        .as_str()
        .or_else(|| parsed["error"].as_str())
        .or_else(|| parsed["message"].as_str())
        .map(|s| s.to_string())
}

/// Normalize an upstream failure into the OpenAI envelope. The quantized
/// engine has well-known transient shapes; the GPU engine's failures run
/// through the log classifier for a fix hint.
pub fn translate_upstream_failure(engine: Engine, failure: &ProxyFailure) -> ApiError {
    let Some(status) = failure.status else {
        return ApiError::Upstream(failure.message.clone());
    };
    let body_text = String::from_utf8_lossy(&failure.body).to_lowercase();

    if engine == Engine::Llamacpp {
        if status == 503 && body_text.contains("loading model") {
            return ApiError::Unavailable {
                message: "Model is still loading; retry with backoff".to_string(),
                code: Some("model_loading"),
                retry_after: Some(2),
            };
        }
        if body_text.contains("no slot available")
            || body_text.contains("slot unavailable")
            || body_text.contains("server is busy")
        {
            return ApiError::Unavailable {
                message: "All inference slots are busy; retry shortly".to_string(),
                code: Some("slot_unavailable"),
                retry_after: Some(1),
            };
        }
    }

    if body_text.contains("context length")
        || body_text.contains("exceeds the available context size")
        || body_text.contains("maximum context length")
    {
        return ApiError::ContextLength(
            "Request exceeds the model's context length; shorten the prompt or raise the context length"
                .to_string(),
        );
    }

    if engine == Engine::Vllm && status >= 500 {
        let diagnosis = crate::lifecycle::classifier::classify(&body_text);
        if diagnosis.matched {
            return ApiError::Server {
                message: format!("{}; {}", diagnosis.message, diagnosis.fix_hint),
                code: None,
            };
        }
    }

    if (400..500).contains(&status) {
        let message = error_message_from_body(&failure.body)
            .unwrap_or_else(|| format!("upstream rejected the request ({status})"));
        return ApiError::InvalidRequest(message);
    }

    ApiError::Upstream(failure.message.clone())
}

fn resolve_or_fail(
    state: &AppState,
    model: &str,
    task: ModelTask,
    exclude: &[&str],
) -> Result<crate::registry::ResolvedUpstream, ApiError> {
    state
        .registry
        .resolve_excluding(model, Some(task), exclude)
        .map_err(|e| match e {
            ResolveError::UnknownModel => ApiError::NotFound("model not found".to_string()),
            ResolveError::NoHealthyUpstream => ApiError::Unavailable {
                message: format!("No healthy upstream for model '{model}'"),
                code: Some("no_healthy_upstream"),
                retry_after: Some(5),
            },
        })
}

async fn request_defaults_for(state: &AppState, model_id: Option<i64>) -> Value {
    let Some(id) = model_id else {
        return Value::Null;
    };
    sqlx::query_scalar::<_, Value>("SELECT request_defaults FROM models WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten()
        .unwrap_or(Value::Null)
}

struct InferenceContext {
    endpoint: &'static str,
    task: ModelTask,
    request_id: Uuid,
    principal: Principal,
    client_ip: std::net::IpAddr,
}

/// The shared request pipeline behind the three inference endpoints.
async fn handle_inference(
    state: AppState,
    ctx: InferenceContext,
    raw_body: Bytes,
) -> Result<Response, ApiError> {
    // Failures before upstream resolution still count, just without an
    // engine label.
    let fail = |err: ApiError| {
        state
            .metrics
            .record_request(ctx.endpoint, err.status().as_u16(), "none");
        err
    };

    if raw_body.len() > state.config.max_body_bytes {
        return Err(fail(ApiError::PayloadTooLarge(format!(
            "request body exceeds {} bytes",
            state.config.max_body_bytes
        ))));
    }

    let mut body: Value = serde_json::from_slice(&raw_body)
        .map_err(|e| fail(ApiError::InvalidRequest(format!("malformed JSON body: {e}"))))?;
    if !body.is_object() {
        return Err(fail(ApiError::InvalidRequest(
            "request body must be a JSON object".into(),
        )));
    }

    let model = body["model"]
        .as_str()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| fail(ApiError::InvalidRequest("missing required field 'model'".into())))?
        .to_string();
    if ctx.endpoint == "/v1/embeddings" && body.get("input").is_none() {
        return Err(fail(ApiError::InvalidRequest("missing required field 'input'".into())));
    }
    let stream = body["stream"].as_bool().unwrap_or(false) && ctx.task == ModelTask::Generate;

    let upstream = resolve_or_fail(&state, &model, ctx.task, &[]).map_err(fail)?;
    let engine = upstream.engine;

    let defaults = request_defaults_for(&state, upstream.model_id).await;
    apply_request_defaults(&mut body, &defaults);
    let outgoing = Bytes::from(serde_json::to_vec(&body).expect("serializing a parsed Value"));

    let usage_base = UsageRecord {
        request_id: ctx.request_id,
        api_key_id: ctx.principal.key_id(),
        user_id: ctx.principal.user_id(),
        org_id: ctx.principal.org_id(),
        model: upstream.served_model_name.clone(),
        task: ctx.task.as_str().to_string(),
        endpoint: ctx.endpoint.to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        latency_ms: 0,
        ttft_ms: None,
        status_code: 200,
    };

    let result = if stream {
        stream_request(&state, &ctx, upstream, outgoing, usage_base).await
    } else {
        buffered_request(&state, &ctx, upstream, outgoing, usage_base).await
    };

    match &result {
        Ok(response) => {
            state
                .metrics
                .record_request(ctx.endpoint, response.status().as_u16(), engine.as_str());
        }
        Err(err) => {
            state
                .metrics
                .record_request(ctx.endpoint, err.status().as_u16(), engine.as_str());
        }
    }
    result
}

async fn buffered_request(
    state: &AppState,
    ctx: &InferenceContext,
    upstream: crate::registry::ResolvedUpstream,
    body: Bytes,
    mut usage: UsageRecord,
) -> Result<Response, ApiError> {
    let started = std::time::Instant::now();

    let attempt = proxy::forward_buffered(state, &upstream.url, ctx.endpoint, body.clone()).await;
    let outcome = match attempt {
        Ok(ok) => Ok(ok),
        Err(failure) if failure.transient => {
            // No response byte has been written: one shot at another
            // healthy upstream in the same pool.
            match resolve_or_fail(state, &upstream.served_model_name, ctx.task, &[upstream.url.as_str()]) {
                Ok(second) => {
                    tracing::warn!(
                        model = %upstream.served_model_name,
                        failed = %upstream.url,
                        retry = %second.url,
                        "buffered proxy: retrying on alternate upstream"
                    );
                    proxy::forward_buffered(state, &second.url, ctx.endpoint, body).await
                }
                Err(_) => Err(failure),
            }
        }
        Err(failure) => Err(failure),
    };

    state
        .metrics
        .observe_upstream_latency(ctx.endpoint, upstream.engine.as_str(), started.elapsed());

    match outcome {
        Ok((status, payload)) => {
            if let Some((prompt, completion)) = proxy::extract_usage(&payload) {
                usage.prompt_tokens = prompt;
                usage.completion_tokens = completion;
            }
            usage.status_code = i32::from(status.as_u16());
            usage.latency_ms = started.elapsed().as_millis() as i32;
            state.usage.record(usage);

            Ok(Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(axum::body::Body::from(payload))
                .expect("static response parts are valid"))
        }
        Err(failure) => {
            let err = translate_upstream_failure(upstream.engine, &failure);
            usage.status_code = i32::from(err.status().as_u16());
            usage.latency_ms = started.elapsed().as_millis() as i32;
            state.usage.record(usage);
            Err(err)
        }
    }
}

async fn stream_request(
    state: &AppState,
    ctx: &InferenceContext,
    upstream: crate::registry::ResolvedUpstream,
    body: Bytes,
    usage: UsageRecord,
) -> Result<Response, ApiError> {
    let subject = ctx
        .principal
        .limiter_subject()
        .unwrap_or_else(|| format!("ip:{}", ctx.client_ip));
    let Some(slot) = state.stream_gate.try_acquire(&subject) else {
        return Err(ApiError::RateLimited {
            retry_after_ms: state.stream_gate.retry_after_ms(),
        });
    };

    let attempt = proxy::open_stream(state, &upstream.url, ctx.endpoint, body.clone()).await;
    let opened = match attempt {
        Ok(response) => response,
        Err(failure) if failure.transient => {
            match resolve_or_fail(state, &upstream.served_model_name, ctx.task, &[upstream.url.as_str()]) {
                Ok(second) => {
                    tracing::warn!(
                        model = %upstream.served_model_name,
                        failed = %upstream.url,
                        retry = %second.url,
                        "stream proxy: retrying on alternate upstream"
                    );
                    proxy::open_stream(state, &second.url, ctx.endpoint, body)
                        .await
                        .map_err(|f| translate_upstream_failure(second.engine, &f))?
                }
                Err(_) => return Err(translate_upstream_failure(upstream.engine, &failure)),
            }
        }
        Err(failure) => return Err(translate_upstream_failure(upstream.engine, &failure)),
    };

    let guard = UsageGuard::new(state.usage.clone(), usage);
    Ok(proxy::relay_stream(state, opened, slot, guard))
}

// ── Endpoint handlers ───────────────────────────────────────────────────

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "inference",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Chat completion or SSE stream"),
        (status = 404, description = "Unknown model"),
        (status = 429, description = "Rate limited"),
    )
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle_inference(
        state,
        InferenceContext {
            endpoint: "/v1/chat/completions",
            task: ModelTask::Generate,
            request_id,
            principal,
            client_ip,
        },
        body,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/v1/completions",
    tag = "inference",
    request_body(content = String, content_type = "application/json"),
    responses((status = 200, description = "Legacy prompt completion"))
)]
pub async fn completions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle_inference(
        state,
        InferenceContext {
            endpoint: "/v1/completions",
            task: ModelTask::Generate,
            request_id,
            principal,
            client_ip,
        },
        body,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/v1/embeddings",
    tag = "inference",
    request_body(content = String, content_type = "application/json"),
    responses((status = 200, description = "Embedding vectors"))
)]
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle_inference(
        state,
        InferenceContext {
            endpoint: "/v1/embeddings",
            task: ModelTask::Embed,
            request_id,
            principal,
            client_ip,
        },
        body,
    )
    .await
}

#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "inference",
    responses((status = 200, description = "Currently resolvable served names"))
)]
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let mut seen = HashSet::new();
    let data: Vec<Value> = snapshot
        .iter()
        .filter(|e| seen.insert(e.served_model_name.clone()))
        .map(|e| {
            json!({
                "id": e.served_model_name,
                "object": "model",
                "owned_by": "cortex",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Unauthenticated variant with per-entry health, for status panels.
#[utoipa::path(
    get,
    path = "/v1/models/status",
    tag = "inference",
    responses((status = 200, description = "Served names with upstream health"))
)]
pub async fn models_status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let data: Vec<Value> = snapshot
        .iter()
        .map(|e| {
            json!({
                "id": e.served_model_name,
                "upstream": e.upstream_url,
                "engine": e.engine.as_str(),
                "task": e.task.as_str(),
                "healthy": e.health.ok && e.health.breaker != BreakerState::Open,
                "breaker": e.health.breaker,
                "consecutive_failures": e.health.consecutive_failures,
                "last_check_secs_ago": e.health.last_check_at.map(|t| t.elapsed().as_secs()),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

// ── Health endpoints ────────────────────────────────────────────────────

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Gateway liveness"))
)]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": if state.is_ready() { "ok" } else { "starting" },
        "app": "Cortex",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

#[utoipa::path(
    get,
    path = "/health/detailed",
    tag = "health",
    responses((status = 200, description = "Liveness plus store and host detail"))
)]
pub async fn health_detailed(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    let snapshot = state.system_monitor.read().await.clone();
    let registry = state.registry.snapshot();

    Json(json!({
        "status": if state.is_ready() { "ok" } else { "starting" },
        "app": "Cortex",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "database_ok": db_ok,
        "container_runtime_ok": state.lifecycle.docker.available(),
        "registry_entries": registry.len(),
        "platform": snapshot.platform,
        "cpu_usage_percent": snapshot.cpu_usage_percent,
        "memory_used_mb": snapshot.memory_used_mb,
        "memory_total_mb": snapshot.memory_total_mb,
    }))
}
