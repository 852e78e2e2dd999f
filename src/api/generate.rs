//! The generate proxy endpoint.
//!
//! `POST /api/generate` accepts the backend's native request body and proxies
//! it to the selected node, unary or streaming per the body's `stream` flag.
//! The JSON body passes through opaquely; routing metadata travels in `x-*`
//! request headers so callers built for a single backend keep working
//! unchanged:
//!
//! | Header | Meaning |
//! |--------|---------|
//! | `x-routing-mode` | `fast` \| `reliable` \| `async` |
//! | `x-priority` | integer `0..=10` |
//! | `x-task-kind` | fallback-chain tag |
//! | `x-pin-node` | route to exactly this node id |
//! | `x-prefer-local` / `x-prefer-cpu` | `true` to enable |
//! | `x-min-free-vram-bytes` | feasibility floor |
//! | `x-min-success-rate` | reliability floor |
//! | `x-attempt-timeout-ms` / `x-deadline-ms` | time budgets |
//!
//! The routing decision is returned in response headers: the full record as
//! JSON in `x-route-decision`, plus `x-route-node` and `x-route-model` for
//! quick inspection. For streams the decision is final once the response
//! headers are sent — the first chunk has already arrived by then.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{request_id::RequestId, AppState};
use crate::{
    config::RoutingMode,
    router::{GenerateRequest, RouteDecision},
};

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(model) = body.get("model").and_then(Value::as_str).map(String::from) else {
        return caller_error("request body must carry a string `model` field");
    };
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let mut req = GenerateRequest::new(model, body);
    req.id = request_id.0;
    if let Err(message) = apply_headers(&mut req, &headers) {
        return caller_error(&message);
    }

    if streaming {
        match state.router.generate_stream(req).await {
            Ok((stream, decision)) => stream_response(stream, &decision),
            Err(e) => e.into_response(),
        }
    } else {
        match state.router.generate(req).await {
            Ok((value, decision)) => {
                let mut response = Json(value).into_response();
                attach_decision(response.headers_mut(), &decision);
                response
            }
            Err(e) => e.into_response(),
        }
    }
}

/// Fold the recognized `x-*` headers into the request. Unknown headers are
/// ignored; recognized headers with unparseable values are caller errors.
fn apply_headers(req: &mut GenerateRequest, headers: &HeaderMap) -> Result<(), String> {
    fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }
    fn parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Result<Option<T>, String> {
        match text(headers, name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| format!("bad `{name}` header: {raw}")),
        }
    }

    if let Some(raw) = text(headers, "x-routing-mode") {
        req.mode = Some(match raw {
            "fast" => RoutingMode::Fast,
            "reliable" => RoutingMode::Reliable,
            "async" => RoutingMode::Async,
            other => return Err(format!("bad `x-routing-mode` header: {other}")),
        });
    }
    if let Some(priority) = parse::<u8>(headers, "x-priority")? {
        if priority > 10 {
            return Err(format!("`x-priority` must be in 0..=10, got {priority}"));
        }
        req.priority = priority;
    }
    if let Some(task) = text(headers, "x-task-kind") {
        req.task_kind = Some(task.to_owned());
    }
    if let Some(pin) = text(headers, "x-pin-node") {
        req.constraints.pin_node_id = Some(pin.to_owned());
    }
    req.constraints.prefer_local = text(headers, "x-prefer-local") == Some("true");
    req.constraints.prefer_cpu = text(headers, "x-prefer-cpu") == Some("true");
    req.constraints.min_free_vram_bytes = parse(headers, "x-min-free-vram-bytes")?;
    req.constraints.min_success_rate = parse(headers, "x-min-success-rate")?;
    req.attempt_timeout_ms = parse(headers, "x-attempt-timeout-ms")?;
    req.deadline_ms = parse(headers, "x-deadline-ms")?;

    Ok(())
}

/// Build the NDJSON proxy response for a committed stream.
fn stream_response(
    stream: crate::router::RoutedStream,
    decision: &RouteDecision,
) -> Response {
    let ndjson = stream.map(|item| {
        item.map(|chunk| {
            let mut line = serde_json::to_vec(&chunk).unwrap_or_default();
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ndjson))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    attach_decision(response.headers_mut(), decision);
    response
}

/// Surface the routing decision in response headers.
fn attach_decision(headers: &mut HeaderMap, decision: &RouteDecision) {
    if let Ok(encoded) = serde_json::to_string(decision) {
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            headers.insert("x-route-decision", value);
        }
    }
    if let Some(node) = &decision.selected_node_id {
        if let Ok(value) = HeaderValue::from_str(node) {
            headers.insert("x-route-node", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&decision.model_used) {
        headers.insert("x-route-model", value);
    }
}

fn caller_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": { "kind": "bad_request", "message": message } })),
    )
        .into_response()
}
