//! Dynamic capability dispatch.
//!
//! Everything outside the fixed routes lands here.  The path names the
//! capability, the request body and query string become its keyword
//! arguments, and the response is either one JSON document or a
//! server-sent-event stream when the caller asked for `stream` and the
//! capability produced a chunk sequence.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, State};
use axum::http::{header, HeaderMap, Request};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use station_runtime::{Args, CallOutput, ChunkStream, ExecuteOutcome};

use crate::error::ServerError;
use crate::state::AppState;

/// Upper bound for buffered request bodies; images arrive as data URLs.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub async fn dynamic(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    if !state.service.is_running().await {
        return ServerError::ServiceNotRunning.into_response();
    }

    let path = req.uri().path().to_owned();
    let function = function_name(&path);
    let mut kwargs = collect_args(req, &state).await;

    let timeout = take_timeout(&mut kwargs);
    let stream_requested = kwargs.get("stream").map(truthy).unwrap_or(false);
    mirror_object_alias(&mut kwargs);

    debug!(%path, %function, stream = stream_requested, "dispatching capability");
    let started = Instant::now();
    let outcome = state.service.execute(&function, timeout, kwargs).await;

    match outcome {
        ExecuteOutcome::NotRunning => ServerError::ServiceNotRunning.into_response(),
        ExecuteOutcome::Rejected => {
            state
                .analytics
                .track_error("QueueFull", "Queue is full", &function);
            ServerError::QueueFull.into_response()
        }
        ExecuteOutcome::TimedOut => {
            state
                .analytics
                .track_error("Timeout", "Request timeout", &function);
            ServerError::Timeout.into_response()
        }
        ExecuteOutcome::UnknownFunction(name) => Json(json!({
            "error": format!("Function '{name}' not available"),
        }))
        .into_response(),
        ExecuteOutcome::Completed(CallOutput::Stream(chunks)) if stream_requested => {
            state.session.record_request(&path);
            sse_response(chunks)
        }
        // The caller did not ask to stream but the capability produced a
        // sequence anyway: its first chunk is the value.
        ExecuteOutcome::Completed(CallOutput::Stream(chunks)) => {
            state.session.record_request(&path);
            let value = first_chunk_value(chunks).await;
            finish_unary(&state, &function, value, started)
        }
        ExecuteOutcome::Completed(CallOutput::Value(value)) => {
            state.session.record_request(&path);
            finish_unary(&state, &function, value, started)
        }
    }
}

/// Attach `_stats` to a successful mapping, record telemetry, serialize.
fn finish_unary(
    state: &Arc<AppState>,
    function: &str,
    mut value: Value,
    started: Instant,
) -> Response {
    let success = !has_error(&value);
    let mut tokens = 0u64;

    if success {
        if let Value::Object(map) = &mut value {
            tokens = estimate_tokens(map);
            let duration = started.elapsed().as_secs_f64();
            if tokens > 0 && duration > 0.0 {
                map.insert(
                    "_stats".to_owned(),
                    json!({
                        "tokens": tokens,
                        "duration": round2(duration),
                        "tokens_per_sec": round1(tokens as f64 / duration),
                    }),
                );
            }
        }
    }

    let model = state.config.current_model();
    state
        .analytics
        .track_api_call(function, started.elapsed(), tokens, success, model.as_deref());

    Json(value).into_response()
}

/// Stream the chunk sequence as server-sent events, closing the sequence
/// when the client disconnects.
fn sse_response(chunks: ChunkStream) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);

    tokio::spawn(async move {
        let started = Instant::now();
        let mut tokens: u64 = 0;
        let (_key, mut chunk_rx) = chunks.into_parts();

        while let Some(chunk) = chunk_rx.recv().await {
            tokens += 1;
            let event = Event::default().data(json!({ "chunk": chunk }).to_string());
            if tx.send(Ok(event)).await.is_err() {
                // Client went away; dropping chunk_rx closes the sequence.
                return;
            }
        }

        let duration = started.elapsed().as_secs_f64();
        if tokens > 0 && duration > 0.0 {
            let stats = json!({
                "tokens": tokens,
                "duration": round2(duration),
                "tokens_per_sec": round1(tokens as f64 / duration),
            });
            if tx.send(Ok(Event::default().data(stats.to_string()))).await.is_err() {
                return;
            }
        }
        let _ = tx
            .send(Ok(Event::default().data(json!({ "completed": true }).to_string())))
            .await;
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn first_chunk_value(mut chunks: ChunkStream) -> Value {
    let key = chunks.key().to_owned();
    let first = chunks.next().await.unwrap_or_default();
    let mut map = Map::new();
    map.insert(key, Value::String(first));
    Value::Object(map)
}

/// Derive the capability name from the request path.
fn function_name(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => "index".to_owned(),
        ["v1", second, ..] => (*second).to_owned(),
        rest => (*rest.last().expect("non-empty")).to_owned(),
    }
}

/// Collect keyword arguments: JSON body, url-encoded form, multipart form,
/// then query-string parameters, later sources overriding earlier ones;
/// finally the `_headers` / `_method` introspection keys.
async fn collect_args(req: Request<Body>, state: &Arc<AppState>) -> Args {
    let mut kwargs = Args::new();
    let method = req.method().to_string();
    let headers = req.headers().clone();
    let query = req.uri().query().map(str::to_owned);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    if content_type.contains("application/json") {
        if let Ok(bytes) = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            // Malformed JSON bodies contribute no arguments.
            if let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(&bytes) {
                kwargs.extend(body);
            }
        }
    } else if content_type.contains("application/x-www-form-urlencoded") {
        if let Ok(bytes) = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&bytes) {
                for (key, value) in pairs {
                    kwargs.insert(key, Value::String(value));
                }
            }
        }
    } else if content_type.contains("multipart/form-data") {
        if let Ok(mut multipart) = Multipart::from_request(req, state).await {
            while let Ok(Some(field)) = multipart.next_field().await {
                let Some(name) = field.name().map(str::to_owned) else {
                    continue;
                };
                if let Ok(text) = field.text().await {
                    kwargs.insert(name, Value::String(text));
                }
            }
        }
    }

    if let Some(query) = query {
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&query) {
            for (key, value) in pairs {
                kwargs.insert(key, Value::String(value));
            }
        }
    }

    kwargs.insert("_headers".to_owned(), headers_value(&headers));
    kwargs.insert("_method".to_owned(), Value::String(method));
    kwargs
}

fn headers_value(headers: &HeaderMap) -> Value {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    Value::Object(map)
}

/// Remove `timeout` from the arguments, coercing to seconds; unparseable
/// values leave the timeout unset.
fn take_timeout(kwargs: &mut Args) -> Option<Duration> {
    let raw = kwargs.remove("timeout")?;
    let secs = match &raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    match secs {
        Some(s) if s > 0.0 && s.is_finite() => Some(Duration::from_secs_f64(s)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// `object` is the canonical argument name; providers written against the
/// short `obj` form keep working.
fn mirror_object_alias(kwargs: &mut Args) {
    if let Some(object) = kwargs.get("object").cloned() {
        kwargs.entry("obj".to_owned()).or_insert(object);
    }
}

fn has_error(value: &Value) -> bool {
    value.get("error").map(|e| !e.is_null()).unwrap_or(false)
}

/// Whitespace-split token estimate over every top-level string value.
fn estimate_tokens(map: &Map<String, Value>) -> u64 {
    map.values()
        .filter_map(|v| v.as_str())
        .map(|s| s.split_whitespace().count() as u64)
        .sum()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
