//! In-process fake of the generation service for tests.
//!
//! Behaviour is keyed on the submitted `job_text`:
//! `fail` → 500 with a `detail`, `fail-plain` → 502 without JSON,
//! `hang` → one streamed token and then nothing, `malformed` → one streamed
//! token and then a record longer than the decoder accepts. Anything else
//! succeeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::json;

use crate::models::RemoteHistoryRecord;
use crate::stream::decoder::MAX_RECORD_LEN;

pub(crate) const FAKE_SESSION: &str = "test-session";

pub(crate) const STREAMED_LETTER: &str =
    "data: Dear\ndata:  Hiring\n: keep-alive\ndata:  Manager\ndata: [DONE]\n";

#[derive(Clone, Default)]
pub(crate) struct FakeState {
    pub records: Arc<Mutex<Vec<RemoteHistoryRecord>>>,
    pub forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

pub(crate) fn record(id: &str, job_url: Option<&str>, letter: &str) -> RemoteHistoryRecord {
    RemoteHistoryRecord {
        id: id.to_string(),
        resume_filename: "cv.pdf".to_string(),
        job_url: job_url.map(str::to_string),
        cover_letter: letter.to_string(),
        language: "en".to_string(),
        created_at: "2025-03-01T10:15:30".to_string(),
    }
}

/// Binds the fake to an ephemeral port and returns its base URL.
pub(crate) async fn spawn_fake_backend(state: FakeState) -> String {
    let app = Router::new()
        .route("/api/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/api/generate", post(generate))
        .route("/api/generate/stream", post(generate_stream))
        .route("/api/history", get(list_history))
        .route("/api/history/:id", delete(delete_history))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn read_form(mut multipart: Multipart) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name() {
            fields.insert(format!("{name}.filename"), file_name.to_string());
        }
        let bytes = field.bytes().await.unwrap();
        fields.insert(name, String::from_utf8_lossy(&bytes).into_owned());
    }
    fields
}

fn failure_for(form: &HashMap<String, String>) -> Option<Response> {
    match form.get("job_text").map(String::as_str) {
        Some("fail") => Some(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "quota exceeded" })),
            )
                .into_response(),
        ),
        Some("fail-plain") => Some((StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()),
        _ => None,
    }
}

fn is_signed_in(headers: &HeaderMap) -> bool {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |c| c.contains(&format!("session={FAKE_SESSION}")))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "Not authenticated" })),
    )
        .into_response()
}

async fn generate(State(state): State<FakeState>, multipart: Multipart) -> Response {
    let form = read_form(multipart).await;
    state.forms.lock().unwrap().push(form.clone());

    if let Some(failure) = failure_for(&form) {
        return failure;
    }

    let source = form
        .get("job_url")
        .or_else(|| form.get("job_text"))
        .cloned()
        .unwrap_or_default();
    Json(json!({ "cover_letter": format!("Letter for {source}") })).into_response()
}

async fn generate_stream(State(state): State<FakeState>, multipart: Multipart) -> Response {
    let form = read_form(multipart).await;
    state.forms.lock().unwrap().push(form.clone());

    if let Some(failure) = failure_for(&form) {
        return failure;
    }

    let job_text = form.get("job_text").map(String::as_str);
    let body = if job_text == Some("hang") {
        let first = stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from_static(
            b"data: first\n",
        ))]);
        Body::from_stream(first.chain(stream::pending()))
    } else if job_text == Some("malformed") {
        let mut letter = b"data: first\ndata: ".to_vec();
        letter.extend(std::iter::repeat(b'x').take(MAX_RECORD_LEN));
        letter.extend_from_slice(b"\ndata: never\ndata: [DONE]\n");
        Body::from(letter)
    } else {
        let mut records = state.records.lock().unwrap();
        let id = format!("srv-{}", records.len() + 1);
        let job_url = form.get("job_url").map(String::as_str);
        records.insert(0, record(&id, job_url, "Dear Hiring Manager"));
        Body::from(STREAMED_LETTER)
    };

    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn list_history(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    if !is_signed_in(&headers) {
        return unauthorized();
    }
    let records = state.records.lock().unwrap().clone();
    Json(records).into_response()
}

async fn delete_history(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !is_signed_in(&headers) {
        return unauthorized();
    }
    let mut records = state.records.lock().unwrap();
    let before = records.len();
    records.retain(|r| r.id != id);
    if records.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found" }))).into_response();
    }
    Json(json!({ "ok": true })).into_response()
}
