//! The single point of entry for all calls to the generation service.
//!
//! Covers the buffered and streamed generation endpoints plus the per-account
//! history endpoints. Nothing else in the crate talks HTTP.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    header::COOKIE,
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode, Url,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ClientError;
use crate::models::{GenerationRequest, GenerationResult, RemoteHistoryRecord};
use crate::stream::decode_stream;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Cookie carrying the opaque session identity of the current user.
pub const SESSION_COOKIE: &str = "session";

const GENERATE_PATH: &str = "api/generate";
const GENERATE_STREAM_PATH: &str = "api/generate/stream";
const HISTORY_PATH: &str = "api/history";
const HEALTH_PATH: &str = "api/health";

/// Receives the progress of one streamed generation.
pub trait StreamObserver: Send {
    /// Called once the service accepted the request, before any token.
    fn on_open(&mut self) {}

    /// Called for every decoded token, synchronously and in stream order.
    fn on_token(&mut self, token: String);
}

impl<F> StreamObserver for F
where
    F: FnMut(String) + Send,
{
    fn on_token(&mut self, token: String) {
        self(token)
    }
}

/// The streaming half of the client, abstracted so the orchestrator can be
/// driven by something other than a live HTTP service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_streamed(
        &self,
        request: &GenerationRequest,
        observer: &mut dyn StreamObserver,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct GenerationClient {
    client: Client,
    base_url: Url,
    session_token: Option<String>,
}

impl GenerationClient {
    pub fn new(base_url: &str, session_token: Option<String>) -> Result<Self, ClientError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Validation(format!("invalid service URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url,
            session_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Validation(format!("invalid endpoint '{path}': {e}")))
    }

    fn with_session(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.session_token {
            Some(token) => builder.header(COOKIE, format!("{SESSION_COOKIE}={token}")),
            None => builder,
        }
    }

    fn build_form(request: &GenerationRequest) -> Result<Form, ClientError> {
        let resume = request.resume();
        let part = Part::bytes(resume.bytes.clone())
            .file_name(resume.filename.clone())
            .mime_str(resume.mime_type())?;
        let (job_field, job_value) = request.job_source().form_field();

        Ok(Form::new()
            .part("resume", part)
            .text("language", request.language().as_tag())
            .text(job_field, job_value.to_string()))
    }

    /// POST /api/generate: waits for the whole letter.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, ClientError> {
        let url = self.endpoint(GENERATE_PATH)?;
        debug!("POST {url} (resume={})", request.resume().filename);

        let response = self
            .with_session(self.client.post(url))
            .multipart(Self::build_form(request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let result: GenerationResult = response.json().await?;
        info!(
            "Buffered generation finished ({} chars)",
            result.cover_letter.chars().count()
        );
        Ok(result)
    }

    /// POST /api/generate/stream: feeds tokens to `observer` as they arrive.
    ///
    /// Returns `ClientError::Cancelled` as soon as `cancel` fires; no token is
    /// delivered after that point.
    pub async fn generate_streamed(
        &self,
        request: &GenerationRequest,
        observer: &mut dyn StreamObserver,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let url = self.endpoint(GENERATE_STREAM_PATH)?;
        debug!("POST {url} (resume={})", request.resume().filename);

        let send = self
            .with_session(self.client.post(url))
            .multipart(Self::build_form(request)?)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        observer.on_open();

        let mut tokens = std::pin::pin!(decode_stream(response.bytes_stream()));
        let mut delivered = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled after {delivered} tokens");
                    return Err(ClientError::Cancelled);
                }
                next = tokens.next() => next,
            };

            match next {
                Some(Ok(token)) => {
                    observer.on_token(token);
                    delivered += 1;
                }
                Some(Err(ClientError::Decode(reason))) => {
                    warn!("Ending stream early: {reason}");
                    break;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        debug!("Stream finished after {delivered} tokens");
        Ok(())
    }

    /// GET /api/history: the current user's generations, newest first.
    pub async fn list_history(&self) -> Result<Vec<RemoteHistoryRecord>, ClientError> {
        let url = self.endpoint(HISTORY_PATH)?;
        let response = self.with_session(self.client.get(url)).send().await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        Ok(response.json().await?)
    }

    /// DELETE /api/history/{id}. An id the server does not know is not an error.
    pub async fn delete_history(&self, id: &str) -> Result<(), ClientError> {
        let mut url = self.endpoint(HISTORY_PATH)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Validation("service URL cannot take a path".to_string()))?
            .push(id);

        let response = self.with_session(self.client.delete(url)).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("History entry {id} already absent on server");
                Ok(())
            }
            _ => Err(remote_error(response).await),
        }
    }

    /// GET /api/health
    pub async fn health(&self) -> Result<(), ClientError> {
        let url = self.endpoint(HEALTH_PATH)?;
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl GenerationBackend for GenerationClient {
    async fn generate_streamed(
        &self,
        request: &GenerationRequest,
        observer: &mut dyn StreamObserver,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        GenerationClient::generate_streamed(self, request, observer, cancel).await
    }
}

/// Builds a `Remote` error from a non-success response, preferring the
/// service's `detail` message.
async fn remote_error(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.detail)
        .and_then(|d| d.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("Server error: {}", status.as_u16()));

    warn!("Service returned {status}: {message}");
    ClientError::Remote {
        status: status.as_u16(),
        message,
    }
}
