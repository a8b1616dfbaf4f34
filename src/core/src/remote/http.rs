use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use runplex_protocol::{decode_event, ProtocolEvent};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BackendApi, EventSource, EventStream, RunRequest};
use crate::config::BackendConfig;
use crate::conversation::Conversation;
use crate::error::{BackendError, TransportError};
use crate::key::ThreadKey;

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    #[serde(alias = "runId")]
    run_id: String,
}

#[derive(Clone)]
struct HttpClient {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpClient {
    fn new(config: &BackendConfig, timeout: Option<Duration>) -> Result<Self, BackendError> {
        let base_url = Url::parse(&config.base_url)?;
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| BackendError::Http(format!("build client: {e}")))?;
        let auth_token = config
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    /// `{base}/rooms/{room}/agui/{thread}[/{extra}...]`
    fn thread_url(&self, key: &ThreadKey, extra: &[&str]) -> Result<Url, url::ParseError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments
                .pop_if_empty()
                .extend(["rooms", key.room_id.as_str(), "agui", key.thread_id.as_str()])
                .extend(extra);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth_token.as_ref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn error_body(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    (status, body)
}

/// Run allocation and history over the REST API.
pub struct HttpBackend {
    http: HttpClient,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        Ok(Self {
            http: HttpClient::new(config, Some(timeout))?,
        })
    }
}

impl BackendApi for HttpBackend {
    fn create_run<'a>(&'a self, key: &'a ThreadKey) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            let url = self.http.thread_url(key, &[])?;
            let response = self
                .http
                .authorize(self.http.client.post(url))
                .send()
                .await?;
            if !response.status().is_success() {
                let (status, body) = error_body(response).await;
                return Err(BackendError::Status { status, body });
            }
            let created: CreateRunResponse = response.json().await?;
            tracing::debug!(%key, run_id = %created.run_id, "run allocated");
            Ok(created.run_id)
        })
    }

    fn get_history<'a>(
        &'a self,
        key: &'a ThreadKey,
    ) -> BoxFuture<'a, Result<Conversation, BackendError>> {
        Box::pin(async move {
            let url = self.http.thread_url(key, &[])?;
            let response = self
                .http
                .authorize(self.http.client.get(url))
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Conversation::default());
            }
            if !response.status().is_success() {
                let (status, body) = error_body(response).await;
                return Err(BackendError::Status { status, body });
            }
            Ok(response.json().await?)
        })
    }
}

/// Streams run events as server-sent events.
///
/// No request timeout is applied: runs are long-lived.
pub struct HttpEventSource {
    http: HttpClient,
}

impl HttpEventSource {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self {
            http: HttpClient::new(config, None)?,
        })
    }
}

impl EventSource for HttpEventSource {
    fn open(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<EventStream, TransportError>> {
        Box::pin(async move {
            let url = self
                .http
                .thread_url(&request.key, &[request.run_id.as_str()])
                .map_err(|e| TransportError::Http(e.to_string()))?;
            let response = self
                .http
                .authorize(self.http.client.post(url))
                .header(ACCEPT, "text/event-stream")
                .json(&request.input)
                .send()
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;
            if !response.status().is_success() {
                let (status, body) = error_body(response).await;
                return Err(TransportError::Status { status, body });
            }
            let events = response
                .bytes_stream()
                .eventsource()
                .take_until(cancel.cancelled_owned())
                .filter_map(|item| {
                    futures::future::ready(match item {
                        Ok(sse) => decode_sse_data(&sse.data).map(Ok),
                        Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
                    })
                });
            Ok(events.boxed())
        })
    }
}

/// Keep-alives, `[DONE]` markers and undecodable payloads are skipped.
fn decode_sse_data(data: &str) -> Option<ProtocolEvent> {
    let trimmed = data.trim();
    if trimmed.is_empty() || trimmed == "[DONE]" {
        return None;
    }
    match decode_event(trimmed) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "skipping undecodable event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpClient {
        HttpClient::new(
            &BackendConfig {
                base_url: base.to_string(),
                request_timeout_secs: 5,
                auth_token: Some("  ".into()),
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn thread_url_appends_segments_to_base_path() {
        let http = client("http://localhost:8000/api/v1/");
        let key = ThreadKey::new("room one", "t1");
        let url = http.thread_url(&key, &["run-1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/v1/rooms/room%20one/agui/t1/run-1"
        );
    }

    #[test]
    fn blank_auth_token_is_dropped() {
        assert!(client("http://localhost:8000").auth_token.is_none());
    }

    #[test]
    fn sse_data_skips_markers_and_garbage() {
        assert_eq!(decode_sse_data(""), None);
        assert_eq!(decode_sse_data("[DONE]"), None);
        assert_eq!(decode_sse_data("{not json"), None);
        assert_eq!(
            decode_sse_data(r#"{"type":"RUN_ERROR","message":"x"}"#),
            Some(ProtocolEvent::run_error("x"))
        );
    }
}
