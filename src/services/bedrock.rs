//! Bedrock backend over HTTP.
//!
//! Runtime calls go to `bedrock-runtime.{region}.amazonaws.com`, model
//! listings to `bedrock.{region}.amazonaws.com`. Every request is SigV4
//! signed with the caller's credential set.

use crate::api::auth::CredentialSet;
use crate::core::config::BackendConfig;
use crate::core::error::Result;
use crate::core::metrics::get_metrics;
use crate::core::AppError;
use crate::services::backend::{
    exception_to_error, Backend, BackendEventStream, BackendInvocation, ConverseResponse,
    ConverseStreamEvent, FoundationModelSummary, InferenceProfileSummary,
};
use crate::services::eventstream::{EventStreamDecoder, Frame};
use crate::services::sigv4::{sign_request, SigningKey};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::{Method, Url};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::pin::Pin;
use std::time::{Duration, Instant};

const SIGNING_SERVICE: &str = "bedrock";
const PROFILE_PAGE_SIZE: u32 = 100;
const MAX_PROFILE_PAGES: usize = 20;

pub struct BedrockBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl BedrockBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn region<'a>(&'a self, credentials: &'a CredentialSet) -> &'a str {
        credentials.region.as_deref().unwrap_or(&self.config.region)
    }

    fn runtime_base(&self, region: &str) -> String {
        match &self.config.runtime_endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", region),
        }
    }

    fn control_base(&self, region: &str) -> String {
        match &self.config.control_endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://bedrock.{}.amazonaws.com", region),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn model_url(&self, credentials: &CredentialSet, model_id: &str, action: &str) -> Result<Url> {
        let url = format!(
            "{}/model/{}/{}",
            self.runtime_base(self.region(credentials)),
            urlencoding::encode(model_id),
            action
        );
        Url::parse(&url).map_err(|e| AppError::Internal(format!("Invalid backend URL {}: {}", url, e)))
    }

    /// Sign and send one request. HTTP error statuses are classified here.
    async fn send_signed(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
        credentials: &CredentialSet,
    ) -> Result<reqwest::Response> {
        let body = body.unwrap_or_default();
        let key = SigningKey {
            access_key: &credentials.access_key,
            secret_key: credentials.secret_key.expose_secret(),
            session_token: credentials.session_token.as_ref().map(|t| t.expose_secret()),
            region: self.region(credentials),
            service: SIGNING_SERVICE,
        };
        let signed = sign_request(method.as_str(), &url, &[], &body, &key, chrono::Utc::now())?;

        let mut request = self
            .client
            .request(method, url.clone())
            .header("accept", "application/json");
        for (name, value) in signed.into_pairs() {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.header("content-type", "application/json").body(body);
        }

        tracing::debug!(
            url = %url,
            access_key = %credentials.masked_access_key(),
            "Sending Bedrock request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.config.request_timeout_secs))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_http_error(status.as_u16(), &body))
    }

    /// Run `fut` under the non-streaming bound.
    async fn bounded<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout(), fut)
            .await
            .map_err(|_| AppError::BackendTimeout {
                timeout_secs: self.config.request_timeout_secs,
            })?
    }
}

#[async_trait]
impl Backend for BedrockBackend {
    async fn invoke(
        &self,
        credentials: &CredentialSet,
        invocation: &BackendInvocation,
    ) -> Result<ConverseResponse> {
        let start = Instant::now();
        let url = self.model_url(credentials, &invocation.model_id, "converse")?;
        let body = serde_json::to_vec(&invocation.request)?;

        let result = self
            .bounded(async {
                let response = self.send_signed(Method::POST, url, Some(body), credentials).await?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| classify_transport_error(e, self.config.request_timeout_secs))?;
                serde_json::from_slice::<ConverseResponse>(&bytes).map_err(|e| {
                    AppError::BackendUnavailable(format!("Unreadable Bedrock response: {}", e))
                })
            })
            .await;

        get_metrics()
            .backend_latency
            .with_label_values(&["converse"])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn invoke_stream(
        &self,
        credentials: &CredentialSet,
        invocation: &BackendInvocation,
    ) -> Result<BackendEventStream> {
        let start = Instant::now();
        let url = self.model_url(credentials, &invocation.model_id, "converse-stream")?;
        let body = serde_json::to_vec(&invocation.request)?;

        let response = self
            .bounded(self.send_signed(Method::POST, url, Some(body), credentials))
            .await;

        get_metrics()
            .backend_latency
            .with_label_values(&["converse_stream_open"])
            .observe(start.elapsed().as_secs_f64());

        Ok(event_stream(
            Box::pin(response?.bytes_stream()),
            Duration::from_secs(self.config.stream_read_timeout_secs),
        ))
    }

    async fn list_foundation_models(
        &self,
        credentials: &CredentialSet,
    ) -> Result<Vec<FoundationModelSummary>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Listing {
            #[serde(default)]
            model_summaries: Vec<FoundationModelSummary>,
        }

        let start = Instant::now();
        let url = format!("{}/foundation-models", self.control_base(self.region(credentials)));
        let url = Url::parse(&url).map_err(|e| AppError::Internal(e.to_string()))?;

        let result = self
            .bounded(async {
                let response = self.send_signed(Method::GET, url, None, credentials).await?;
                let listing: Listing = response
                    .json()
                    .await
                    .map_err(|e| AppError::BackendUnavailable(format!("Unreadable model listing: {}", e)))?;
                Ok(listing.model_summaries)
            })
            .await;

        get_metrics()
            .backend_latency
            .with_label_values(&["list_foundation_models"])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn list_inference_profiles(
        &self,
        credentials: &CredentialSet,
    ) -> Result<Vec<InferenceProfileSummary>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            #[serde(default)]
            inference_profile_summaries: Vec<InferenceProfileSummary>,
            #[serde(default)]
            next_token: Option<String>,
        }

        let start = Instant::now();
        let base = format!("{}/inference-profiles", self.control_base(self.region(credentials)));

        let result = self
            .bounded(async {
                let mut profiles = Vec::new();
                let mut next_token: Option<String> = None;

                for _ in 0..MAX_PROFILE_PAGES {
                    let mut url = Url::parse(&base).map_err(|e| AppError::Internal(e.to_string()))?;
                    {
                        let mut query = url.query_pairs_mut();
                        query.append_pair("maxResults", &PROFILE_PAGE_SIZE.to_string());
                        if let Some(token) = &next_token {
                            query.append_pair("nextToken", token);
                        }
                    }

                    let response = self.send_signed(Method::GET, url, None, credentials).await?;
                    let page: Page = response.json().await.map_err(|e| {
                        AppError::BackendUnavailable(format!("Unreadable profile listing: {}", e))
                    })?;
                    profiles.extend(page.inference_profile_summaries);

                    match page.next_token.filter(|t| !t.is_empty()) {
                        Some(token) => next_token = Some(token),
                        None => break,
                    }
                }
                Ok(profiles)
            })
            .await;

        get_metrics()
            .backend_latency
            .with_label_values(&["list_inference_profiles"])
            .observe(start.elapsed().as_secs_f64());
        result
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct EventStreamState {
    body: ByteStream,
    decoder: EventStreamDecoder,
    read_timeout: Duration,
    done: bool,
}

/// Decode a `converse-stream` body lazily: bytes are read from the network
/// only when the consumer asks for the next event.
fn event_stream(body: ByteStream, read_timeout: Duration) -> BackendEventStream {
    let state = EventStreamState {
        body,
        decoder: EventStreamDecoder::new(),
        read_timeout,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let timeout_secs = state.read_timeout.as_secs();

        loop {
            match state.decoder.next_frame() {
                Ok(Some(frame)) => match frame_to_event(&frame, timeout_secs) {
                    Ok(Some(event)) => return Some((Ok(event), state)),
                    Ok(None) => continue,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }

            match tokio::time::timeout(state.read_timeout, state.body.next()).await {
                Err(_) => {
                    state.done = true;
                    return Some((Err(AppError::BackendTimeout { timeout_secs }), state));
                }
                Ok(Some(Ok(bytes))) => state.decoder.push(&bytes),
                Ok(Some(Err(e))) => {
                    state.done = true;
                    return Some((Err(classify_transport_error(e, timeout_secs)), state));
                }
                Ok(None) => {
                    state.done = true;
                    if state.decoder.pending() > 0 {
                        return Some((
                            Err(AppError::BackendUnavailable(
                                "Bedrock stream ended mid-frame".to_string(),
                            )),
                            state,
                        ));
                    }
                    return None;
                }
            }
        }
    }))
}

#[derive(Deserialize)]
struct ExceptionPayload {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

fn frame_to_event(frame: &Frame, read_timeout_secs: u64) -> Result<Option<ConverseStreamEvent>> {
    match frame.message_type() {
        "event" => {
            let event_type = frame.header(":event-type").unwrap_or_default();
            ConverseStreamEvent::from_event(event_type, &frame.payload).map_err(|e| {
                AppError::BackendUnavailable(format!("Malformed {} event: {}", event_type, e))
            })
        }
        "exception" => {
            let exception_type = frame.header(":exception-type").unwrap_or("unknownException");
            let message = serde_json::from_slice::<ExceptionPayload>(&frame.payload)
                .ok()
                .and_then(|p| p.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());
            Err(exception_to_error(exception_type, &message, read_timeout_secs))
        }
        "error" => Err(AppError::BackendRejected {
            message: format!(
                "Backend stream error: {}",
                frame.header(":error-code").unwrap_or("unknown")
            ),
            upstream_detail: frame.header(":error-message").map(str::to_string),
        }),
        other => {
            tracing::debug!(message_type = other, "Skipping event-stream frame");
            Ok(None)
        }
    }
}

/// Map a transport-level failure.
pub fn classify_transport_error(error: reqwest::Error, timeout_secs: u64) -> AppError {
    if error.is_timeout() {
        AppError::BackendTimeout { timeout_secs }
    } else if error.is_connect() {
        AppError::BackendUnavailable(format!("Cannot reach Bedrock: {}", error))
    } else {
        AppError::BackendUnavailable(format!("Bedrock request failed: {}", error))
    }
}

fn extract_message(body: &str) -> Option<String> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("message")
        .or_else(|| json.get("Message"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_error_type(body: &str) -> Option<String> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("__type")
        .and_then(|v| v.as_str())
        .map(|s| s.rsplit('#').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Map a non-success HTTP status from Bedrock.
pub fn classify_http_error(status: u16, body: &str) -> AppError {
    let message = extract_message(body).unwrap_or_else(|| body.trim().to_string());
    let lower = message.to_lowercase();

    if status == 404 || lower.contains("model identifier is invalid") {
        return AppError::ModelNotFound(message);
    }
    if status >= 500 {
        return AppError::BackendUnavailable(format!("Bedrock returned {}: {}", status, message));
    }

    let label = extract_error_type(body).unwrap_or_else(|| format!("HTTP {}", status));
    AppError::BackendRejected {
        message: format!("Bedrock rejected the request ({})", label),
        upstream_detail: (!message.is_empty()).then_some(message),
    }
}
