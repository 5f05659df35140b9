//! HTTP-backed inference clients
//!
//! Both collaborators sit behind the same call policy: admission through
//! the shared circuit breaker, a total wall-clock deadline around the
//! whole call, and retries with backoff inside it.

use super::breaker::{Admission, CircuitBreaker};
use super::retry::{run_with_retry, RetryPolicy};
use super::{Classification, Classifier, GeneratedArt, Generator, InferenceError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const USER_AGENT: &str = concat!("chirp-cc/", env!("CARGO_PKG_VERSION"));

/// Shared deadline + retry + breaker wrapper
pub(crate) struct CallPolicy {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    deadline: Duration,
}

impl CallPolicy {
    fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, deadline: Duration) -> Self {
        Self {
            breaker,
            retry,
            deadline,
        }
    }

    /// Run one logical call: breaker admission, deadline, retries
    ///
    /// The breaker records one outcome per logical call; only
    /// availability-class errors count against it.
    async fn run<T, F, Fut>(&self, target: &'static str, op: F) -> Result<T, InferenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        if self.breaker.admit() == Admission::Denied {
            tracing::debug!(target, "Breaker open, failing fast");
            return Err(InferenceError::Unavailable);
        }

        let result = match tokio::time::timeout(
            self.deadline,
            run_with_retry(target, self.retry, op),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(InferenceError::Timeout),
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_retriable() => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}

/// Map a reqwest transport error into the closed error set
fn map_transport(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else if e.is_decode() {
        InferenceError::Malformed(e.to_string())
    } else {
        InferenceError::Transport(e.to_string())
    }
}

/// Map a non-success status into the closed error set
fn map_status(status: reqwest::StatusCode, body: String) -> InferenceError {
    if status.is_server_error() {
        InferenceError::Unavailable
    } else {
        InferenceError::BadRequest(format!("{}: {}", status.as_u16(), body))
    }
}

fn build_client() -> Result<reqwest::Client, InferenceError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| InferenceError::Transport(e.to_string()))
}

/// Classifier service client (`POST /classify`, multipart audio)
pub struct HttpClassifier {
    http: reqwest::Client,
    base_url: String,
    policy: CallPolicy,
}

impl HttpClassifier {
    pub fn new(
        base_url: impl Into<String>,
        deadline: Duration,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.into(),
            policy: CallPolicy::new(breaker, retry, deadline),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/classify", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        clip: &[u8],
        content_type: &str,
        request_id: Uuid,
    ) -> Result<Classification, InferenceError> {
        let endpoint = self.endpoint();
        let clip = clip.to_vec();
        let content_type = content_type.to_string();

        self.policy
            .run("classifier", || {
                let endpoint = endpoint.clone();
                let clip = clip.clone();
                let content_type = content_type.clone();
                async move {
                    let part = reqwest::multipart::Part::bytes(clip)
                        .file_name("clip")
                        .mime_str(&content_type)
                        .map_err(|e| InferenceError::BadRequest(e.to_string()))?;
                    let form = reqwest::multipart::Form::new()
                        .part("audio_file", part)
                        .text("request_id", request_id.to_string());

                    let response = self
                        .http
                        .post(&endpoint)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(map_transport)?;

                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(map_status(status, body));
                    }

                    response
                        .json::<Classification>()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()))
                }
            })
            .await
    }
}

/// Generator service client (`POST /generate`, JSON in and out)
pub struct HttpGenerator {
    http: reqwest::Client,
    base_url: String,
    policy: CallPolicy,
}

impl HttpGenerator {
    pub fn new(
        base_url: impl Into<String>,
        deadline: Duration,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.into(),
            policy: CallPolicy::new(breaker, retry, deadline),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        species_code: &str,
        common_name: &str,
        scientific_name: &str,
        request_id: Uuid,
    ) -> Result<GeneratedArt, InferenceError> {
        let endpoint = self.endpoint();
        let body = serde_json::json!({
            "species_code": species_code,
            "common_name": common_name,
            "scientific_name": scientific_name,
            "request_id": request_id,
        });

        self.policy
            .run("generator", || {
                let endpoint = endpoint.clone();
                let body = body.clone();
                async move {
                    let response = self
                        .http
                        .post(&endpoint)
                        .json(&body)
                        .send()
                        .await
                        .map_err(map_transport)?;

                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(map_status(status, text));
                    }

                    response
                        .json::<GeneratedArt>()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()))
                }
            })
            .await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, InferenceError> {
        let url = url.to_string();
        self.policy
            .run("generator-asset", || {
                let url = url.clone();
                async move {
                    let response = self.http.get(&url).send().await.map_err(map_transport)?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(map_status(status, text));
                    }
                    let bytes = response.bytes().await.map_err(map_transport)?;
                    Ok(bytes.to_vec())
                }
            })
            .await
    }
}
