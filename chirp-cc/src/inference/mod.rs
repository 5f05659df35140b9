//! Inference collaborators
//!
//! Typed clients for the two external services: the audio classifier
//! (clip bytes in, species out) and the art generator (species in, asset
//! out). Both share one call policy: a total wall-clock deadline, bounded
//! retries with exponential backoff and full jitter, and a per-target
//! circuit breaker that fails fast while the collaborator is down.

pub mod breaker;
mod http;
pub mod retry;

pub use http::{HttpClassifier, HttpGenerator};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Closed error set surfaced by both clients
///
/// `Timeout`, `Unavailable` and `Transport` are produced after the retry
/// budget is spent; `BadRequest` and `Malformed` are immediate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// Total deadline expired
    #[error("Inference call timed out")]
    Timeout,

    /// Collaborator down: breaker open, or 5xx after retries
    #[error("Inference collaborator unavailable")]
    Unavailable,

    /// Collaborator rejected the request (4xx); not retriable
    #[error("Inference request rejected: {0}")]
    BadRequest(String),

    /// Connection-level failure after retries
    #[error("Inference transport error: {0}")]
    Transport(String),

    /// Response could not be decoded
    #[error("Malformed inference response: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Whether another attempt inside the same call could succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout | InferenceError::Unavailable | InferenceError::Transport(_)
        )
    }

    /// The terminal failure reason recorded on a capture
    pub fn failure_reason(&self) -> crate::models::FailureReason {
        use crate::models::FailureReason;
        match self {
            InferenceError::Timeout => FailureReason::Timeout,
            InferenceError::Unavailable => FailureReason::Unavailable,
            InferenceError::BadRequest(_) => FailureReason::BadRequest,
            InferenceError::Transport(_) => FailureReason::Transport,
            InferenceError::Malformed(_) => FailureReason::Malformed,
        }
    }
}

/// Classifier verdict for one clip
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Classification {
    pub species_code: String,
    pub common_name: String,
    pub scientific_name: String,
    /// 0.0 to 1.0; recorded as-is, never gated on
    pub confidence: f64,
}

/// Generator output for one species
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GeneratedArt {
    pub image_url: String,
    pub gif_url: Option<String>,
}

/// Audio classifier contract
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify clip bytes into a species
    ///
    /// `request_id` is derived from the capture id so the collaborator
    /// can deduplicate replays.
    async fn classify(
        &self,
        clip: &[u8],
        content_type: &str,
        request_id: Uuid,
    ) -> Result<Classification, InferenceError>;
}

/// Art generator contract
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate art for a species, returning collaborator-hosted URLs
    async fn generate(
        &self,
        species_code: &str,
        common_name: &str,
        scientific_name: &str,
        request_id: Uuid,
    ) -> Result<GeneratedArt, InferenceError>;

    /// Fetch generated asset bytes so they can be re-homed locally
    async fn download(&self, url: &str) -> Result<Vec<u8>, InferenceError>;
}
