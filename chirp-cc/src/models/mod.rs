//! Row types and domain enums
//!
//! Rows are joined by id, never by in-memory back-references; any
//! traversal is an explicit repository query. Timestamps are stored as
//! unix microseconds so SQL comparisons (heartbeat ordering, reaper
//! cutoff, pagination cursors) stay exact, and converted to `chrono`
//! values at the API edge.

use chirp_common::time::micros_to_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Capture processing states
///
/// `Processed` and `Failed` are terminal; a capture in a terminal state
/// never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    Classifying,
    Classified,
    Generating,
    Processed,
    Failed,
}

impl CaptureStatus {
    /// Stable wire/storage string for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Classifying => "classifying",
            CaptureStatus::Classified => "classified",
            CaptureStatus::Generating => "generating",
            CaptureStatus::Processed => "processed",
            CaptureStatus::Failed => "failed",
        }
    }

    /// Parse a storage string back to a state
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CaptureStatus::Pending),
            "classifying" => Some(CaptureStatus::Classifying),
            "classified" => Some(CaptureStatus::Classified),
            "generating" => Some(CaptureStatus::Generating),
            "processed" => Some(CaptureStatus::Processed),
            "failed" => Some(CaptureStatus::Failed),
            _ => None,
        }
    }

    /// True for `processed` / `failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureStatus::Processed | CaptureStatus::Failed)
    }

    /// All non-terminal states (reaper scan set)
    pub fn non_terminal() -> [CaptureStatus; 4] {
        [
            CaptureStatus::Pending,
            CaptureStatus::Classifying,
            CaptureStatus::Classified,
            CaptureStatus::Generating,
        ]
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure reasons recorded on the capture row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Clip bytes were missing from the clip store at claim time
    ClipMissing,
    /// Classifier unavailable (breaker open, or 5xx after retries)
    Unavailable,
    /// Classifier call exceeded its deadline
    Timeout,
    /// Transport-level failure talking to the classifier
    Transport,
    /// Classifier rejected the clip (4xx)
    BadRequest,
    /// Classifier response could not be decoded
    Malformed,
    /// Stuck in a non-terminal state past the reaper threshold
    Orphaned,
    /// Job abandoned during coordinator shutdown
    Shutdown,
    /// Job exceeded the dispatcher deadline
    Deadline,
    /// Dispatcher queue was full at ingress
    Busy,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ClipMissing => "clip_missing",
            FailureReason::Unavailable => "unavailable",
            FailureReason::Timeout => "timeout",
            FailureReason::Transport => "transport",
            FailureReason::BadRequest => "bad_request",
            FailureReason::Malformed => "malformed",
            FailureReason::Orphaned => "orphaned",
            FailureReason::Shutdown => "shutdown",
            FailureReason::Deadline => "deadline",
            FailureReason::Busy => "busy",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Note recorded on a processed capture whose art generation failed
pub const NOTE_ART_UNAVAILABLE: &str = "art_unavailable";

/// Clip owner identity
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub handle: String,
    #[allow(dead_code)]
    pub credential_hash: String,
}

/// A field capture endpoint, owned by exactly one user
///
/// Registered on first use; heartbeats update telemetry afterwards.
#[derive(Debug, Clone, FromRow)]
pub struct Device {
    pub id: String,
    pub user_id: Uuid,
    pub firmware_version: String,
    /// Free-form capability map, stored as JSON text
    pub capabilities: Option<String>,
    pub last_seen_micros: i64,
    pub battery_voltage: Option<f64>,
    pub rssi: Option<i64>,
    pub created_micros: i64,
}

impl Device {
    pub fn last_seen(&self) -> DateTime<Utc> {
        micros_to_datetime(self.last_seen_micros)
    }

    pub fn capabilities_json(&self) -> serde_json::Value {
        self.capabilities
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// A classifier output identity; the unit artwork attaches to
#[derive(Debug, Clone, FromRow)]
pub struct Species {
    pub id: Uuid,
    /// Classifier's canonical key, unique
    pub code: String,
    pub common_name: String,
    pub scientific_name: String,
    /// Set once by the first successful generation, never overwritten
    pub asset_url: Option<String>,
    pub gif_url: Option<String>,
    pub created_micros: i64,
}

/// One uploaded clip and all downstream processing state for it
#[derive(Debug, Clone, FromRow)]
pub struct Capture {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    /// SHA-256 content hash of the clip bytes; key into the clip store
    pub clip_key: String,
    pub device_seq: i64,
    pub content_type: String,
    pub status: String,
    pub species_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
    pub attempts: i64,
    /// Device clock at capture time, when the device declared one
    pub recorded_micros: Option<i64>,
    pub received_micros: i64,
    pub processed_micros: Option<i64>,
    pub updated_micros: i64,
}

impl Capture {
    pub fn status(&self) -> CaptureStatus {
        CaptureStatus::parse(&self.status).unwrap_or(CaptureStatus::Failed)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        micros_to_datetime(self.received_micros)
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_micros.map(micros_to_datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            CaptureStatus::Pending,
            CaptureStatus::Classifying,
            CaptureStatus::Classified,
            CaptureStatus::Generating,
            CaptureStatus::Processed,
            CaptureStatus::Failed,
        ] {
            assert_eq!(CaptureStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CaptureStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(CaptureStatus::Processed.is_terminal());
        assert!(CaptureStatus::Failed.is_terminal());
        for status in CaptureStatus::non_terminal() {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_failure_reason_strings() {
        assert_eq!(FailureReason::Orphaned.as_str(), "orphaned");
        assert_eq!(FailureReason::ClipMissing.to_string(), "clip_missing");
    }

    #[test]
    fn test_device_capabilities_json() {
        let device = Device {
            id: "CHIRP-AABBCC".to_string(),
            user_id: Uuid::new_v4(),
            firmware_version: "1.2.0".to_string(),
            capabilities: Some(r#"{"dual_mic":true}"#.to_string()),
            last_seen_micros: 0,
            battery_voltage: Some(3.9),
            rssi: Some(-61),
            created_micros: 0,
        };
        assert_eq!(device.capabilities_json()["dual_mic"], true);

        let bare = Device {
            capabilities: None,
            ..device
        };
        assert!(bare.capabilities_json().is_null());
    }
}
