use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A snapshot of a ticket as stored in the backend.
///
/// States and roles are stored by name; the engine owns their vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    pub ticket_number: String,
    pub state: String,
    pub priority: String,
    pub customer_id: String,
    pub customer_phone: String,
    pub technician_id: Option<String>,
    pub address: Option<String>,
    pub description: String,
    pub diagnosis_notes: Option<String>,
    pub repair_notes: Option<String>,
    pub workshop_notes: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Id of the confirmation code redeemed when the ticket was completed.
    pub verification_code_id: Option<String>,
    /// State name -> RFC 3339 timestamp of the first entry into that state.
    pub state_entered_at: BTreeMap<String, String>,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub created_at: String,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub updated_at: String,
    pub version: i64,
}

/// A geographic position reported by a field device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

/// One entry of the append-only audit trail.
///
/// `from_state` is `None` only for the creation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryRecord {
    pub id: String,
    pub ticket_id: String,
    /// 1-based position of this entry in the ticket's history.
    pub sequence: u64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub actor_id: String,
    pub actor_role: String,
    pub notes: Option<String>,
    pub photos: Vec<String>,
    pub location: Option<GeoPoint>,
    /// Free-form caller data passed through with the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

/// A contiguous interval a ticket spent in one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLogRecord {
    pub id: String,
    pub ticket_id: String,
    pub state: String,
    pub technician_id: String,
    pub started_at: String,
    /// None while the interval is open.
    pub ended_at: Option<String>,
    /// Whole seconds, set when the interval is closed.
    pub duration_secs: Option<i64>,
}

impl TimeLogRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A location sample captured alongside a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSampleRecord {
    pub id: String,
    pub ticket_id: String,
    pub state: String,
    pub location: GeoPoint,
    pub recorded_by: String,
    pub recorded_at: String,
}

/// A short-lived one-time code. Only the SHA-256 of the code is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationCodeRecord {
    pub id: String,
    pub ticket_id: String,
    pub phone: String,
    pub purpose: String,
    pub code_hash: String,
    pub expires_at: String,
    pub verified_at: Option<String>,
    pub redeemed_at: Option<String>,
    pub superseded_at: Option<String>,
    /// Wrong codes tried against this one.
    #[serde(default)]
    pub failed_attempts: u32,
    pub created_at: String,
}

impl ConfirmationCodeRecord {
    /// Not yet verified, redeemed, or replaced by a newer code.
    pub fn is_outstanding(&self) -> bool {
        self.verified_at.is_none() && self.redeemed_at.is_none() && self.superseded_at.is_none()
    }
}
