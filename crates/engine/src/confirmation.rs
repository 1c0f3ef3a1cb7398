//! Short-lived numeric confirmation codes.
//!
//! A code belongs to a (ticket, phone, purpose) key. Only its SHA-256 is
//! stored. Issuing a new code supersedes every outstanding code for the same
//! key, so at most one code is ever "current".
//!
//! Two ways to use a completion code:
//! - `verify` it first (customer reads it back), then pass it with the
//!   transition, which redeems the already-verified code;
//! - pass it straight to the transition, which verifies and redeems it in
//!   one step.
//!
//! Either way a code is redeemed at most once and only before it expires,
//! inside the transition's own snapshot, so an aborted transition leaves it
//! usable. Wrong guesses are counted per code; after `max_attempts` of them
//! the code is superseded and a new one has to be issued.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use fieldops_storage::{ConfirmationCodeRecord, StorageError, TicketStore};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::clock::{format_timestamp, parse_timestamp, Clock};
use crate::error::TransitionError;
use crate::state::UnknownName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePurpose {
    /// Customer confirms the repaired device was handed over.
    Completion,
    Login,
}

impl CodePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            CodePurpose::Completion => "completion",
            CodePurpose::Login => "login",
        }
    }

    pub fn code_length(self) -> usize {
        match self {
            CodePurpose::Completion => 4,
            CodePurpose::Login => 6,
        }
    }
}

impl fmt::Display for CodePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodePurpose {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completion" => Ok(CodePurpose::Completion),
            "login" => Ok(CodePurpose::Login),
            other => Err(UnknownName {
                kind: "code purpose",
                value: other.to_string(),
            }),
        }
    }
}

/// Source of code digits.
pub trait CodeGenerator: Send + Sync + 'static {
    fn generate(&self, length: usize) -> String;
}

/// Digits from the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRngGenerator;

impl CodeGenerator for OsRngGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

/// A freshly issued code. `code` is the only copy of the plaintext and is
/// never serialized; it reaches the customer through the notifier only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedCode {
    pub code_id: String,
    pub ticket_id: String,
    pub phone: String,
    pub purpose: CodePurpose,
    #[serde(skip_serializing)]
    pub code: String,
    pub expires_at: String,
    /// How many earlier codes this one replaced.
    pub superseded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Invalid,
    Expired,
}

impl Verification {
    pub fn is_verified(self) -> bool {
        self == Verification::Verified
    }
}

/// Issue, verify and redeem codes inside a caller-owned snapshot.
#[derive(Clone)]
pub struct ConfirmationCodes {
    ttl: time::Duration,
    max_attempts: u32,
    generator: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
}

impl ConfirmationCodes {
    pub fn new(
        ttl: time::Duration,
        max_attempts: u32,
        generator: Arc<dyn CodeGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ttl,
            max_attempts: max_attempts.max(1),
            generator,
            clock,
        }
    }

    pub async fn issue<S: TicketStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: CodePurpose,
    ) -> Result<IssuedCode, StorageError> {
        let now = self.clock.now();
        let issued_at = format_timestamp(now);
        let superseded = store
            .supersede_confirmation_codes(snapshot, ticket_id, phone, purpose.as_str(), &issued_at)
            .await?;

        let code = self.generator.generate(purpose.code_length());
        let record = ConfirmationCodeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: ticket_id.to_string(),
            phone: phone.to_string(),
            purpose: purpose.as_str().to_string(),
            code_hash: hash_code(ticket_id, &code),
            expires_at: format_timestamp(now + self.ttl),
            verified_at: None,
            redeemed_at: None,
            superseded_at: None,
            failed_attempts: 0,
            created_at: issued_at,
        };
        let issued = IssuedCode {
            code_id: record.id.clone(),
            ticket_id: ticket_id.to_string(),
            phone: phone.to_string(),
            purpose,
            code,
            expires_at: record.expires_at.clone(),
            superseded,
        };
        store.insert_confirmation_code(snapshot, record).await?;

        tracing::debug!(ticket_id, purpose = %purpose, superseded, "confirmation code issued");
        Ok(issued)
    }

    /// Check `code` against the current code and mark it verified.
    ///
    /// Succeeds at most once per issued code. A wrong code counts against
    /// the current one.
    pub async fn verify<S: TicketStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: CodePurpose,
        code: &str,
    ) -> Result<Verification, StorageError> {
        let Some(mut current) = store
            .get_confirmation_code_for_update(snapshot, ticket_id, phone, purpose.as_str())
            .await?
        else {
            return Ok(Verification::Invalid);
        };
        if current.redeemed_at.is_some() {
            return Ok(Verification::Invalid);
        }
        if current.code_hash != hash_code(ticket_id, code) {
            self.count_miss(store, snapshot, current).await?;
            return Ok(Verification::Invalid);
        }
        if current.verified_at.is_some() {
            return Ok(Verification::Invalid);
        }
        let now = self.clock.now();
        if is_expired(&current, now)? {
            return Ok(Verification::Expired);
        }

        current.verified_at = Some(format_timestamp(now));
        store.update_confirmation_code(snapshot, current).await?;
        Ok(Verification::Verified)
    }

    /// Bind `code` to the transition running in `snapshot`.
    ///
    /// Accepts the current code if it matches, is unredeemed and has not
    /// expired, whether or not it was verified first.
    pub(crate) async fn redeem<S: TicketStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: CodePurpose,
        code: &str,
    ) -> Result<ConfirmationCodeRecord, TransitionError> {
        let mut current = store
            .get_confirmation_code_for_update(snapshot, ticket_id, phone, purpose.as_str())
            .await?
            .ok_or(TransitionError::ConfirmationInvalid)?;
        if current.redeemed_at.is_some() || current.code_hash != hash_code(ticket_id, code) {
            return Err(TransitionError::ConfirmationInvalid);
        }

        let now = self.clock.now();
        if is_expired(&current, now)? {
            return Err(TransitionError::ConfirmationExpired);
        }
        let at = format_timestamp(now);
        if current.verified_at.is_none() {
            current.verified_at = Some(at.clone());
        }
        current.redeemed_at = Some(at);
        store.update_confirmation_code(snapshot, current.clone()).await?;
        Ok(current)
    }

    /// Count a wrong `code` against the current code.
    ///
    /// Redemption runs inside the transition snapshot, which aborts on a
    /// wrong code, so callers record the miss in a snapshot of its own.
    pub(crate) async fn record_miss<S: TicketStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: CodePurpose,
        code: &str,
    ) -> Result<(), StorageError> {
        let Some(current) = store
            .get_confirmation_code_for_update(snapshot, ticket_id, phone, purpose.as_str())
            .await?
        else {
            return Ok(());
        };
        if current.redeemed_at.is_some() || current.code_hash == hash_code(ticket_id, code) {
            return Ok(());
        }
        self.count_miss(store, snapshot, current).await
    }

    async fn count_miss<S: TicketStore>(
        &self,
        store: &S,
        snapshot: &mut S::Snapshot,
        mut current: ConfirmationCodeRecord,
    ) -> Result<(), StorageError> {
        current.failed_attempts += 1;
        if current.failed_attempts >= self.max_attempts {
            current.superseded_at = Some(format_timestamp(self.clock.now()));
            tracing::warn!(
                ticket_id = %current.ticket_id,
                purpose = %current.purpose,
                attempts = current.failed_attempts,
                "confirmation code withdrawn after repeated wrong attempts"
            );
        }
        store.update_confirmation_code(snapshot, current).await
    }
}

/// Hex SHA-256 of the code, salted with the ticket id.
fn hash_code(ticket_id: &str, code: &str) -> String {
    let digest = Sha256::digest(format!("{ticket_id}:{}", code.trim()).as_bytes());
    format!("{digest:x}")
}

fn is_expired(record: &ConfirmationCodeRecord, now: OffsetDateTime) -> Result<bool, StorageError> {
    let expires_at = parse_timestamp(&record.expires_at).map_err(|e| {
        StorageError::Backend(format!(
            "confirmation code {} has malformed expires_at: {e}",
            record.id
        ))
    })?;
    Ok(now >= expires_at)
}
