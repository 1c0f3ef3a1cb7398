//! Transition executor.
//!
//! One transition is one storage snapshot with the ticket row locked:
//! 1. Load the ticket for update
//! 2. Refuse terminal tickets
//! 3. Look up the (from, to) policy entry
//! 4. Role check
//! 5. Requirements: photos, notes, technician, customer confirmation
//! 6. Ticket update (state, first-entry timestamp, notes field, version)
//! 7. Status history append
//! 8. Time ledger exit/enter
//! 9. Location sample
//! 10. Commit
//!
//! Any failure aborts the snapshot, so nothing from steps 6-9 is visible.
//! The whole attempt runs under `operation_timeout`; dropping the attempt
//! on expiry drops the snapshot, which rolls it back.

use std::future::Future;
use std::sync::Arc;

use fieldops_storage::{
    GeoPoint, LocationSampleRecord, StatusHistoryRecord, StorageError, TicketRecord, TicketStore,
    TimeLogRecord,
};
use serde::{Deserialize, Serialize};

use crate::clock::{format_timestamp, Clock, SystemClock};
use crate::config::LifecycleConfig;
use crate::confirmation::{
    CodeGenerator, CodePurpose, ConfirmationCodes, IssuedCode, OsRngGenerator, Verification,
};
use crate::error::TransitionError;
use crate::ledger::{self, TimeReport};
use crate::policy::{NotesField, PolicyEntry, PolicyTable};
use crate::state::{Priority, Role, TicketState};

/// Who is performing an operation. The role is trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Caller-supplied data accompanying a transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionPayload {
    pub notes: Option<String>,
    /// Photo references (upload ids or URLs).
    pub photos: Vec<String>,
    pub location: Option<GeoPoint>,
    pub confirmation_code: Option<String>,
    /// Technician to assign on edges that require one.
    pub technician_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TransitionPayload {
    /// Notes with surrounding whitespace removed; blank counts as absent.
    pub fn notes(&self) -> Option<&str> {
        non_blank(self.notes.as_deref())
    }

    fn photo_count(&self) -> usize {
        self.photos.iter().filter(|p| !p.trim().is_empty()).count()
    }
}

/// A committed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub ticket: TicketRecord,
    pub previous_state: TicketState,
    pub new_state: TicketState,
    pub history_entry: StatusHistoryRecord,
    pub closed_time_log: Option<TimeLogRecord>,
    pub opened_time_log: Option<TimeLogRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&TransitionError> for ErrorBody {
    fn from(e: &TransitionError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Wire shape of a transition attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<TicketState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<TicketState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_entry: Option<StatusHistoryRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl From<&Result<TransitionOutcome, TransitionError>> for TransitionResult {
    fn from(result: &Result<TransitionOutcome, TransitionError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                ticket: Some(outcome.ticket.clone()),
                previous_state: Some(outcome.previous_state),
                new_state: Some(outcome.new_state),
                history_entry: Some(outcome.history_entry.clone()),
                error: None,
            },
            Err(e) => Self {
                success: false,
                ticket: None,
                previous_state: None,
                new_state: None,
                history_entry: None,
                error: Some(ErrorBody::from(e)),
            },
        }
    }
}

/// Intake data for a new ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicket {
    pub customer_id: String,
    pub customer_phone: String,
    pub description: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedTicket {
    pub ticket: TicketRecord,
    pub history_entry: StatusHistoryRecord,
    pub time_log: Option<TimeLogRecord>,
}

/// Runs lifecycle operations against a [`TicketStore`].
pub struct TransitionExecutor<S: TicketStore> {
    store: S,
    policy: Arc<PolicyTable>,
    codes: ConfirmationCodes,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl<S: TicketStore> TransitionExecutor<S> {
    pub fn new(store: S, policy: PolicyTable, config: LifecycleConfig) -> Self {
        Self::with_parts(
            store,
            policy,
            config,
            Arc::new(SystemClock),
            Arc::new(OsRngGenerator),
        )
    }

    pub fn with_parts(
        store: S,
        policy: PolicyTable,
        config: LifecycleConfig,
        clock: Arc<dyn Clock>,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        let codes = ConfirmationCodes::new(
            config.code_ttl(),
            config.code_max_attempts,
            generator,
            clock.clone(),
        );
        Self {
            store,
            policy: Arc::new(policy),
            codes,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ── Mutating operations ─────────────────────────────────────────────

    /// Move a ticket to `to`.
    ///
    /// Optimistic conflicts are retried from scratch up to
    /// `max_conflict_retries` times; anything transient left after that is
    /// reported as [`TransitionError::Transient`].
    pub async fn execute_transition(
        &self,
        ticket_id: &str,
        to: TicketState,
        actor: &Actor,
        payload: &TransitionPayload,
    ) -> Result<TransitionOutcome, TransitionError> {
        let mut conflicts = 0;
        let result = loop {
            let attempt = self
                .with_deadline(self.attempt_transition(ticket_id, to, actor, payload))
                .await;
            match attempt {
                Err(TransitionError::Storage(StorageError::ConcurrentConflict { .. }))
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    tracing::debug!(ticket_id, attempt = conflicts, "optimistic conflict, retrying");
                }
                other => break other,
            }
        };
        if let (Err(TransitionError::ConfirmationInvalid), Some(code)) =
            (&result, non_blank(payload.confirmation_code.as_deref()))
        {
            self.record_code_miss(ticket_id, code).await;
        }
        result.map_err(TransitionError::normalize)
    }

    /// Count a wrong completion code after its transition was rolled back.
    async fn record_code_miss(&self, ticket_id: &str, code: &str) {
        let recorded = self
            .with_deadline(async {
                let mut snapshot = self.store.begin_snapshot().await?;
                let staged = self.stage_code_miss(&mut snapshot, ticket_id, code).await;
                self.finish(snapshot, staged).await
            })
            .await;
        if let Err(e) = recorded {
            tracing::warn!(ticket_id, error = %e, "could not record wrong confirmation code");
        }
    }

    async fn stage_code_miss(
        &self,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        code: &str,
    ) -> Result<(), TransitionError> {
        let ticket = self.store.get_ticket_for_update(snapshot, ticket_id).await?;
        let phone = ticket.customer_phone.clone();
        Ok(self
            .codes
            .record_miss(&self.store, snapshot, &ticket.id, &phone, CodePurpose::Completion, code)
            .await?)
    }

    async fn attempt_transition(
        &self,
        ticket_id: &str,
        to: TicketState,
        actor: &Actor,
        payload: &TransitionPayload,
    ) -> Result<TransitionOutcome, TransitionError> {
        let mut snapshot = self.store.begin_snapshot().await?;
        let staged = self
            .stage_transition(&mut snapshot, ticket_id, to, actor, payload)
            .await;
        let outcome = self.finish(snapshot, staged).await;
        match &outcome {
            Ok(o) => tracing::info!(
                ticket_id,
                from = %o.previous_state,
                to = %o.new_state,
                role = %actor.role,
                actor = %actor.id,
                "transition committed"
            ),
            Err(e) => tracing::debug!(
                ticket_id,
                to = %to,
                role = %actor.role,
                code = e.code(),
                "transition rejected"
            ),
        }
        outcome
    }

    async fn stage_transition(
        &self,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        to: TicketState,
        actor: &Actor,
        payload: &TransitionPayload,
    ) -> Result<TransitionOutcome, TransitionError> {
        let store = &self.store;

        // Step 1: load with row lock
        let mut ticket = store.get_ticket_for_update(snapshot, ticket_id).await?;

        // Steps 2-4: edge and role
        let from = stored_state(&ticket)?;
        if self.policy.is_terminal(from) {
            return Err(TransitionError::InvalidTransition { from, to });
        }
        let entry = self
            .policy
            .requirements_for(from, to)
            .ok_or(TransitionError::InvalidTransition { from, to })?;
        if !entry.allows(actor.role) {
            return Err(TransitionError::RoleForbidden {
                from,
                to,
                role: actor.role,
            });
        }

        // Step 5: requirements, fixed order
        let technician = check_requirements(entry, &ticket, payload)?;
        let redeemed = if entry.requires_customer_confirmation {
            let code = non_blank(payload.confirmation_code.as_deref())
                .ok_or(TransitionError::ConfirmationRequired)?;
            let phone = ticket.customer_phone.clone();
            Some(
                self.codes
                    .redeem(store, snapshot, &ticket.id, &phone, CodePurpose::Completion, code)
                    .await?,
            )
        } else {
            None
        };

        // Step 6: one ticket update
        let now = self.clock.now();
        let at = format_timestamp(now);
        ticket.state = to.as_str().to_string();
        ticket
            .state_entered_at
            .entry(to.as_str().to_string())
            .or_insert_with(|| at.clone());
        if let (Some(field), Some(notes)) = (entry.notes_field, payload.notes()) {
            write_notes(&mut ticket, field, notes);
        }
        if technician.is_some() {
            ticket.technician_id = technician;
        }
        if let Some(code) = &redeemed {
            ticket.verification_code_id = Some(code.id.clone());
        }
        ticket.updated_at = at.clone();
        let expected_version = ticket.version;
        ticket.version = store
            .update_ticket(snapshot, expected_version, ticket.clone())
            .await?;

        // Step 7: history
        let sequence = store.status_history_len(snapshot, &ticket.id).await? + 1;
        let history_entry = StatusHistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: ticket.id.clone(),
            sequence,
            from_state: Some(from.as_str().to_string()),
            to_state: to.as_str().to_string(),
            actor_id: actor.id.clone(),
            actor_role: actor.role.as_str().to_string(),
            notes: payload.notes().map(str::to_string),
            photos: payload.photos.clone(),
            location: payload.location,
            metadata: payload.metadata.clone(),
            created_at: at.clone(),
        };
        store
            .insert_status_history(snapshot, history_entry.clone())
            .await?;

        // Step 8: time ledger
        let closed_time_log = ledger::on_exit(store, snapshot, &ticket.id, from, now).await?;
        // Intervals belong to the assigned technician once there is one.
        let worker = ticket.technician_id.as_deref().unwrap_or(&actor.id);
        let opened_time_log = ledger::on_enter(store, snapshot, &ticket.id, to, worker, now).await?;

        // Step 9: location sample
        if let Some(location) = payload.location {
            store
                .insert_location_sample(
                    snapshot,
                    LocationSampleRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        ticket_id: ticket.id.clone(),
                        state: to.as_str().to_string(),
                        location,
                        recorded_by: actor.id.clone(),
                        recorded_at: at,
                    },
                )
                .await?;
        }

        Ok(TransitionOutcome {
            ticket,
            previous_state: from,
            new_state: to,
            history_entry,
            closed_time_log,
            opened_time_log,
        })
    }

    /// Create a ticket in the initial state with its creation history event
    /// and its first open time log.
    pub async fn create_ticket(
        &self,
        new: &NewTicket,
        actor: &Actor,
    ) -> Result<CreatedTicket, TransitionError> {
        for (field, value) in [
            ("customer_id", &new.customer_id),
            ("customer_phone", &new.customer_phone),
            ("description", &new.description),
        ] {
            if value.trim().is_empty() {
                return Err(TransitionError::InvalidRequest(format!("{field} must not be blank")));
            }
        }

        let created = self
            .with_deadline(async {
                let mut snapshot = self.store.begin_snapshot().await?;
                let staged = self.stage_create(&mut snapshot, new, actor).await;
                self.finish(snapshot, staged).await
            })
            .await
            .map_err(TransitionError::normalize)?;

        tracing::info!(
            ticket_id = %created.ticket.id,
            ticket_number = %created.ticket.ticket_number,
            actor = %actor.id,
            "ticket created"
        );
        Ok(created)
    }

    async fn stage_create(
        &self,
        snapshot: &mut S::Snapshot,
        new: &NewTicket,
        actor: &Actor,
    ) -> Result<CreatedTicket, TransitionError> {
        let store = &self.store;
        let now = self.clock.now();
        let at = format_timestamp(now);
        let sequence = store.next_ticket_sequence(snapshot).await?;
        let initial = TicketState::INITIAL;

        let ticket = TicketRecord {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_number: format!(
                "{}-{}-{:06}",
                self.config.ticket_number_prefix,
                now.year(),
                sequence
            ),
            state: initial.as_str().to_string(),
            priority: new.priority.as_str().to_string(),
            customer_id: new.customer_id.trim().to_string(),
            customer_phone: new.customer_phone.trim().to_string(),
            technician_id: None,
            address: non_blank(new.address.as_deref()).map(str::to_string),
            description: new.description.trim().to_string(),
            diagnosis_notes: None,
            repair_notes: None,
            workshop_notes: None,
            cancellation_reason: None,
            verification_code_id: None,
            state_entered_at: [(initial.as_str().to_string(), at.clone())].into(),
            created_at: at.clone(),
            updated_at: at.clone(),
            version: 0,
        };
        store.insert_ticket(snapshot, ticket.clone()).await?;

        let history_entry = StatusHistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: ticket.id.clone(),
            sequence: 1,
            from_state: None,
            to_state: initial.as_str().to_string(),
            actor_id: actor.id.clone(),
            actor_role: actor.role.as_str().to_string(),
            notes: None,
            photos: Vec::new(),
            location: None,
            metadata: None,
            created_at: at,
        };
        store
            .insert_status_history(snapshot, history_entry.clone())
            .await?;
        let time_log = ledger::on_enter(store, snapshot, &ticket.id, initial, &actor.id, now).await?;

        Ok(CreatedTicket {
            ticket,
            history_entry,
            time_log,
        })
    }

    /// Issue a fresh code, superseding earlier ones for the same key.
    ///
    /// `phone` defaults to the ticket's customer phone. Completion codes can
    /// only go to that phone, since the completion edge redeems against it.
    /// Completion codes may be sent by any role allowed to complete a ticket;
    /// login codes only by `system` and `admin`.
    pub async fn issue_confirmation_code(
        &self,
        ticket_id: &str,
        phone: Option<&str>,
        purpose: CodePurpose,
        actor: &Actor,
    ) -> Result<IssuedCode, TransitionError> {
        if !self.may_issue(actor.role, purpose) {
            return Err(TransitionError::IssueForbidden {
                role: actor.role,
                purpose,
            });
        }
        self.with_deadline(async {
            let mut snapshot = self.store.begin_snapshot().await?;
            let staged = self.stage_issue(&mut snapshot, ticket_id, phone, purpose).await;
            self.finish(snapshot, staged).await
        })
        .await
        .map_err(TransitionError::normalize)
    }

    async fn stage_issue(
        &self,
        snapshot: &mut S::Snapshot,
        ticket_id: &str,
        phone: Option<&str>,
        purpose: CodePurpose,
    ) -> Result<IssuedCode, TransitionError> {
        // Ticket lock first, same order as a transition redeeming a code.
        let ticket = self.store.get_ticket_for_update(snapshot, ticket_id).await?;
        let phone = code_phone(&ticket, phone, purpose)?;
        Ok(self
            .codes
            .issue(&self.store, snapshot, &ticket.id, &phone, purpose)
            .await?)
    }

    fn may_issue(&self, role: Role, purpose: CodePurpose) -> bool {
        match purpose {
            CodePurpose::Completion => self
                .policy
                .entries()
                .any(|e| e.requires_customer_confirmation && e.allows(role)),
            CodePurpose::Login => matches!(role, Role::System | Role::Admin),
        }
    }

    /// Check a code a customer read back. Succeeds at most once per code.
    pub async fn verify_confirmation_code(
        &self,
        ticket_id: &str,
        phone: Option<&str>,
        purpose: CodePurpose,
        code: &str,
    ) -> Result<Verification, TransitionError> {
        let ticket = self.store.get_ticket(ticket_id).await?;
        let phone = code_phone(&ticket, phone, purpose)?;
        let verification = self
            .with_deadline(async {
                let mut snapshot = self.store.begin_snapshot().await?;
                let staged = self
                    .codes
                    .verify(&self.store, &mut snapshot, ticket_id, &phone, purpose, code)
                    .await
                    .map_err(TransitionError::from);
                self.finish(snapshot, staged).await
            })
            .await
            .map_err(TransitionError::normalize)?;
        tracing::debug!(ticket_id, purpose = %purpose, ?verification, "confirmation code checked");
        Ok(verification)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Targets the policy allows from the ticket's current state for `role`.
    pub async fn available_transitions(
        &self,
        ticket_id: &str,
        role: Role,
    ) -> Result<Vec<TicketState>, TransitionError> {
        let ticket = self.store.get_ticket(ticket_id).await?;
        let from = stored_state(&ticket)?;
        Ok(self
            .policy
            .allowed_targets_for_role(from, role)
            .into_iter()
            .collect())
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, TransitionError> {
        Ok(self.store.get_ticket(ticket_id).await?)
    }

    pub async fn list_tickets(
        &self,
        state: Option<TicketState>,
    ) -> Result<Vec<TicketRecord>, TransitionError> {
        Ok(self.store.list_tickets(state.map(TicketState::as_str)).await?)
    }

    pub async fn history(&self, ticket_id: &str) -> Result<Vec<StatusHistoryRecord>, TransitionError> {
        self.store.get_ticket(ticket_id).await?;
        Ok(self.store.list_status_history(ticket_id).await?)
    }

    pub async fn time_logs(&self, ticket_id: &str) -> Result<Vec<TimeLogRecord>, TransitionError> {
        self.store.get_ticket(ticket_id).await?;
        Ok(self.store.list_time_logs(ticket_id).await?)
    }

    pub async fn time_report(&self, ticket_id: &str) -> Result<TimeReport, TransitionError> {
        let logs = self.time_logs(ticket_id).await?;
        Ok(ledger::summarize(&logs, self.clock.now()))
    }

    pub async fn location_samples(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<LocationSampleRecord>, TransitionError> {
        self.store.get_ticket(ticket_id).await?;
        Ok(self.store.list_location_samples(ticket_id).await?)
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Commit on success, abort on failure.
    async fn finish<T>(
        &self,
        snapshot: S::Snapshot,
        staged: Result<T, TransitionError>,
    ) -> Result<T, TransitionError> {
        match staged {
            Ok(value) => {
                self.store.commit_snapshot(snapshot).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = self.store.abort_snapshot(snapshot).await {
                    tracing::warn!(error = %abort, "snapshot abort failed");
                }
                Err(e)
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = Result<T, TransitionError>>,
    ) -> Result<T, TransitionError> {
        match tokio::time::timeout(self.config.operation_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.operation_timeout_ms,
                    "operation timed out and was rolled back"
                );
                Err(TransitionError::Transient(format!(
                    "operation exceeded {} ms",
                    self.config.operation_timeout_ms
                )))
            }
        }
    }
}

/// Photos, then notes, then technician. Returns the technician to assign.
fn check_requirements(
    entry: &PolicyEntry,
    ticket: &TicketRecord,
    payload: &TransitionPayload,
) -> Result<Option<String>, TransitionError> {
    let provided = payload.photo_count();
    if provided < entry.min_photos as usize {
        return Err(TransitionError::MissingPhotos {
            to: entry.to,
            required: entry.min_photos,
            provided,
        });
    }
    if entry.requires_notes && payload.notes().is_none() {
        return Err(TransitionError::MissingNotes {
            from: entry.from,
            to: entry.to,
        });
    }
    if !entry.requires_technician {
        return Ok(None);
    }
    non_blank(payload.technician_id.as_deref())
        .or(ticket.technician_id.as_deref())
        .map(|t| Some(t.to_string()))
        .ok_or(TransitionError::MissingTechnician { to: entry.to })
}

fn write_notes(ticket: &mut TicketRecord, field: NotesField, notes: &str) {
    let slot = match field {
        NotesField::DiagnosisNotes => &mut ticket.diagnosis_notes,
        NotesField::RepairNotes => &mut ticket.repair_notes,
        NotesField::WorkshopNotes => &mut ticket.workshop_notes,
        NotesField::CancellationReason => &mut ticket.cancellation_reason,
    };
    *slot = Some(notes.to_string());
}

fn stored_state(ticket: &TicketRecord) -> Result<TicketState, TransitionError> {
    ticket.state.parse().map_err(|e| {
        TransitionError::Storage(StorageError::Backend(format!(
            "ticket {} holds {e}",
            ticket.id
        )))
    })
}

fn code_phone(
    ticket: &TicketRecord,
    phone: Option<&str>,
    purpose: CodePurpose,
) -> Result<String, TransitionError> {
    match non_blank(phone) {
        None => Ok(ticket.customer_phone.clone()),
        Some(p) if purpose == CodePurpose::Completion && p != ticket.customer_phone => {
            Err(TransitionError::InvalidRequest(
                "completion codes are sent to the customer phone on file".to_string(),
            ))
        }
        Some(p) => Ok(p.to_string()),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
