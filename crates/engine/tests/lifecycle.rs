//! End-to-end lifecycle tests against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fieldops_engine::{
    Actor, CodeGenerator, CodePurpose, LifecycleConfig, LifecycleService, ManualClock,
    MessagePurpose, NewTicket, NotificationDispatcher, NotifyError, PolicyTable, Priority, Role,
    TicketState, TransitionError, TransitionExecutor, TransitionPayload, Verification,
};
use fieldops_storage::{
    ConfirmationCodeRecord, GeoPoint, LocationSampleRecord, MemorySnapshot, MemoryStore,
    StatusHistoryRecord, StorageError, TicketRecord, TicketStore, TimeLogRecord,
};
use time::macros::datetime;

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

/// Deterministic, distinct codes: 1000, 1001, ...
struct SequentialCodes(AtomicU32);

impl CodeGenerator for SequentialCodes {
    fn generate(&self, length: usize) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        format!("{:0>width$}", n % 10u32.pow(length as u32), width = length)
    }
}

#[derive(Debug, Clone)]
struct Sent {
    phone: String,
    message: String,
    purpose: MessagePurpose,
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<Sent>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(
        &self,
        phone: &str,
        message: &str,
        purpose: MessagePurpose,
    ) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError("gateway unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(Sent {
            phone: phone.to_string(),
            message: message.to_string(),
            purpose,
        });
        Ok(())
    }
}

/// `MemoryStore` with switchable faults.
#[derive(Clone, Default)]
struct FaultyStore {
    inner: MemoryStore,
    fail_locations: Arc<AtomicBool>,
    stall_history: Arc<AtomicBool>,
    conflicts_left: Arc<AtomicU32>,
}

#[async_trait]
impl TicketStore for FaultyStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        self.inner.begin_snapshot().await
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.commit_snapshot(snapshot).await
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.abort_snapshot(snapshot).await
    }

    async fn next_ticket_sequence(
        &self,
        snapshot: &mut MemorySnapshot,
    ) -> Result<u64, StorageError> {
        self.inner.next_ticket_sequence(snapshot).await
    }

    async fn insert_ticket(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TicketRecord,
    ) -> Result<(), StorageError> {
        self.inner.insert_ticket(snapshot, record).await
    }

    async fn get_ticket_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<TicketRecord, StorageError> {
        self.inner.get_ticket_for_update(snapshot, ticket_id).await
    }

    async fn update_ticket(
        &self,
        snapshot: &mut MemorySnapshot,
        expected_version: i64,
        record: TicketRecord,
    ) -> Result<i64, StorageError> {
        let injected = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::ConcurrentConflict {
                ticket_id: record.id,
                expected_version,
            });
        }
        self.inner.update_ticket(snapshot, expected_version, record).await
    }

    async fn insert_status_history(
        &self,
        snapshot: &mut MemorySnapshot,
        record: StatusHistoryRecord,
    ) -> Result<(), StorageError> {
        if self.stall_history.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.insert_status_history(snapshot, record).await
    }

    async fn status_history_len(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<u64, StorageError> {
        self.inner.status_history_len(snapshot, ticket_id).await
    }

    async fn find_open_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<Option<TimeLogRecord>, StorageError> {
        self.inner.find_open_time_log(snapshot, ticket_id).await
    }

    async fn insert_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TimeLogRecord,
    ) -> Result<(), StorageError> {
        self.inner.insert_time_log(snapshot, record).await
    }

    async fn close_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        time_log_id: &str,
        ended_at: &str,
        duration_secs: i64,
    ) -> Result<TimeLogRecord, StorageError> {
        self.inner
            .close_time_log(snapshot, time_log_id, ended_at, duration_secs)
            .await
    }

    async fn insert_location_sample(
        &self,
        snapshot: &mut MemorySnapshot,
        record: LocationSampleRecord,
    ) -> Result<(), StorageError> {
        if self.fail_locations.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("location table offline".to_string()));
        }
        self.inner.insert_location_sample(snapshot, record).await
    }

    async fn get_confirmation_code_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
    ) -> Result<Option<ConfirmationCodeRecord>, StorageError> {
        self.inner
            .get_confirmation_code_for_update(snapshot, ticket_id, phone, purpose)
            .await
    }

    async fn supersede_confirmation_codes(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
        superseded_at: &str,
    ) -> Result<usize, StorageError> {
        self.inner
            .supersede_confirmation_codes(snapshot, ticket_id, phone, purpose, superseded_at)
            .await
    }

    async fn insert_confirmation_code(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError> {
        self.inner.insert_confirmation_code(snapshot, record).await
    }

    async fn update_confirmation_code(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError> {
        self.inner.update_confirmation_code(snapshot, record).await
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, StorageError> {
        self.inner.get_ticket(ticket_id).await
    }

    async fn list_tickets(
        &self,
        state_filter: Option<&str>,
    ) -> Result<Vec<TicketRecord>, StorageError> {
        self.inner.list_tickets(state_filter).await
    }

    async fn list_status_history(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<StatusHistoryRecord>, StorageError> {
        self.inner.list_status_history(ticket_id).await
    }

    async fn list_time_logs(&self, ticket_id: &str) -> Result<Vec<TimeLogRecord>, StorageError> {
        self.inner.list_time_logs(ticket_id).await
    }

    async fn list_location_samples(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<LocationSampleRecord>, StorageError> {
        self.inner.list_location_samples(ticket_id).await
    }

    async fn list_confirmation_codes(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<ConfirmationCodeRecord>, StorageError> {
        self.inner.list_confirmation_codes(ticket_id).await
    }
}

struct Harness<S: TicketStore> {
    service: LifecycleService<S>,
    store: S,
    clock: Arc<ManualClock>,
    sms: Arc<RecordingDispatcher>,
}

fn harness() -> Harness<MemoryStore> {
    harness_with(MemoryStore::new(), LifecycleConfig::default())
}

fn harness_with<S: TicketStore + Clone>(store: S, config: LifecycleConfig) -> Harness<S> {
    let clock = Arc::new(ManualClock::new(datetime!(2025-03-01 09:00 UTC)));
    let sms = Arc::new(RecordingDispatcher::default());
    let executor = TransitionExecutor::with_parts(
        store.clone(),
        PolicyTable::standard(),
        config,
        clock.clone(),
        Arc::new(SequentialCodes(AtomicU32::new(1000))),
    );
    Harness {
        service: LifecycleService::new(executor, sms.clone()),
        store,
        clock,
        sms,
    }
}

const CUSTOMER_PHONE: &str = "+15550000001";

fn technician() -> Actor {
    Actor::new("tech-1", Role::Technician)
}

fn supervisor() -> Actor {
    Actor::new("sup-1", Role::Supervisor)
}

fn workshop() -> Actor {
    Actor::new("shop-1", Role::Workshop)
}

fn intake_bot() -> Actor {
    Actor::new("intake", Role::System)
}

fn notes(text: &str) -> TransitionPayload {
    TransitionPayload {
        notes: Some(text.to_string()),
        ..Default::default()
    }
}

/// An actor and payload that satisfy the standard policy for `to`.
fn step_for(to: TicketState) -> (Actor, TransitionPayload) {
    use TicketState::*;
    match to {
        Assigned => (
            supervisor(),
            TransitionPayload {
                technician_id: Some("tech-1".to_string()),
                ..Default::default()
            },
        ),
        Scheduled => (supervisor(), TransitionPayload::default()),
        Diagnosed => (
            technician(),
            TransitionPayload {
                notes: Some("compressor relay burnt".to_string()),
                photos: vec!["photo-relay".to_string()],
                ..Default::default()
            },
        ),
        PickupDevice | ReadyDelivery => (workshop(), TransitionPayload::default()),
        InWorkshop => (workshop(), notes("received at bench 3")),
        Cancelled => (supervisor(), notes("customer cancelled")),
        _ => (technician(), TransitionPayload::default()),
    }
}

const TO_DIAGNOSED: [TicketState; 6] = [
    TicketState::Assigned,
    TicketState::Scheduled,
    TicketState::OnRoute,
    TicketState::Arrived,
    TicketState::Inspecting,
    TicketState::Diagnosed,
];

const WORKSHOP_TAIL: [TicketState; 3] = [
    TicketState::PickupDevice,
    TicketState::InWorkshop,
    TicketState::ReadyDelivery,
];

impl<S: TicketStore> Harness<S> {
    async fn create(&self) -> TicketRecord {
        let new = NewTicket {
            customer_id: "cust-1".to_string(),
            customer_phone: CUSTOMER_PHONE.to_string(),
            description: "fridge not cooling".to_string(),
            address: Some("12 Harbour Rd".to_string()),
            priority: Priority::High,
        };
        self.service
            .create_ticket(&new, &supervisor())
            .await
            .unwrap()
            .ticket
    }

    async fn walk(&self, ticket_id: &str, path: &[TicketState]) {
        for &to in path {
            let (actor, payload) = step_for(to);
            self.clock.advance(time::Duration::minutes(5));
            self.service
                .execute_transition(ticket_id, to, &actor, &payload)
                .await
                .unwrap_or_else(|e| panic!("step to {to} failed: {e}"));
        }
    }

    async fn ready_for_delivery(&self) -> TicketRecord {
        let ticket = self.create().await;
        self.walk(&ticket.id, &TO_DIAGNOSED).await;
        self.walk(&ticket.id, &WORKSHOP_TAIL).await;
        self.store.get_ticket(&ticket.id).await.unwrap()
    }

    async fn history_len(&self, ticket_id: &str) -> usize {
        self.store.list_status_history(ticket_id).await.unwrap().len()
    }

    async fn open_logs(&self, ticket_id: &str) -> Vec<TimeLogRecord> {
        self.store
            .list_time_logs(ticket_id)
            .await
            .unwrap()
            .into_iter()
            .filter(TimeLogRecord::is_open)
            .collect()
    }
}

// ──────────────────────────────────────────────
// Ticket creation
// ──────────────────────────────────────────────

#[tokio::test]
async fn created_ticket_starts_new_with_history_and_open_log() {
    let h = harness();
    let ticket = h.create().await;

    assert_eq!(ticket.state, "new");
    assert_eq!(ticket.ticket_number, "FS-2025-000001");
    assert_eq!(ticket.priority, "high");
    assert_eq!(ticket.state_entered_at["new"], "2025-03-01T09:00:00Z");

    let history = h.store.list_status_history(&ticket.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_state, None);
    assert_eq!(history[0].to_state, "new");

    let open = h.open_logs(&ticket.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state, "new");

    let second = h.create().await;
    assert_eq!(second.ticket_number, "FS-2025-000002");
}

#[tokio::test]
async fn blank_intake_fields_are_rejected() {
    let h = harness();
    let new = NewTicket {
        customer_id: "cust-1".to_string(),
        customer_phone: "  ".to_string(),
        description: "broken".to_string(),
        address: None,
        priority: Priority::Normal,
    };
    let err = h.service.create_ticket(&new, &supervisor()).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    assert!(h.store.list_tickets(None).await.unwrap().is_empty());
}

// ──────────────────────────────────────────────
// Walkthrough scenarios
// ──────────────────────────────────────────────

#[tokio::test]
async fn diagnosed_to_repairing_with_empty_payload() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED).await;

    let outcome = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Repairing,
            &technician(),
            &TransitionPayload::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.previous_state, TicketState::Diagnosed);
    assert_eq!(outcome.new_state, TicketState::Repairing);
    assert_eq!(outcome.ticket.state, "repairing");
    assert_eq!(outcome.closed_time_log.unwrap().state, "diagnosed");
    let opened = outcome.opened_time_log.unwrap();
    assert_eq!(opened.state, "repairing");
    assert_eq!(opened.technician_id, "tech-1");

    let open = h.open_logs(&ticket.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state, "repairing");
}

#[tokio::test]
async fn completion_requires_then_accepts_verified_code() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let before = h.history_len(&ticket.id).await;

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Completed,
            &technician(),
            &TransitionPayload::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationRequired));
    assert_eq!(h.history_len(&ticket.id).await, before);

    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    assert_eq!(issued.code.len(), 4);
    assert_eq!(issued.phone, CUSTOMER_PHONE);

    let texts = h.sms.sent();
    let last = texts.last().unwrap();
    assert_eq!(last.purpose, MessagePurpose::CompletionCode);
    assert_eq!(last.phone, CUSTOMER_PHONE);
    assert!(last.message.contains(&issued.code));

    let verification = h
        .service
        .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, &issued.code)
        .await
        .unwrap();
    assert_eq!(verification, Verification::Verified);

    let payload = TransitionPayload {
        confirmation_code: Some(issued.code.clone()),
        ..Default::default()
    };
    let outcome = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &payload)
        .await
        .unwrap();

    assert_eq!(outcome.new_state, TicketState::Completed);
    assert_eq!(outcome.closed_time_log.unwrap().state, "ready_delivery");
    assert!(outcome.opened_time_log.is_none());
    assert_eq!(outcome.ticket.verification_code_id, Some(issued.code_id.clone()));
    assert!(h.open_logs(&ticket.id).await.is_empty());

    let codes = h.store.list_confirmation_codes(&ticket.id).await.unwrap();
    assert!(codes[0].redeemed_at.is_some());
}

#[tokio::test]
async fn code_can_be_redeemed_without_prior_verify() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();

    let payload = TransitionPayload {
        confirmation_code: Some(issued.code),
        ..Default::default()
    };
    let outcome = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &workshop(), &payload)
        .await
        .unwrap();
    assert_eq!(outcome.ticket.state, "completed");

    let code = &h.store.list_confirmation_codes(&ticket.id).await.unwrap()[0];
    assert!(code.verified_at.is_some());
    assert!(code.redeemed_at.is_some());
}

#[tokio::test]
async fn concurrent_cancel_and_on_route_exactly_one_wins() {
    for _ in 0..10 {
        let h = Arc::new(harness());
        let ticket = h.create().await;
        h.walk(&ticket.id, &TicketState::ALL[1..3]).await;

        let cancel = {
            let h = h.clone();
            let id = ticket.id.clone();
            tokio::spawn(async move {
                let (actor, payload) = step_for(TicketState::Cancelled);
                h.service
                    .execute_transition(&id, TicketState::Cancelled, &actor, &payload)
                    .await
            })
        };
        let depart = {
            let h = h.clone();
            let id = ticket.id.clone();
            tokio::spawn(async move {
                h.service
                    .execute_transition(
                        &id,
                        TicketState::OnRoute,
                        &technician(),
                        &TransitionPayload::default(),
                    )
                    .await
            })
        };

        let results = [cancel.await.unwrap(), depart.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "{results:?}");
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(loser, TransitionError::InvalidTransition { .. }), "{loser:?}");

        // Creation, two walk steps, and the single winner.
        assert_eq!(h.history_len(&ticket.id).await, 4);
        assert!(h.open_logs(&ticket.id).await.len() <= 1);
    }
}

// ──────────────────────────────────────────────
// Policy enforcement
// ──────────────────────────────────────────────

#[tokio::test]
async fn terminal_tickets_accept_no_transitions() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &[TicketState::Cancelled]).await;

    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.cancellation_reason.as_deref(), Some("customer cancelled"));
    assert!(h.open_logs(&ticket.id).await.is_empty());

    for to in TicketState::ALL {
        let err = h
            .service
            .execute_transition(&ticket.id, to, &Actor::new("root", Role::Admin), &notes("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }), "{to}: {err:?}");
    }
    for role in Role::ALL {
        assert!(h
            .service
            .executor()
            .available_transitions(&ticket.id, role)
            .await
            .unwrap()
            .is_empty());
    }
    assert_eq!(h.history_len(&ticket.id).await, 2);
}

#[tokio::test]
async fn undefined_edge_is_invalid() {
    let h = harness();
    let ticket = h.create().await;
    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Repairing,
            &Actor::new("root", Role::Admin),
            &TransitionPayload::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_transition");
}

#[tokio::test]
async fn technician_cannot_send_device_to_workshop() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED).await;
    let before = h.history_len(&ticket.id).await;

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::PickupDevice,
            &technician(),
            &TransitionPayload::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransitionError::RoleForbidden {
            role: Role::Technician,
            ..
        }
    ));
    assert_eq!(h.history_len(&ticket.id).await, before);
    assert_eq!(h.store.get_ticket(&ticket.id).await.unwrap().state, "diagnosed");
}

#[tokio::test]
async fn any_role_may_resume_repair_after_parts_arrive() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED).await;
    h.walk(&ticket.id, &[TicketState::WaitingParts]).await;

    let outcome = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Repairing,
            &Actor::new("parts-bot", Role::System),
            &notes("parts delivered"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.ticket.repair_notes.as_deref(), Some("parts delivered"));
}

#[tokio::test]
async fn diagnosis_needs_photo_then_notes() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED[..5]).await;

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Diagnosed,
            &technician(),
            &notes("relay"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::MissingPhotos { required: 1, provided: 0, .. }));

    let photo_only = TransitionPayload {
        photos: vec!["photo-1".to_string()],
        ..Default::default()
    };
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Diagnosed, &technician(), &photo_only)
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::MissingNotes { .. }));

    h.walk(&ticket.id, &[TicketState::Diagnosed]).await;
    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.diagnosis_notes.as_deref(), Some("compressor relay burnt"));
    let history = h.store.list_status_history(&ticket.id).await.unwrap();
    assert_eq!(history.last().unwrap().photos, vec!["photo-relay".to_string()]);
}

#[tokio::test]
async fn assignment_requires_a_technician() {
    let h = harness();
    let ticket = h.create().await;

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Assigned,
            &supervisor(),
            &TransitionPayload::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::MissingTechnician { .. }));

    h.walk(&ticket.id, &[TicketState::Assigned]).await;
    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.technician_id.as_deref(), Some("tech-1"));
    assert_eq!(h.open_logs(&ticket.id).await[0].technician_id, "tech-1");
}

#[tokio::test]
async fn available_transitions_follow_role() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED).await;

    let executor = h.service.executor();
    assert_eq!(
        executor
            .available_transitions(&ticket.id, Role::Technician)
            .await
            .unwrap(),
        vec![
            TicketState::Repairing,
            TicketState::WaitingParts,
            TicketState::NotFixed,
        ]
    );
    assert_eq!(
        executor
            .available_transitions(&ticket.id, Role::Workshop)
            .await
            .unwrap(),
        vec![TicketState::PickupDevice]
    );

    let err = executor
        .available_transitions("missing", Role::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::NotFound { .. }));
}

// ──────────────────────────────────────────────
// Side effects
// ──────────────────────────────────────────────

#[tokio::test]
async fn history_is_dense_and_reentry_keeps_first_timestamp() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED).await;
    h.walk(
        &ticket.id,
        &[
            TicketState::Repairing,
            TicketState::WaitingParts,
            TicketState::Repairing,
        ],
    )
    .await;

    let history = h.store.list_status_history(&ticket.id).await.unwrap();
    let sequences: Vec<u64> = history.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());

    // Seven steps of five minutes after creation at 09:00.
    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.state_entered_at["repairing"], "2025-03-01T09:35:00Z");

    let logs = h.store.list_time_logs(&ticket.id).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.is_open()).count(), 1);
    assert_eq!(logs.iter().filter(|l| l.state == "repairing").count(), 2);

    h.clock.advance(time::Duration::minutes(2));
    let report = h.service.executor().time_report(&ticket.id).await.unwrap();
    assert_eq!(report.per_state_secs["repairing"], 300 + 120);
    assert_eq!(report.per_state_secs["waiting_parts"], 300);
    assert_eq!(report.open_state.as_deref(), Some("repairing"));
    assert_eq!(report.total_secs, 9 * 300 + 120);
}

#[tokio::test]
async fn location_is_sampled_with_the_transition() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED[..2]).await;

    let payload = TransitionPayload {
        location: Some(GeoPoint {
            latitude: 52.37,
            longitude: 4.89,
            accuracy_m: Some(8.0),
        }),
        ..Default::default()
    };
    let outcome = h
        .service
        .execute_transition(&ticket.id, TicketState::OnRoute, &technician(), &payload)
        .await
        .unwrap();
    assert_eq!(outcome.history_entry.location, payload.location);

    let samples = h.service.executor().location_samples(&ticket.id).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].state, "on_route");
    assert_eq!(samples[0].recorded_by, "tech-1");
}

#[tokio::test]
async fn status_updates_go_out_only_for_committed_transitions() {
    let h = harness();
    let ticket = h.create().await;
    h.walk(&ticket.id, &TO_DIAGNOSED[..2]).await;
    let before = h.sms.sent().len();

    h.service
        .execute_transition(
            &ticket.id,
            TicketState::Arrived,
            &technician(),
            &TransitionPayload::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(h.sms.sent().len(), before);

    h.walk(&ticket.id, &[TicketState::OnRoute]).await;
    let sent = h.sms.sent();
    assert_eq!(sent.len(), before + 1);
    assert_eq!(sent[before].purpose, MessagePurpose::StatusUpdate);
    assert_eq!(
        sent[before].message,
        "Repair FS-2025-000001: your technician is on the way."
    );
}

#[tokio::test]
async fn notifier_failure_does_not_undo_transition() {
    let h = harness();
    let ticket = h.create().await;
    h.sms.fail.store(true, Ordering::SeqCst);

    h.walk(&ticket.id, &[TicketState::Assigned]).await;
    assert_eq!(h.store.get_ticket(&ticket.id).await.unwrap().state, "assigned");
}

// ──────────────────────────────────────────────
// Confirmation codes
// ──────────────────────────────────────────────

#[tokio::test]
async fn reissuing_supersedes_the_previous_code() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let first = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    let second = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    assert_ne!(first.code, second.code);
    assert_eq!(second.superseded, 1);

    let with = |code: &str| TransitionPayload {
        confirmation_code: Some(code.to_string()),
        ..Default::default()
    };
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &with(&first.code))
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationInvalid));

    h.service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &with(&second.code))
        .await
        .unwrap();
}

#[tokio::test]
async fn wrong_code_leaves_the_right_one_usable() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    let wrong = if issued.code == "0000" { "1111" } else { "0000" };

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Completed,
            &technician(),
            &TransitionPayload {
                confirmation_code: Some(wrong.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "confirmation_invalid");
    assert_eq!(
        h.service
            .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, wrong)
            .await
            .unwrap(),
        Verification::Invalid
    );
    assert_eq!(
        h.service
            .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, &issued.code)
            .await
            .unwrap(),
        Verification::Verified
    );
}

#[tokio::test]
async fn verification_succeeds_once() {
    let h = harness();
    let ticket = h.create().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, Some("+15557654321"), CodePurpose::Login, &intake_bot())
        .await
        .unwrap();
    assert_eq!(issued.code.len(), 6);

    let phone = Some("+15557654321");
    let first = h
        .service
        .verify_confirmation_code(&ticket.id, phone, CodePurpose::Login, &issued.code)
        .await
        .unwrap();
    let second = h
        .service
        .verify_confirmation_code(&ticket.id, phone, CodePurpose::Login, &issued.code)
        .await
        .unwrap();
    assert_eq!(first, Verification::Verified);
    assert_eq!(second, Verification::Invalid);
}

#[tokio::test]
async fn expired_code_is_refused_and_not_consumed() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    h.clock.advance(time::Duration::seconds(601));

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Completed,
            &technician(),
            &TransitionPayload {
                confirmation_code: Some(issued.code.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationExpired));
    assert_eq!(
        h.store.get_ticket(&ticket.id).await.unwrap().state,
        "ready_delivery"
    );
    assert!(h.store.list_confirmation_codes(&ticket.id).await.unwrap()[0]
        .redeemed_at
        .is_none());

    assert_eq!(
        h.service
            .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, &issued.code)
            .await
            .unwrap(),
        Verification::Expired
    );
}

#[tokio::test]
async fn verified_code_still_expires() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    assert_eq!(
        h.service
            .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, &issued.code)
            .await
            .unwrap(),
        Verification::Verified
    );
    let before = h.history_len(&ticket.id).await;
    h.clock.advance(time::Duration::seconds(601));

    let err = h
        .service
        .execute_transition(
            &ticket.id,
            TicketState::Completed,
            &technician(),
            &TransitionPayload {
                confirmation_code: Some(issued.code),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationExpired));
    assert_eq!(h.history_len(&ticket.id).await, before);
    assert_eq!(
        h.store.get_ticket(&ticket.id).await.unwrap().state,
        "ready_delivery"
    );
}

#[tokio::test]
async fn repeated_wrong_codes_withdraw_the_code() {
    let h = harness();
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    let with = |code: &str| TransitionPayload {
        confirmation_code: Some(code.to_string()),
        ..Default::default()
    };

    for wrong in ["0001", "0002", "0003", "0004"] {
        assert_eq!(
            h.service
                .verify_confirmation_code(&ticket.id, None, CodePurpose::Completion, wrong)
                .await
                .unwrap(),
            Verification::Invalid
        );
    }
    let codes = h.store.list_confirmation_codes(&ticket.id).await.unwrap();
    assert_eq!(codes[0].failed_attempts, 4);
    assert!(codes[0].superseded_at.is_none());

    // The fifth miss arrives through the transition, which rolls back.
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &with("0005"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationInvalid));
    let codes = h.store.list_confirmation_codes(&ticket.id).await.unwrap();
    assert_eq!(codes[0].failed_attempts, 5);
    assert!(codes[0].superseded_at.is_some());

    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &with(&issued.code))
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::ConfirmationInvalid));

    let fresh = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    assert_eq!(fresh.superseded, 0);
    h.service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &with(&fresh.code))
        .await
        .unwrap();
}

#[tokio::test]
async fn code_issuing_is_limited_by_role() {
    let h = harness();
    let ticket = h.create().await;

    let err = h
        .service
        .issue_confirmation_code(&ticket.id, Some("+15557654321"), CodePurpose::Login, &technician())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransitionError::IssueForbidden {
            role: Role::Technician,
            purpose: CodePurpose::Login
        }
    ));
    assert_eq!(err.code(), "role_forbidden");
    assert!(h.sms.sent().is_empty());
    assert!(h.store.list_confirmation_codes(&ticket.id).await.unwrap().is_empty());

    h.service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &workshop())
        .await
        .unwrap();
    h.service
        .issue_confirmation_code(&ticket.id, Some("+15557654321"), CodePurpose::Login, &intake_bot())
        .await
        .unwrap();
    assert_eq!(h.sms.sent().len(), 2);
}

#[tokio::test]
async fn completion_code_cannot_target_another_phone() {
    let h = harness();
    let ticket = h.create().await;
    let err = h
        .service
        .issue_confirmation_code(&ticket.id, Some("+15559990000"), CodePurpose::Completion, &supervisor())
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::InvalidRequest(_)));
    assert!(h.sms.sent().is_empty());
}

#[tokio::test]
async fn issuing_for_unknown_ticket_sends_nothing() {
    let h = harness();
    let err = h
        .service
        .issue_confirmation_code("missing", None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::NotFound { .. }));
    assert!(h.sms.sent().is_empty());
}

// ──────────────────────────────────────────────
// Atomicity
// ──────────────────────────────────────────────

#[tokio::test]
async fn storage_failure_rolls_back_every_write() {
    let h = harness_with(FaultyStore::default(), LifecycleConfig::default());
    let ticket = h.ready_for_delivery().await;
    let issued = h
        .service
        .issue_confirmation_code(&ticket.id, None, CodePurpose::Completion, &supervisor())
        .await
        .unwrap();
    let history_before = h.history_len(&ticket.id).await;
    let sms_before = h.sms.sent().len();

    h.store.fail_locations.store(true, Ordering::SeqCst);
    let payload = TransitionPayload {
        confirmation_code: Some(issued.code.clone()),
        location: Some(GeoPoint {
            latitude: 1.0,
            longitude: 2.0,
            accuracy_m: None,
        }),
        ..Default::default()
    };
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &payload)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "storage");

    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.state, "ready_delivery");
    assert_eq!(stored.version, ticket.version);
    assert!(stored.verification_code_id.is_none());
    assert_eq!(h.history_len(&ticket.id).await, history_before);
    let open = h.open_logs(&ticket.id).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state, "ready_delivery");
    let code = &h.store.list_confirmation_codes(&ticket.id).await.unwrap()[0];
    assert!(code.redeemed_at.is_none());
    assert!(h.store.list_location_samples(&ticket.id).await.unwrap().is_empty());
    assert_eq!(h.sms.sent().len(), sms_before);

    // The code was not consumed by the failed attempt.
    h.store.fail_locations.store(false, Ordering::SeqCst);
    h.service
        .execute_transition(&ticket.id, TicketState::Completed, &technician(), &payload)
        .await
        .unwrap();
}

#[tokio::test]
async fn timeout_rolls_back_and_releases_the_ticket() {
    let config = LifecycleConfig {
        operation_timeout_ms: 100,
        ..LifecycleConfig::default()
    };
    let h = harness_with(FaultyStore::default(), config);
    let ticket = h.create().await;

    h.store.stall_history.store(true, Ordering::SeqCst);
    let (actor, payload) = step_for(TicketState::Assigned);
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Assigned, &actor, &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, TransitionError::Transient(_)));
    assert!(err.is_retryable());

    let stored = h.store.get_ticket(&ticket.id).await.unwrap();
    assert_eq!(stored.state, "new");
    assert_eq!(stored.version, ticket.version);
    assert_eq!(h.history_len(&ticket.id).await, 1);

    h.store.stall_history.store(false, Ordering::SeqCst);
    h.walk(&ticket.id, &[TicketState::Assigned]).await;
}

#[tokio::test]
async fn optimistic_conflicts_are_retried() {
    let h = harness_with(FaultyStore::default(), LifecycleConfig::default());
    let ticket = h.create().await;

    h.store.conflicts_left.store(2, Ordering::SeqCst);
    h.walk(&ticket.id, &[TicketState::Assigned]).await;
    assert_eq!(h.history_len(&ticket.id).await, 2);
    assert_eq!(h.open_logs(&ticket.id).await.len(), 1);
}

#[tokio::test]
async fn persistent_conflicts_surface_as_transient() {
    let h = harness_with(FaultyStore::default(), LifecycleConfig::default());
    let ticket = h.create().await;

    h.store.conflicts_left.store(10, Ordering::SeqCst);
    let (actor, payload) = step_for(TicketState::Assigned);
    let err = h
        .service
        .execute_transition(&ticket.id, TicketState::Assigned, &actor, &payload)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "transient");
    // One attempt plus three retries.
    assert_eq!(h.store.conflicts_left.load(Ordering::SeqCst), 6);
    assert_eq!(h.store.get_ticket(&ticket.id).await.unwrap().state, "new");
}
