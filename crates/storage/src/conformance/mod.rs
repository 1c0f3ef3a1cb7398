//! Conformance test suite for `TicketStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `TicketStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Initialization**: ticket creation, duplicate id and number detection
//! - **Snapshot isolation**: uncommitted writes invisible, own writes visible
//! - **Atomic commit**: all-or-nothing semantics for ticket + history + time log
//! - **Time logs**: single open interval per ticket, close semantics
//! - **Confirmation codes**: current-code lookup, supersession, updates
//! - **Concurrency**: row locks serialize writers on one ticket
//! - **Error handling**: correct error variants for invalid operations
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use fieldops_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_store().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod codes;
mod commit;
mod concurrent;
mod error;
mod init;
mod snapshot;
mod timelog;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use crate::record::{
    ConfirmationCodeRecord, StatusHistoryRecord, TicketRecord, TimeLogRecord,
};
use crate::TicketStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "snapshot", "commit").
    pub category: String,
    /// Test name (e.g. "insert_ticket_visible_after_commit").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(timelog::run_timelog_tests(&factory).await);
    results.extend(codes::run_code_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_ticket(id: &str, ticket_number: &str, state: &str) -> TicketRecord {
    TicketRecord {
        id: id.to_string(),
        ticket_number: ticket_number.to_string(),
        state: state.to_string(),
        priority: "normal".to_string(),
        customer_id: "customer-1".to_string(),
        customer_phone: "+15550000001".to_string(),
        technician_id: None,
        address: Some("1 Test Street".to_string()),
        description: "dishwasher does not drain".to_string(),
        diagnosis_notes: None,
        repair_notes: None,
        workshop_notes: None,
        cancellation_reason: None,
        verification_code_id: None,
        state_entered_at: BTreeMap::from([(state.to_string(), "2025-01-01T00:00:00Z".to_string())]),
        created_at: "2025-01-01T00:00:00Z".to_string(),
        updated_at: "2025-01-01T00:00:00Z".to_string(),
        version: 0,
    }
}

fn make_history(
    id: &str,
    ticket_id: &str,
    sequence: u64,
    from_state: Option<&str>,
    to_state: &str,
) -> StatusHistoryRecord {
    StatusHistoryRecord {
        id: id.to_string(),
        ticket_id: ticket_id.to_string(),
        sequence,
        from_state: from_state.map(str::to_string),
        to_state: to_state.to_string(),
        actor_id: "tech-1".to_string(),
        actor_role: "technician".to_string(),
        notes: None,
        photos: Vec::new(),
        location: None,
        metadata: None,
        created_at: "2025-01-01T00:00:30Z".to_string(),
    }
}

fn make_open_time_log(id: &str, ticket_id: &str, state: &str) -> TimeLogRecord {
    TimeLogRecord {
        id: id.to_string(),
        ticket_id: ticket_id.to_string(),
        state: state.to_string(),
        technician_id: "tech-1".to_string(),
        started_at: "2025-01-01T00:00:00Z".to_string(),
        ended_at: None,
        duration_secs: None,
    }
}

fn make_code(id: &str, ticket_id: &str, created_at: &str) -> ConfirmationCodeRecord {
    ConfirmationCodeRecord {
        id: id.to_string(),
        ticket_id: ticket_id.to_string(),
        phone: "+15550000001".to_string(),
        purpose: "completion".to_string(),
        code_hash: format!("hash-of-{id}"),
        expires_at: "2025-01-01T00:10:00Z".to_string(),
        verified_at: None,
        redeemed_at: None,
        superseded_at: None,
        failed_attempts: 0,
        created_at: created_at.to_string(),
    }
}

/// Commit a single ticket in its own snapshot.
async fn seed_ticket<S: TicketStore>(storage: &S, ticket: TicketRecord) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_ticket(&mut snap, ticket)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
