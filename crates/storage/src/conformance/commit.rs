use std::future::Future;

use super::{make_history, make_open_time_log, make_ticket, seed_ticket, TestResult};
use crate::record::{GeoPoint, LocationSampleRecord};
use crate::{StorageError, TicketStore};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "transition_records_committed_together",
            transition_records_committed_together(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "transition_records_aborted_together",
            transition_records_aborted_together(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "sequential_updates_increment_version",
            sequential_updates_increment_version(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "stale_expected_version_conflicts",
            stale_expected_version_conflicts(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "history_listed_in_sequence_order",
            history_listed_in_sequence_order(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "location_sample_committed",
            location_sample_committed(factory).await,
        ),
    ]
}

/// Simulates one lifecycle step: update, history append, close + open log.
async fn stage_transition<S: TicketStore>(
    s: &S,
    snap: &mut S::Snapshot,
) -> Result<(), String> {
    let mut ticket = s
        .get_ticket_for_update(snap, "t-1")
        .await
        .map_err(|e| format!("lock: {e}"))?;
    let version = ticket.version;
    ticket.state = "assigned".to_string();
    s.update_ticket(snap, version, ticket)
        .await
        .map_err(|e| format!("update: {e}"))?;
    s.insert_status_history(snap, make_history("h-2", "t-1", 2, Some("new"), "assigned"))
        .await
        .map_err(|e| format!("history: {e}"))?;
    s.close_time_log(snap, "l-1", "2025-01-01T00:05:00Z", 300)
        .await
        .map_err(|e| format!("close: {e}"))?;
    s.insert_time_log(snap, make_open_time_log("l-2", "t-1", "assigned"))
        .await
        .map_err(|e| format!("open: {e}"))?;
    Ok(())
}

/// Seeds t-1 in `new` with its creation history entry and open time log.
async fn seed_with_open_log<S: TicketStore>(s: &S) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_ticket(&mut snap, make_ticket("t-1", "FS-0001", "new"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_status_history(&mut snap, make_history("h-1", "t-1", 1, None, "new"))
        .await
        .map_err(|e| format!("history: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-1", "t-1", "new"))
        .await
        .map_err(|e| format!("time log: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}

async fn transition_records_committed_together<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_with_open_log(&s).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    stage_transition(&s, &mut snap).await?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let ticket = s.get_ticket("t-1").await.map_err(|e| format!("get: {e}"))?;
    let history = s
        .list_status_history("t-1")
        .await
        .map_err(|e| format!("history: {e}"))?;
    let logs = s
        .list_time_logs("t-1")
        .await
        .map_err(|e| format!("logs: {e}"))?;

    if ticket.state != "assigned" || ticket.version != 1 {
        return Err(format!(
            "expected assigned at version 1, got {} at {}",
            ticket.state, ticket.version
        ));
    }
    if history.len() != 2 {
        return Err(format!("expected 2 history entries, got {}", history.len()));
    }
    let open: Vec<_> = logs.iter().filter(|l| l.is_open()).collect();
    if open.len() != 1 || open[0].id != "l-2" {
        return Err(format!("expected only l-2 open, got {open:?}"));
    }
    let closed = logs
        .iter()
        .find(|l| l.id == "l-1")
        .ok_or("l-1 missing after commit")?;
    if closed.duration_secs != Some(300) {
        return Err(format!("expected l-1 duration 300, got {:?}", closed.duration_secs));
    }
    Ok(())
}

async fn transition_records_aborted_together<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_with_open_log(&s).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    stage_transition(&s, &mut snap).await?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    let ticket = s.get_ticket("t-1").await.map_err(|e| format!("get: {e}"))?;
    let history = s
        .list_status_history("t-1")
        .await
        .map_err(|e| format!("history: {e}"))?;
    let logs = s
        .list_time_logs("t-1")
        .await
        .map_err(|e| format!("logs: {e}"))?;

    if ticket.state != "new" || ticket.version != 0 {
        return Err(format!("ticket changed by aborted snapshot: {}", ticket.state));
    }
    if history.len() != 1 {
        return Err(format!("expected 1 history entry, got {}", history.len()));
    }
    if logs.len() != 1 || !logs[0].is_open() || logs[0].id != "l-1" {
        return Err(format!("expected only l-1 still open, got {logs:?}"));
    }
    Ok(())
}

async fn sequential_updates_increment_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    for (expected, state) in [(1, "assigned"), (2, "scheduled"), (3, "on_route")] {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        let mut ticket = s
            .get_ticket_for_update(&mut snap, "t-1")
            .await
            .map_err(|e| format!("lock: {e}"))?;
        let version = ticket.version;
        ticket.state = state.to_string();
        let new_version = s
            .update_ticket(&mut snap, version, ticket)
            .await
            .map_err(|e| format!("update: {e}"))?;
        s.commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
        if new_version != expected {
            return Err(format!("expected version {expected}, got {new_version}"));
        }
    }
    Ok(())
}

async fn stale_expected_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let ticket = s
        .get_ticket_for_update(&mut snap, "t-1")
        .await
        .map_err(|e| format!("lock: {e}"))?;
    match s.update_ticket(&mut snap, 7, ticket).await {
        Err(StorageError::ConcurrentConflict {
            expected_version: 7,
            ..
        }) => Ok(()),
        Ok(_) => match s.commit_snapshot(snap).await {
            Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
            other => Err(format!("expected ConcurrentConflict, got {other:?}")),
        },
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
    }
}

async fn history_listed_in_sequence_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for (id, seq, from, to) in [
        ("h-3", 3, Some("assigned"), "scheduled"),
        ("h-1", 1, None, "new"),
        ("h-2", 2, Some("new"), "assigned"),
    ] {
        s.insert_status_history(&mut snap, make_history(id, "t-1", seq, from, to))
            .await
            .map_err(|e| format!("history: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let history = s
        .list_status_history("t-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let sequences: Vec<u64> = history.iter().map(|h| h.sequence).collect();
    if sequences != [1, 2, 3] {
        return Err(format!("expected sequences [1, 2, 3], got {sequences:?}"));
    }
    if history[0].from_state.is_some() {
        return Err("creation event must have no from_state".to_string());
    }
    Ok(())
}

async fn location_sample_committed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "arrived")).await?;

    let sample = LocationSampleRecord {
        id: "loc-1".to_string(),
        ticket_id: "t-1".to_string(),
        state: "arrived".to_string(),
        location: GeoPoint {
            latitude: 52.52,
            longitude: 13.405,
            accuracy_m: Some(8.0),
        },
        recorded_by: "tech-1".to_string(),
        recorded_at: "2025-01-01T09:00:00Z".to_string(),
    };
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_location_sample(&mut snap, sample.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let samples = s
        .list_location_samples("t-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if samples != vec![sample] {
        return Err(format!("unexpected samples: {samples:?}"));
    }
    Ok(())
}
