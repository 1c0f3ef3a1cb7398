//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! visible inside it, and discarded on abort or drop.

use std::future::Future;

use super::{make_history, make_open_time_log, make_ticket, seed_ticket, TestResult};
use crate::{StorageError, TicketStore};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_ticket_invisible_to_get",
            uncommitted_ticket_invisible_to_get(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_update_invisible",
            uncommitted_update_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "own_writes_visible_inside_snapshot",
            own_writes_visible_inside_snapshot(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_all_writes",
            abort_discards_all_writes(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "dropped_snapshot_discards_writes",
            dropped_snapshot_discards_writes(factory).await,
        ),
    ]
}

async fn uncommitted_ticket_invisible_to_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_ticket(&mut snap, make_ticket("t-1", "FS-0001", "new"))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let outside = s.get_ticket("t-1").await;
    let listed = s.list_tickets(None).await.map_err(|e| format!("list: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    match outside {
        Err(StorageError::TicketNotFound { .. }) => {}
        other => return Err(format!("expected TicketNotFound, got {other:?}")),
    }
    if !listed.is_empty() {
        return Err(format!("expected empty list, got {} tickets", listed.len()));
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut ticket = s
        .get_ticket_for_update(&mut snap, "t-1")
        .await
        .map_err(|e| format!("lock: {e}"))?;
    ticket.state = "assigned".to_string();
    s.update_ticket(&mut snap, 0, ticket)
        .await
        .map_err(|e| format!("update: {e}"))?;

    let outside = s.get_ticket("t-1").await.map_err(|e| format!("get: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    if outside.state != "new" || outside.version != 0 {
        return Err(format!(
            "uncommitted update leaked: state {} version {}",
            outside.state, outside.version
        ));
    }
    Ok(())
}

async fn own_writes_visible_inside_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
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

    let ticket = s
        .get_ticket_for_update(&mut snap, "t-1")
        .await
        .map_err(|e| format!("read back: {e}"))?;
    let history_len = s
        .status_history_len(&mut snap, "t-1")
        .await
        .map_err(|e| format!("history len: {e}"))?;
    let open = s
        .find_open_time_log(&mut snap, "t-1")
        .await
        .map_err(|e| format!("open log: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    if ticket.ticket_number != "FS-0001" {
        return Err("inserted ticket not readable in its own snapshot".to_string());
    }
    if history_len != 1 {
        return Err(format!("expected history len 1, got {history_len}"));
    }
    match open {
        Some(log) if log.id == "l-1" => Ok(()),
        other => Err(format!("expected open log l-1, got {other:?}")),
    }
}

async fn abort_discards_all_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_status_history(&mut snap, make_history("h-1", "t-1", 1, None, "new"))
        .await
        .map_err(|e| format!("history: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-1", "t-1", "new"))
        .await
        .map_err(|e| format!("time log: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    let history = s
        .list_status_history("t-1")
        .await
        .map_err(|e| format!("history: {e}"))?;
    let logs = s
        .list_time_logs("t-1")
        .await
        .map_err(|e| format!("logs: {e}"))?;
    if !history.is_empty() || !logs.is_empty() {
        return Err(format!(
            "aborted writes visible: {} history, {} time logs",
            history.len(),
            logs.len()
        ));
    }
    Ok(())
}

async fn dropped_snapshot_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        let mut ticket = s
            .get_ticket_for_update(&mut snap, "t-1")
            .await
            .map_err(|e| format!("lock: {e}"))?;
        ticket.state = "cancelled".to_string();
        s.update_ticket(&mut snap, 0, ticket)
            .await
            .map_err(|e| format!("update: {e}"))?;
        // snapshot dropped here without commit or abort
    }

    // The row lock must have been released with the dropped snapshot.
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let ticket = s
        .get_ticket_for_update(&mut snap, "t-1")
        .await
        .map_err(|e| format!("relock after drop: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    if ticket.state != "new" {
        return Err(format!("dropped update leaked: state {}", ticket.state));
    }
    Ok(())
}
