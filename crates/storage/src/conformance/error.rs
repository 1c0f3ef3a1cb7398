use std::future::Future;

use super::{make_history, make_ticket, TestResult};
use crate::{StorageError, TicketStore};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "error",
            "get_ticket_nonexistent",
            get_ticket_nonexistent(factory).await,
        ),
        TestResult::from_result(
            "error",
            "get_ticket_for_update_nonexistent",
            get_ticket_for_update_nonexistent(factory).await,
        ),
        TestResult::from_result(
            "error",
            "update_ticket_nonexistent",
            update_ticket_nonexistent(factory).await,
        ),
        TestResult::from_result(
            "error",
            "history_for_unknown_ticket_rejected",
            history_for_unknown_ticket_rejected(factory).await,
        ),
        TestResult::from_result(
            "error",
            "closing_unknown_time_log_fails",
            closing_unknown_time_log_fails(factory).await,
        ),
        TestResult::from_result(
            "error",
            "list_queries_empty_for_unknown_ticket",
            list_queries_empty_for_unknown_ticket(factory).await,
        ),
    ]
}

async fn get_ticket_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_ticket("t-999").await {
        Err(StorageError::TicketNotFound { ticket_id }) if ticket_id == "t-999" => Ok(()),
        other => Err(format!("expected TicketNotFound for t-999, got {other:?}")),
    }
}

async fn get_ticket_for_update_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.get_ticket_for_update(&mut snap, "t-999").await;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::TicketNotFound { .. }) => Ok(()),
        other => Err(format!("expected TicketNotFound, got {other:?}")),
    }
}

async fn update_ticket_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .update_ticket(&mut snap, 0, make_ticket("t-999", "FS-0999", "assigned"))
        .await;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::TicketNotFound { .. }) => Ok(()),
        other => Err(format!("expected TicketNotFound, got {other:?}")),
    }
}

async fn history_for_unknown_ticket_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .insert_status_history(&mut snap, make_history("h-1", "t-999", 1, None, "new"))
        .await;
    match result {
        Err(_) => {
            s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;
            Ok(())
        }
        // Backends with deferred FK checks may only fail at commit.
        Ok(()) => match s.commit_snapshot(snap).await {
            Err(_) => Ok(()),
            Ok(()) => Err("history for unknown ticket was accepted".to_string()),
        },
    }
}

async fn closing_unknown_time_log_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .close_time_log(&mut snap, "l-404", "2025-01-01T00:00:00Z", 0)
        .await;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;
    match result {
        Err(StorageError::RecordNotFound { .. }) => Ok(()),
        other => Err(format!("expected RecordNotFound, got {other:?}")),
    }
}

async fn list_queries_empty_for_unknown_ticket<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let history = s
        .list_status_history("t-999")
        .await
        .map_err(|e| format!("history: {e}"))?;
    let logs = s
        .list_time_logs("t-999")
        .await
        .map_err(|e| format!("logs: {e}"))?;
    let samples = s
        .list_location_samples("t-999")
        .await
        .map_err(|e| format!("samples: {e}"))?;
    let codes = s
        .list_confirmation_codes("t-999")
        .await
        .map_err(|e| format!("codes: {e}"))?;
    if !(history.is_empty() && logs.is_empty() && samples.is_empty() && codes.is_empty()) {
        return Err("expected empty results for unknown ticket".to_string());
    }
    Ok(())
}
