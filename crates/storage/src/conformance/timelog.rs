//! Time log conformance: at most one open interval per ticket.

use std::future::Future;

use super::{make_open_time_log, make_ticket, seed_ticket, TestResult};
use crate::{StorageError, TicketStore};

pub(super) async fn run_timelog_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "timelog",
            "second_open_log_rejected",
            second_open_log_rejected(factory).await,
        ),
        TestResult::from_result(
            "timelog",
            "open_allowed_after_close_in_same_snapshot",
            open_allowed_after_close_in_same_snapshot(factory).await,
        ),
        TestResult::from_result(
            "timelog",
            "closing_twice_fails",
            closing_twice_fails(factory).await,
        ),
        TestResult::from_result(
            "timelog",
            "find_open_returns_none_without_logs",
            find_open_returns_none_without_logs(factory).await,
        ),
    ]
}

async fn second_open_log_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-1", "t-1", "new"))
        .await
        .map_err(|e| format!("first: {e}"))?;
    match s
        .insert_time_log(&mut snap, make_open_time_log("l-2", "t-1", "assigned"))
        .await
    {
        Err(StorageError::OpenTimeLogExists { open_id, .. }) if open_id == "l-1" => Ok(()),
        Ok(()) => match s.commit_snapshot(snap).await {
            Err(StorageError::OpenTimeLogExists { .. }) => Ok(()),
            other => Err(format!("expected OpenTimeLogExists, got {other:?}")),
        },
        Err(e) => Err(format!("expected OpenTimeLogExists for l-1, got {e}")),
    }
}

async fn open_allowed_after_close_in_same_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-1", "t-1", "new"))
        .await
        .map_err(|e| format!("open l-1: {e}"))?;
    let closed = s
        .close_time_log(&mut snap, "l-1", "2025-01-01T00:01:00Z", 60)
        .await
        .map_err(|e| format!("close l-1: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-2", "t-1", "assigned"))
        .await
        .map_err(|e| format!("open l-2: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if closed.ended_at.as_deref() != Some("2025-01-01T00:01:00Z") {
        return Err(format!("close returned {closed:?}"));
    }
    let open: Vec<_> = s
        .list_time_logs("t-1")
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .filter(|l| l.is_open())
        .collect();
    if open.len() != 1 || open[0].state != "assigned" {
        return Err(format!("expected exactly the assigned log open, got {open:?}"));
    }
    Ok(())
}

async fn closing_twice_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_time_log(&mut snap, make_open_time_log("l-1", "t-1", "new"))
        .await
        .map_err(|e| format!("open: {e}"))?;
    s.close_time_log(&mut snap, "l-1", "2025-01-01T00:01:00Z", 60)
        .await
        .map_err(|e| format!("close: {e}"))?;
    let second = s
        .close_time_log(&mut snap, "l-1", "2025-01-01T00:02:00Z", 120)
        .await;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    match second {
        Err(_) => Ok(()),
        Ok(record) => Err(format!("second close succeeded: {record:?}")),
    }
}

async fn find_open_returns_none_without_logs<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let open = s
        .find_open_time_log(&mut snap, "t-1")
        .await
        .map_err(|e| format!("find: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    match open {
        None => Ok(()),
        Some(log) => Err(format!("expected no open log, got {log:?}")),
    }
}
