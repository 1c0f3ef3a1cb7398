//! Confirmation code conformance: current-code lookup and supersession.

use std::future::Future;

use super::{make_code, make_ticket, seed_ticket, TestResult};
use crate::{StorageError, TicketStore};

const PHONE: &str = "+15550000001";
const PURPOSE: &str = "completion";

pub(super) async fn run_code_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "codes",
            "current_code_is_latest_unsuperseded",
            current_code_is_latest_unsuperseded(factory).await,
        ),
        TestResult::from_result(
            "codes",
            "supersede_skips_redeemed_codes",
            supersede_skips_redeemed_codes(factory).await,
        ),
        TestResult::from_result(
            "codes",
            "code_update_visible_after_commit",
            code_update_visible_after_commit(factory).await,
        ),
        TestResult::from_result(
            "codes",
            "updating_unknown_code_fails",
            updating_unknown_code_fails(factory).await,
        ),
    ]
}

async fn current_code_is_latest_unsuperseded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "ready_delivery")).await?;

    for (id, at) in [("c-1", "2025-01-01T00:00:00Z"), ("c-2", "2025-01-01T00:01:00Z")] {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        s.supersede_confirmation_codes(&mut snap, "t-1", PHONE, PURPOSE, at)
            .await
            .map_err(|e| format!("supersede: {e}"))?;
        s.insert_confirmation_code(&mut snap, make_code(id, "t-1", at))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
        s.commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit {id}: {e}"))?;
    }

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let current = s
        .get_confirmation_code_for_update(&mut snap, "t-1", PHONE, PURPOSE)
        .await
        .map_err(|e| format!("get: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    match current {
        Some(code) if code.id == "c-2" => {}
        other => return Err(format!("expected c-2 current, got {other:?}")),
    }
    let all = s
        .list_confirmation_codes("t-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let first = all
        .iter()
        .find(|c| c.id == "c-1")
        .ok_or("c-1 missing")?;
    if first.superseded_at.is_none() {
        return Err("c-1 was not superseded by c-2".to_string());
    }
    Ok(())
}

async fn supersede_skips_redeemed_codes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "completed")).await?;

    let mut redeemed = make_code("c-1", "t-1", "2025-01-01T00:00:00Z");
    redeemed.verified_at = Some("2025-01-01T00:02:00Z".to_string());
    redeemed.redeemed_at = Some("2025-01-01T00:02:00Z".to_string());

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_confirmation_code(&mut snap, redeemed)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    let count = s
        .supersede_confirmation_codes(&mut snap, "t-1", PHONE, PURPOSE, "2025-01-01T00:03:00Z")
        .await
        .map_err(|e| format!("supersede: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if count != 0 {
        return Err(format!("expected 0 superseded, got {count}"));
    }
    Ok(())
}

async fn code_update_visible_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "ready_delivery")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_confirmation_code(&mut snap, make_code("c-1", "t-1", "2025-01-01T00:00:00Z"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut code = s
        .get_confirmation_code_for_update(&mut snap, "t-1", PHONE, PURPOSE)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("c-1 not current")?;
    code.verified_at = Some("2025-01-01T00:01:00Z".to_string());
    s.update_confirmation_code(&mut snap, code)
        .await
        .map_err(|e| format!("update: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = s
        .list_confirmation_codes("t-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if stored.len() != 1 || stored[0].verified_at.is_none() {
        return Err(format!("expected verified c-1, got {stored:?}"));
    }
    Ok(())
}

async fn updating_unknown_code_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .update_confirmation_code(&mut snap, make_code("c-404", "t-1", "2025-01-01T00:00:00Z"))
        .await;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    match result {
        Err(StorageError::RecordNotFound { .. }) => Ok(()),
        other => Err(format!("expected RecordNotFound, got {other:?}")),
    }
}
