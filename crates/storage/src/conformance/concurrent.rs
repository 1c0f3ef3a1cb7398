use std::future::Future;
use std::sync::Arc;

use super::{make_history, make_ticket, seed_ticket, TestResult};
use crate::{StorageError, TicketStore};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "locked_transitions_exactly_one_wins",
            locked_transitions_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "blind_updates_exactly_one_wins",
            blind_updates_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "different_tickets_all_succeed",
            different_tickets_all_succeed(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "serialized_appends_keep_sequence_dense",
            serialized_appends_keep_sequence_dense(factory).await,
        ),
    ]
}

// ── Lock, re-check state, write: exactly one wins ───────────────────────────

/// N tasks race to move t-1 out of `scheduled`. Each locks the row and only
/// writes if the state is still `scheduled`, the way the lifecycle engine
/// does. Exactly one task may observe `scheduled`.
async fn locked_transitions_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_ticket(storage.as_ref(), make_ticket("t-1", "FS-0001", "scheduled")).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let mut ticket = s.get_ticket_for_update(&mut snap, "t-1").await?;
            if ticket.state != "scheduled" {
                s.abort_snapshot(snap).await?;
                return Ok(false);
            }
            let version = ticket.version;
            ticket.state = "on_route".to_string();
            ticket.technician_id = Some(format!("tech-{i}"));
            s.update_ticket(&mut snap, version, ticket).await?;
            s.commit_snapshot(snap).await?;
            Ok::<bool, StorageError>(true)
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let ticket = storage
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if ticket.state != "on_route" || ticket.version != 1 {
        return Err(format!(
            "expected on_route at version 1, got {} at {}",
            ticket.state, ticket.version
        ));
    }
    Ok(())
}

// ── Blind OCC updates from version 0: exactly one wins ──────────────────────

/// N tasks update t-1 assuming version 0 without reading it first. One
/// commit succeeds; the rest must see ConcurrentConflict either at update
/// or at commit.
async fn blind_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_ticket(storage.as_ref(), make_ticket("t-1", "FS-0001", "new")).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let result = s
                .update_ticket(&mut snap, 0, make_ticket("t-1", "FS-0001", "assigned"))
                .await;
            match result {
                Ok(_) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                    Err(e) => Err(e),
                },
                Err(StorageError::ConcurrentConflict { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    Ok(())
}

// ── Different tickets: no contention ────────────────────────────────────────

async fn different_tickets_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_ticket(
            storage.as_ref(),
            make_ticket(&format!("t-{i}"), &format!("FS-{i:04}"), "new"),
        )
        .await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("t-{i}");
            let mut snap = s.begin_snapshot().await?;
            let mut ticket = s.get_ticket_for_update(&mut snap, &id).await?;
            ticket.state = "assigned".to_string();
            s.update_ticket(&mut snap, 0, ticket).await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }

    let assigned = storage
        .list_tickets(Some("assigned"))
        .await
        .map_err(|e| format!("list: {e}"))?;
    if assigned.len() != N {
        return Err(format!("expected {N} assigned tickets, got {}", assigned.len()));
    }
    Ok(())
}

// ── Serialized read-modify-write keeps history dense ────────────────────────

/// N tasks each lock t-1, read the history length, append the next sequence
/// number and bump the version. Row locking must leave sequences 1..=N with
/// no gaps or duplicates.
async fn serialized_appends_keep_sequence_dense<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_ticket(storage.as_ref(), make_ticket("t-1", "FS-0001", "waiting_parts")).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let ticket = s.get_ticket_for_update(&mut snap, "t-1").await?;
            let next = s.status_history_len(&mut snap, "t-1").await? + 1;
            let version = ticket.version;
            s.update_ticket(&mut snap, version, ticket).await?;
            s.insert_status_history(
                &mut snap,
                make_history(&format!("h-{i}"), "t-1", next, Some("waiting_parts"), "waiting_parts"),
            )
            .await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }

    let history = storage
        .list_status_history("t-1")
        .await
        .map_err(|e| format!("history: {e}"))?;
    let sequences: Vec<u64> = history.iter().map(|h| h.sequence).collect();
    let expected: Vec<u64> = (1..=N as u64).collect();
    if sequences != expected {
        return Err(format!("expected dense sequences {expected:?}, got {sequences:?}"));
    }
    let ticket = storage
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if ticket.version != N as i64 {
        return Err(format!("expected version {N}, got {}", ticket.version));
    }
    Ok(())
}
