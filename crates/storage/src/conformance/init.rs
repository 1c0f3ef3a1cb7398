use std::future::Future;

use super::{make_ticket, seed_ticket, TestResult};
use crate::{StorageError, TicketStore};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "init",
            "insert_ticket_visible_after_commit",
            insert_ticket_visible_after_commit(factory).await,
        ),
        TestResult::from_result(
            "init",
            "insert_preserves_fields",
            insert_preserves_fields(factory).await,
        ),
        TestResult::from_result(
            "init",
            "duplicate_id_rejected",
            duplicate_id_rejected(factory).await,
        ),
        TestResult::from_result(
            "init",
            "duplicate_ticket_number_rejected",
            duplicate_ticket_number_rejected(factory).await,
        ),
        TestResult::from_result(
            "init",
            "ticket_sequence_strictly_increases",
            ticket_sequence_strictly_increases(factory).await,
        ),
        TestResult::from_result(
            "init",
            "list_tickets_filters_by_state",
            list_tickets_filters_by_state(factory).await,
        ),
    ]
}

async fn insert_ticket_visible_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;
    let t = s
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if t.state != "new" || t.version != 0 {
        return Err(format!(
            "expected state new at version 0, got {} at {}",
            t.state, t.version
        ));
    }
    Ok(())
}

async fn insert_preserves_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut ticket = make_ticket("t-1", "FS-0001", "new");
    ticket.technician_id = Some("tech-9".to_string());
    ticket.priority = "urgent".to_string();
    seed_ticket(&s, ticket.clone()).await?;
    let stored = s
        .get_ticket("t-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored != ticket {
        return Err(format!("stored ticket differs: {stored:?}"));
    }
    Ok(())
}

async fn duplicate_id_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    match s
        .insert_ticket(&mut snap, make_ticket("t-1", "FS-0002", "new"))
        .await
    {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        // Backends with deferred constraints may only detect it at commit.
        Ok(()) => match s.commit_snapshot(snap).await {
            Err(StorageError::AlreadyExists { .. }) => Ok(()),
            other => Err(format!("expected AlreadyExists, got {other:?}")),
        },
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
    }
}

async fn duplicate_ticket_number_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    match s
        .insert_ticket(&mut snap, make_ticket("t-2", "FS-0001", "new"))
        .await
    {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        Ok(()) => match s.commit_snapshot(snap).await {
            Err(StorageError::AlreadyExists { .. }) => Ok(()),
            other => Err(format!("expected AlreadyExists, got {other:?}")),
        },
        Err(e) => Err(format!("expected AlreadyExists, got {e}")),
    }
}

async fn ticket_sequence_strictly_increases<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let a = s
        .next_ticket_sequence(&mut snap)
        .await
        .map_err(|e| format!("seq: {e}"))?;
    let b = s
        .next_ticket_sequence(&mut snap)
        .await
        .map_err(|e| format!("seq: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let c = s
        .next_ticket_sequence(&mut snap)
        .await
        .map_err(|e| format!("seq: {e}"))?;
    s.abort_snapshot(snap).await.map_err(|e| format!("abort: {e}"))?;

    if !(a < b && b < c) {
        return Err(format!("sequence not increasing: {a}, {b}, {c}"));
    }
    Ok(())
}

async fn list_tickets_filters_by_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TicketStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_ticket(&s, make_ticket("t-1", "FS-0001", "new")).await?;
    seed_ticket(&s, make_ticket("t-2", "FS-0002", "assigned")).await?;
    seed_ticket(&s, make_ticket("t-3", "FS-0003", "new")).await?;

    let all = s.list_tickets(None).await.map_err(|e| format!("list: {e}"))?;
    let fresh = s
        .list_tickets(Some("new"))
        .await
        .map_err(|e| format!("list: {e}"))?;
    if all.len() != 3 {
        return Err(format!("expected 3 tickets, got {}", all.len()));
    }
    let ids: Vec<&str> = fresh.iter().map(|t| t.id.as_str()).collect();
    if ids != ["t-1", "t-3"] {
        return Err(format!("expected [t-1, t-3] in creation order, got {ids:?}"));
    }
    Ok(())
}
