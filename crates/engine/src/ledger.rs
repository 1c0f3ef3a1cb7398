//! Time tracking ledger.
//!
//! One interval per stay in a state, opened on entry and closed on exit,
//! written inside the transition's snapshot. A ticket never has more than one
//! open interval; terminal states get none.

use std::collections::BTreeMap;

use fieldops_storage::{StorageError, TicketStore, TimeLogRecord};
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::{format_timestamp, parse_timestamp};
use crate::state::TicketState;

/// Open an interval for `state` unless it is terminal.
pub async fn on_enter<S: TicketStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    ticket_id: &str,
    state: TicketState,
    technician_id: &str,
    at: OffsetDateTime,
) -> Result<Option<TimeLogRecord>, StorageError> {
    if state.is_terminal() {
        return Ok(None);
    }
    let record = TimeLogRecord {
        id: uuid::Uuid::new_v4().to_string(),
        ticket_id: ticket_id.to_string(),
        state: state.as_str().to_string(),
        technician_id: technician_id.to_string(),
        started_at: format_timestamp(at),
        ended_at: None,
        duration_secs: None,
    };
    store.insert_time_log(snapshot, record.clone()).await?;
    Ok(Some(record))
}

/// Close the ticket's open interval, if there is one.
///
/// The open interval is closed even when it belongs to a state other than
/// `state`, so the single-open invariant survives earlier inconsistencies.
pub async fn on_exit<S: TicketStore>(
    store: &S,
    snapshot: &mut S::Snapshot,
    ticket_id: &str,
    state: TicketState,
    at: OffsetDateTime,
) -> Result<Option<TimeLogRecord>, StorageError> {
    let Some(open) = store.find_open_time_log(snapshot, ticket_id).await? else {
        tracing::debug!(ticket_id, state = %state, "no open time log to close");
        return Ok(None);
    };
    if open.state != state.as_str() {
        tracing::warn!(
            ticket_id,
            open_state = %open.state,
            exiting = %state,
            "closing time log opened for a different state"
        );
    }

    let started = parse_timestamp(&open.started_at).map_err(|e| {
        StorageError::Backend(format!("time log {} has malformed started_at: {e}", open.id))
    })?;
    let duration = (at - started).whole_seconds().max(0);
    let closed = store
        .close_time_log(snapshot, &open.id, &format_timestamp(at), duration)
        .await?;
    Ok(Some(closed))
}

/// Per-state time spent by one ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeReport {
    /// Closed durations plus the running interval, by state name.
    pub per_state_secs: BTreeMap<String, i64>,
    pub total_secs: i64,
    pub open_state: Option<String>,
    pub open_elapsed_secs: Option<i64>,
}

/// Sum a ticket's intervals. The open one counts up to `now`.
pub fn summarize(logs: &[TimeLogRecord], now: OffsetDateTime) -> TimeReport {
    let mut report = TimeReport::default();
    for log in logs {
        let secs = match log.duration_secs {
            Some(secs) => secs,
            None => {
                let elapsed = parse_timestamp(&log.started_at)
                    .map(|started| (now - started).whole_seconds().max(0))
                    .unwrap_or(0);
                report.open_state = Some(log.state.clone());
                report.open_elapsed_secs = Some(elapsed);
                elapsed
            }
        };
        *report.per_state_secs.entry(log.state.clone()).or_insert(0) += secs;
        report.total_secs += secs;
    }
    report
}
