//! In-memory `TicketStore` backend.
//!
//! Writes are staged inside the snapshot and applied under a single table
//! mutex at commit. Row locks are per-key `tokio::sync::Mutex`es owned by the
//! snapshot, so dropping a snapshot both discards its writes and releases
//! its locks. Lock entries nobody holds or waits on are pruned when the
//! snapshot ends, so the registry only tracks contended keys.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::error::StorageError;
use crate::record::{
    ConfirmationCodeRecord, LocationSampleRecord, StatusHistoryRecord, TicketRecord,
    TimeLogRecord,
};
use crate::traits::TicketStore;

/// How long a snapshot waits for a row lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Tables {
    tickets: Vec<TicketRecord>,
    history: Vec<StatusHistoryRecord>,
    time_logs: Vec<TimeLogRecord>,
    locations: Vec<LocationSampleRecord>,
    codes: Vec<ConfirmationCodeRecord>,
}

enum StagedTicket {
    Insert(TicketRecord),
    Update {
        expected_version: i64,
        record: TicketRecord,
    },
}

impl StagedTicket {
    fn record(&self) -> &TicketRecord {
        match self {
            StagedTicket::Insert(record) | StagedTicket::Update { record, .. } => record,
        }
    }
}

type LockRegistry = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Snapshot type for [`MemoryStore`]: held row locks plus staged writes.
pub struct MemorySnapshot {
    registry: Arc<LockRegistry>,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    tickets: BTreeMap<String, StagedTicket>,
    history: Vec<StatusHistoryRecord>,
    time_logs: Vec<TimeLogRecord>,
    locations: Vec<LocationSampleRecord>,
    codes: Vec<ConfirmationCodeRecord>,
}

impl MemorySnapshot {
    fn new(registry: Arc<LockRegistry>) -> Self {
        Self {
            registry,
            guards: HashMap::new(),
            tickets: BTreeMap::new(),
            history: Vec::new(),
            time_logs: Vec::new(),
            locations: Vec::new(),
            codes: Vec::new(),
        }
    }
}

impl Drop for MemorySnapshot {
    fn drop(&mut self) {
        if self.guards.is_empty() {
            return;
        }
        let keys: Vec<String> = self.guards.drain().map(|(key, _guard)| key).collect();
        prune_locks(&self.registry, keys);
    }
}

/// Forget the lock for each key unless another snapshot holds or awaits it.
fn prune_locks(registry: &LockRegistry, keys: impl IntoIterator<Item = String>) {
    let mut locks = registry.lock().unwrap_or_else(PoisonError::into_inner);
    for key in keys {
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }
}

struct MemoryInner {
    tables: Mutex<Tables>,
    locks: Arc<LockRegistry>,
    sequence: AtomicU64,
    lock_timeout: Duration,
}

/// Process-local ticket store. Cloning shares the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                tables: Mutex::new(Tables::default()),
                locks: Arc::new(Mutex::new(HashMap::new())),
                sequence: AtomicU64::new(0),
                lock_timeout,
            }),
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.inner.tables.lock().map_err(poisoned)
    }

    /// Take the row lock for `key` unless this snapshot already holds it.
    async fn acquire(&self, snapshot: &mut MemorySnapshot, key: String) -> Result<(), StorageError> {
        if snapshot.guards.contains_key(&key) {
            return Ok(());
        }
        let lock = {
            let mut locks = self.inner.locks.lock().map_err(poisoned)?;
            locks.entry(key.clone()).or_default().clone()
        };
        match tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned()).await {
            Ok(guard) => {
                snapshot.guards.insert(key, guard);
                Ok(())
            }
            Err(_) => {
                tracing::debug!(%key, "row lock wait timed out");
                prune_locks(&self.inner.locks, [key.clone()]);
                Err(StorageError::Timeout { key })
            }
        }
    }

    /// The ticket as this snapshot sees it.
    fn ticket_view(
        &self,
        snapshot: &MemorySnapshot,
        ticket_id: &str,
    ) -> Result<Option<TicketRecord>, StorageError> {
        if let Some(staged) = snapshot.tickets.get(ticket_id) {
            return Ok(Some(staged.record().clone()));
        }
        let tables = self.tables()?;
        Ok(tables.tickets.iter().find(|t| t.id == ticket_id).cloned())
    }

    fn time_log_view(
        &self,
        snapshot: &MemorySnapshot,
        ticket_id: &str,
    ) -> Result<Vec<TimeLogRecord>, StorageError> {
        let tables = self.tables()?;
        Ok(overlay(
            &tables.time_logs,
            &snapshot.time_logs,
            |r| r.ticket_id == ticket_id,
            |r| r.id.as_str(),
        ))
    }

    fn code_view(
        &self,
        snapshot: &MemorySnapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
    ) -> Result<Vec<ConfirmationCodeRecord>, StorageError> {
        let tables = self.tables()?;
        Ok(overlay(
            &tables.codes,
            &snapshot.codes,
            |r| r.ticket_id == ticket_id && r.phone == phone && r.purpose == purpose,
            |r| r.id.as_str(),
        ))
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::new(self.inner.locks.clone()))
    }

    async fn commit_snapshot(&self, mut snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut tables = self.tables()?;

        // Validate everything before applying anything.
        for (ticket_id, staged) in &snapshot.tickets {
            match staged {
                StagedTicket::Insert(record) => {
                    if tables.tickets.iter().any(|t| t.id == *ticket_id) {
                        return Err(StorageError::AlreadyExists {
                            kind: "ticket",
                            id: ticket_id.clone(),
                        });
                    }
                    if tables
                        .tickets
                        .iter()
                        .any(|t| t.ticket_number == record.ticket_number)
                    {
                        return Err(StorageError::AlreadyExists {
                            kind: "ticket number",
                            id: record.ticket_number.clone(),
                        });
                    }
                }
                StagedTicket::Update {
                    expected_version, ..
                } => {
                    let current = tables
                        .tickets
                        .iter()
                        .find(|t| t.id == *ticket_id)
                        .ok_or_else(|| StorageError::TicketNotFound {
                            ticket_id: ticket_id.clone(),
                        })?;
                    if current.version != *expected_version {
                        return Err(StorageError::ConcurrentConflict {
                            ticket_id: ticket_id.clone(),
                            expected_version: *expected_version,
                        });
                    }
                }
            }
        }

        let touched: BTreeSet<&str> = snapshot
            .time_logs
            .iter()
            .map(|r| r.ticket_id.as_str())
            .collect();
        for ticket_id in touched {
            let merged = overlay(
                &tables.time_logs,
                &snapshot.time_logs,
                |r| r.ticket_id == ticket_id,
                |r| r.id.as_str(),
            );
            let open: Vec<&TimeLogRecord> = merged.iter().filter(|r| r.is_open()).collect();
            if open.len() > 1 {
                return Err(StorageError::OpenTimeLogExists {
                    ticket_id: ticket_id.to_string(),
                    open_id: open[0].id.clone(),
                });
            }
        }

        for (_, staged) in std::mem::take(&mut snapshot.tickets) {
            match staged {
                StagedTicket::Insert(record) => tables.tickets.push(record),
                StagedTicket::Update { record, .. } => {
                    upsert(&mut tables.tickets, record, |a, b| a.id == b.id)
                }
            }
        }
        tables.history.append(&mut snapshot.history);
        for record in std::mem::take(&mut snapshot.time_logs) {
            upsert(&mut tables.time_logs, record, |a, b| a.id == b.id);
        }
        tables.locations.append(&mut snapshot.locations);
        for record in std::mem::take(&mut snapshot.codes) {
            upsert(&mut tables.codes, record, |a, b| a.id == b.id);
        }

        drop(tables);
        drop(snapshot);
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn next_ticket_sequence(
        &self,
        _snapshot: &mut MemorySnapshot,
    ) -> Result<u64, StorageError> {
        Ok(self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn insert_ticket(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TicketRecord,
    ) -> Result<(), StorageError> {
        self.acquire(snapshot, ticket_key(&record.id)).await?;
        if self.ticket_view(snapshot, &record.id)?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "ticket",
                id: record.id,
            });
        }
        let number_taken = snapshot
            .tickets
            .values()
            .any(|s| s.record().ticket_number == record.ticket_number)
            || self
                .tables()?
                .tickets
                .iter()
                .any(|t| t.ticket_number == record.ticket_number);
        if number_taken {
            return Err(StorageError::AlreadyExists {
                kind: "ticket number",
                id: record.ticket_number,
            });
        }
        snapshot
            .tickets
            .insert(record.id.clone(), StagedTicket::Insert(record));
        Ok(())
    }

    async fn get_ticket_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<TicketRecord, StorageError> {
        self.acquire(snapshot, ticket_key(ticket_id)).await?;
        self.ticket_view(snapshot, ticket_id)?
            .ok_or_else(|| StorageError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })
    }

    async fn update_ticket(
        &self,
        snapshot: &mut MemorySnapshot,
        expected_version: i64,
        mut record: TicketRecord,
    ) -> Result<i64, StorageError> {
        self.acquire(snapshot, ticket_key(&record.id)).await?;
        let current = self.ticket_view(snapshot, &record.id)?.ok_or_else(|| {
            StorageError::TicketNotFound {
                ticket_id: record.id.clone(),
            }
        })?;
        if current.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                ticket_id: record.id,
                expected_version,
            });
        }

        let new_version = expected_version + 1;
        record.version = new_version;
        let staged = match snapshot.tickets.remove(&record.id) {
            Some(StagedTicket::Insert(_)) => StagedTicket::Insert(record),
            Some(StagedTicket::Update {
                expected_version: original,
                ..
            }) => StagedTicket::Update {
                expected_version: original,
                record,
            },
            None => StagedTicket::Update {
                expected_version,
                record,
            },
        };
        snapshot
            .tickets
            .insert(staged.record().id.clone(), staged);
        Ok(new_version)
    }

    async fn insert_status_history(
        &self,
        snapshot: &mut MemorySnapshot,
        record: StatusHistoryRecord,
    ) -> Result<(), StorageError> {
        if self.ticket_view(snapshot, &record.ticket_id)?.is_none() {
            return Err(StorageError::TicketNotFound {
                ticket_id: record.ticket_id,
            });
        }
        snapshot.history.push(record);
        Ok(())
    }

    async fn status_history_len(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<u64, StorageError> {
        let committed = self
            .tables()?
            .history
            .iter()
            .filter(|h| h.ticket_id == ticket_id)
            .count();
        let staged = snapshot
            .history
            .iter()
            .filter(|h| h.ticket_id == ticket_id)
            .count();
        Ok((committed + staged) as u64)
    }

    async fn find_open_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
    ) -> Result<Option<TimeLogRecord>, StorageError> {
        Ok(self
            .time_log_view(snapshot, ticket_id)?
            .into_iter()
            .find(|r| r.is_open()))
    }

    async fn insert_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TimeLogRecord,
    ) -> Result<(), StorageError> {
        let existing = self.time_log_view(snapshot, &record.ticket_id)?;
        if existing.iter().any(|r| r.id == record.id) {
            return Err(StorageError::AlreadyExists {
                kind: "time log",
                id: record.id,
            });
        }
        if record.is_open() {
            if let Some(open) = existing.iter().find(|r| r.is_open()) {
                return Err(StorageError::OpenTimeLogExists {
                    ticket_id: record.ticket_id,
                    open_id: open.id.clone(),
                });
            }
        }
        snapshot.time_logs.push(record);
        Ok(())
    }

    async fn close_time_log(
        &self,
        snapshot: &mut MemorySnapshot,
        time_log_id: &str,
        ended_at: &str,
        duration_secs: i64,
    ) -> Result<TimeLogRecord, StorageError> {
        let found = match snapshot.time_logs.iter().find(|r| r.id == time_log_id) {
            Some(staged) => Some(staged.clone()),
            None => self
                .tables()?
                .time_logs
                .iter()
                .find(|r| r.id == time_log_id)
                .cloned(),
        };
        let mut record = found.ok_or_else(|| StorageError::RecordNotFound {
            kind: "time log",
            id: time_log_id.to_string(),
        })?;
        if !record.is_open() {
            return Err(StorageError::Backend(format!(
                "time log {time_log_id} is already closed"
            )));
        }
        record.ended_at = Some(ended_at.to_string());
        record.duration_secs = Some(duration_secs);
        upsert(&mut snapshot.time_logs, record.clone(), |a, b| a.id == b.id);
        Ok(record)
    }

    async fn insert_location_sample(
        &self,
        snapshot: &mut MemorySnapshot,
        record: LocationSampleRecord,
    ) -> Result<(), StorageError> {
        snapshot.locations.push(record);
        Ok(())
    }

    async fn get_confirmation_code_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
    ) -> Result<Option<ConfirmationCodeRecord>, StorageError> {
        self.acquire(snapshot, code_key(ticket_id, phone, purpose))
            .await?;
        Ok(self
            .code_view(snapshot, ticket_id, phone, purpose)?
            .into_iter()
            .filter(|c| c.superseded_at.is_none())
            .last())
    }

    async fn supersede_confirmation_codes(
        &self,
        snapshot: &mut MemorySnapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
        superseded_at: &str,
    ) -> Result<usize, StorageError> {
        self.acquire(snapshot, code_key(ticket_id, phone, purpose))
            .await?;
        let mut count = 0;
        for mut code in self.code_view(snapshot, ticket_id, phone, purpose)? {
            if code.superseded_at.is_none() && code.redeemed_at.is_none() {
                code.superseded_at = Some(superseded_at.to_string());
                upsert(&mut snapshot.codes, code, |a, b| a.id == b.id);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_confirmation_code(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError> {
        self.acquire(
            snapshot,
            code_key(&record.ticket_id, &record.phone, &record.purpose),
        )
        .await?;
        let taken = snapshot.codes.iter().any(|c| c.id == record.id)
            || self.tables()?.codes.iter().any(|c| c.id == record.id);
        if taken {
            return Err(StorageError::AlreadyExists {
                kind: "confirmation code",
                id: record.id,
            });
        }
        snapshot.codes.push(record);
        Ok(())
    }

    async fn update_confirmation_code(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError> {
        self.acquire(
            snapshot,
            code_key(&record.ticket_id, &record.phone, &record.purpose),
        )
        .await?;
        let exists = self
            .code_view(snapshot, &record.ticket_id, &record.phone, &record.purpose)?
            .iter()
            .any(|c| c.id == record.id);
        if !exists {
            return Err(StorageError::RecordNotFound {
                kind: "confirmation code",
                id: record.id,
            });
        }
        upsert(&mut snapshot.codes, record, |a, b| a.id == b.id);
        Ok(())
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, StorageError> {
        self.tables()?
            .tickets
            .iter()
            .find(|t| t.id == ticket_id)
            .cloned()
            .ok_or_else(|| StorageError::TicketNotFound {
                ticket_id: ticket_id.to_string(),
            })
    }

    async fn list_tickets(
        &self,
        state_filter: Option<&str>,
    ) -> Result<Vec<TicketRecord>, StorageError> {
        Ok(self
            .tables()?
            .tickets
            .iter()
            .filter(|t| state_filter.map_or(true, |s| t.state == s))
            .cloned()
            .collect())
    }

    async fn list_status_history(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<StatusHistoryRecord>, StorageError> {
        let mut entries: Vec<StatusHistoryRecord> = self
            .tables()?
            .history
            .iter()
            .filter(|h| h.ticket_id == ticket_id)
            .cloned()
            .collect();
        entries.sort_by_key(|h| h.sequence);
        Ok(entries)
    }

    async fn list_time_logs(&self, ticket_id: &str) -> Result<Vec<TimeLogRecord>, StorageError> {
        Ok(self
            .tables()?
            .time_logs
            .iter()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn list_location_samples(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<LocationSampleRecord>, StorageError> {
        Ok(self
            .tables()?
            .locations
            .iter()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn list_confirmation_codes(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<ConfirmationCodeRecord>, StorageError> {
        Ok(self
            .tables()?
            .codes
            .iter()
            .filter(|c| c.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}

fn ticket_key(ticket_id: &str) -> String {
    format!("ticket:{ticket_id}")
}

fn code_key(ticket_id: &str, phone: &str, purpose: &str) -> String {
    format!("code:{ticket_id}:{phone}:{purpose}")
}

fn poisoned<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Backend("memory store mutex poisoned".to_string())
}

/// Replace the element `same` matches, or append.
fn upsert<T>(items: &mut Vec<T>, record: T, same: impl Fn(&T, &T) -> bool) {
    match items.iter_mut().find(|existing| same(existing, &record)) {
        Some(slot) => *slot = record,
        None => items.push(record),
    }
}

/// Committed rows selected by `keep`, with staged rows laid over them by id.
fn overlay<T: Clone>(
    committed: &[T],
    staged: &[T],
    keep: impl Fn(&T) -> bool,
    id: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut merged: Vec<T> = committed.iter().filter(|r| keep(r)).cloned().collect();
    for record in staged.iter().filter(|r| keep(r)) {
        match merged.iter_mut().find(|m| id(m) == id(record)) {
            Some(slot) => *slot = record.clone(),
            None => merged.push(record.clone()),
        }
    }
    merged
}
