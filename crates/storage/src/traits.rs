use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{
    ConfirmationCodeRecord, LocationSampleRecord, StatusHistoryRecord, TicketRecord,
    TimeLogRecord,
};

/// The storage trait for FieldOps lifecycle backends.
///
/// A `TicketStore` implementation provides durable, transactional storage
/// for tickets, their status history, time logs, location samples, and
/// confirmation codes.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back and every lock it holds released. The lifecycle
/// engine relies on this when a transition is cancelled or times out.
///
/// Reads taken through a snapshot see that snapshot's own uncommitted
/// writes. Query methods outside a snapshot only see committed data.
///
/// ## Row Locking
///
/// `get_ticket_for_update` locks the ticket row until the snapshot ends,
/// serializing concurrent transitions on one ticket. The confirmation-code
/// methods that take a snapshot lock the (ticket, phone, purpose) key.
/// Callers always lock the ticket before a code key.
///
/// ## OCC Conflict Detection
///
/// `update_ticket` is conditional on `version = expected_version`. If the
/// stored version differs, the method (or the commit) returns
/// `Err(StorageError::ConcurrentConflict { ... })`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait TicketStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    ///
    /// Must be `Send` to allow passing across async task boundaries.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Ticket operations (within snapshot) ───────────────────────────────────

    /// Allocate the next value of the ticket-number sequence.
    ///
    /// Like a database sequence, values are not returned on abort, so
    /// ticket numbers may have gaps.
    async fn next_ticket_sequence(&self, snapshot: &mut Self::Snapshot)
        -> Result<u64, StorageError>;

    /// Insert a new ticket. The record's `version` is stored as given.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id or the ticket
    /// number is taken.
    async fn insert_ticket(
        &self,
        snapshot: &mut Self::Snapshot,
        record: TicketRecord,
    ) -> Result<(), StorageError>;

    /// Read a ticket, locking the row for update.
    ///
    /// Returns `Err(StorageError::TicketNotFound)` if the ticket does not exist.
    async fn get_ticket_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        ticket_id: &str,
    ) -> Result<TicketRecord, StorageError>;

    /// Replace a ticket's fields with a version-validated UPDATE (OCC).
    ///
    /// The stored version becomes `expected_version + 1`, whatever
    /// `record.version` holds. Returns the new version on success.
    async fn update_ticket(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        record: TicketRecord,
    ) -> Result<i64, StorageError>;

    // ── Audit trail (within snapshot) ─────────────────────────────────────────

    /// Append a status history entry. Entries are never updated or deleted.
    async fn insert_status_history(
        &self,
        snapshot: &mut Self::Snapshot,
        record: StatusHistoryRecord,
    ) -> Result<(), StorageError>;

    /// Number of history entries for a ticket, including uncommitted ones
    /// in this snapshot.
    async fn status_history_len(
        &self,
        snapshot: &mut Self::Snapshot,
        ticket_id: &str,
    ) -> Result<u64, StorageError>;

    // ── Time logs (within snapshot) ───────────────────────────────────────────

    /// The ticket's open time log, if any.
    async fn find_open_time_log(
        &self,
        snapshot: &mut Self::Snapshot,
        ticket_id: &str,
    ) -> Result<Option<TimeLogRecord>, StorageError>;

    /// Insert a time log.
    ///
    /// Returns `Err(StorageError::OpenTimeLogExists)` when the record is open
    /// and the ticket already has an open log.
    async fn insert_time_log(
        &self,
        snapshot: &mut Self::Snapshot,
        record: TimeLogRecord,
    ) -> Result<(), StorageError>;

    /// Close an open time log, returning the closed record.
    async fn close_time_log(
        &self,
        snapshot: &mut Self::Snapshot,
        time_log_id: &str,
        ended_at: &str,
        duration_secs: i64,
    ) -> Result<TimeLogRecord, StorageError>;

    // ── Location samples (within snapshot) ────────────────────────────────────

    async fn insert_location_sample(
        &self,
        snapshot: &mut Self::Snapshot,
        record: LocationSampleRecord,
    ) -> Result<(), StorageError>;

    // ── Confirmation codes (within snapshot) ──────────────────────────────────

    /// Read the current code for (ticket, phone, purpose), locking the key.
    ///
    /// The current code is the most recently created one that has not been
    /// superseded. It may already be verified or redeemed.
    async fn get_confirmation_code_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
    ) -> Result<Option<ConfirmationCodeRecord>, StorageError>;

    /// Mark every unsuperseded, unredeemed code for the key as superseded.
    /// Returns how many codes were superseded.
    async fn supersede_confirmation_codes(
        &self,
        snapshot: &mut Self::Snapshot,
        ticket_id: &str,
        phone: &str,
        purpose: &str,
        superseded_at: &str,
    ) -> Result<usize, StorageError>;

    async fn insert_confirmation_code(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError>;

    /// Replace a stored code record by id.
    async fn update_confirmation_code(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ConfirmationCodeRecord,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot) ───────────────────────────────────

    /// Read a ticket without locking.
    ///
    /// Returns `Err(StorageError::TicketNotFound)` if the ticket does not exist.
    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, StorageError>;

    /// List tickets, optionally filtered by state, in creation order.
    async fn list_tickets(
        &self,
        state_filter: Option<&str>,
    ) -> Result<Vec<TicketRecord>, StorageError>;

    /// A ticket's history in sequence order.
    async fn list_status_history(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<StatusHistoryRecord>, StorageError>;

    /// A ticket's time logs in the order they were opened.
    async fn list_time_logs(&self, ticket_id: &str) -> Result<Vec<TimeLogRecord>, StorageError>;

    async fn list_location_samples(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<LocationSampleRecord>, StorageError>;

    /// Every code ever issued for a ticket, in issuance order.
    async fn list_confirmation_codes(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<ConfirmationCodeRecord>, StorageError>;
}
