/// All errors that can be returned by a TicketStore implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another transaction modified
    /// the ticket concurrently. The expected version was not found.
    #[error("concurrent conflict on ticket {ticket_id}: expected version {expected_version}")]
    ConcurrentConflict {
        ticket_id: String,
        expected_version: i64,
    },

    /// Ticket not found: no record with the given id.
    #[error("ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: String },

    /// A record with this id (or ticket number) already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Opening a time log while another one is still open for the ticket.
    #[error("ticket {ticket_id} already has an open time log ({open_id})")]
    OpenTimeLogExists { ticket_id: String, open_id: String },

    /// A non-ticket record referenced by id does not exist.
    #[error("{kind} not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },

    /// A row lock could not be acquired within the configured bound.
    #[error("timed out waiting for lock on {key}")]
    Timeout { key: String },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the whole unit of work from scratch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentConflict { .. } | StorageError::Timeout { .. }
        )
    }
}
