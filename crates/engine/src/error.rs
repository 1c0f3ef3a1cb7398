use fieldops_storage::StorageError;

use crate::confirmation::CodePurpose;
use crate::state::{Role, TicketState};

/// Why a lifecycle operation was refused or failed.
///
/// Every failure is reported before anything is committed.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("ticket not found: {ticket_id}")]
    NotFound { ticket_id: String },

    #[error("no transition from {from} to {to}")]
    InvalidTransition { from: TicketState, to: TicketState },

    #[error("role {role} may not move a ticket from {from} to {to}")]
    RoleForbidden {
        from: TicketState,
        to: TicketState,
        role: Role,
    },

    #[error("role {role} may not issue {purpose} codes")]
    IssueForbidden { role: Role, purpose: CodePurpose },

    #[error("transition to {to} requires at least {required} photo(s), got {provided}")]
    MissingPhotos {
        to: TicketState,
        required: u32,
        provided: usize,
    },

    #[error("transition from {from} to {to} requires notes")]
    MissingNotes { from: TicketState, to: TicketState },

    #[error("transition to {to} requires a technician")]
    MissingTechnician { to: TicketState },

    #[error("customer confirmation code required")]
    ConfirmationRequired,

    #[error("confirmation code is invalid")]
    ConfirmationInvalid,

    #[error("confirmation code has expired")]
    ConfirmationExpired,

    /// Malformed input that never reached the lifecycle rules.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Lock contention, optimistic conflict or operation timeout. Retrying
    /// the whole call is safe: it re-reads the ticket from scratch.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl TransitionError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::NotFound { .. } => "not_found",
            TransitionError::InvalidTransition { .. } => "invalid_transition",
            TransitionError::RoleForbidden { .. } | TransitionError::IssueForbidden { .. } => {
                "role_forbidden"
            }
            TransitionError::MissingPhotos { .. } => "missing_photos",
            TransitionError::MissingNotes { .. } => "missing_notes",
            TransitionError::MissingTechnician { .. } => "missing_technician",
            TransitionError::ConfirmationRequired => "confirmation_required",
            TransitionError::ConfirmationInvalid => "confirmation_invalid",
            TransitionError::ConfirmationExpired => "confirmation_expired",
            TransitionError::InvalidRequest(_) => "invalid_request",
            TransitionError::Transient(_) => "transient",
            TransitionError::Storage(e) if e.is_transient() => "transient",
            TransitionError::Storage(_) => "storage",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransitionError::Transient(_) => true,
            TransitionError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Fold transient storage failures into [`TransitionError::Transient`].
    pub(crate) fn normalize(self) -> Self {
        match self {
            TransitionError::Storage(e) if e.is_transient() => {
                TransitionError::Transient(e.to_string())
            }
            other => other,
        }
    }
}

impl From<StorageError> for TransitionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::TicketNotFound { ticket_id } => TransitionError::NotFound { ticket_id },
            other => TransitionError::Storage(other),
        }
    }
}
