//! Field-service ticket lifecycle engine.
//!
//! Tickets move through a fixed set of states under a role-aware policy
//! table. Every transition is one storage snapshot: the ticket update, its
//! audit entry, time ledger changes, location sample and any redeemed
//! confirmation code commit together or not at all.

pub mod clock;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod notify;
pub mod policy;
pub mod service;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LifecycleConfig;
pub use confirmation::{CodeGenerator, CodePurpose, IssuedCode, OsRngGenerator, Verification};
pub use error::TransitionError;
pub use executor::{
    Actor, CreatedTicket, ErrorBody, NewTicket, TransitionExecutor, TransitionOutcome,
    TransitionPayload, TransitionResult,
};
pub use ledger::TimeReport;
pub use notify::{LogDispatcher, MessagePurpose, NotificationDispatcher, NotifyError};
pub use policy::{PolicyAnalysis, PolicyEntry, PolicyError, PolicyTable};
pub use service::LifecycleService;
pub use state::{Priority, Role, TicketState, UnknownName};
