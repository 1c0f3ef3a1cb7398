//! Executor plus customer notifications.
//!
//! Messages go out only after the operation committed. A failed send is
//! logged and otherwise ignored.

use std::sync::Arc;

use fieldops_storage::TicketStore;

use crate::confirmation::{CodePurpose, IssuedCode, Verification};
use crate::error::TransitionError;
use crate::executor::{
    Actor, CreatedTicket, NewTicket, TransitionExecutor, TransitionOutcome, TransitionPayload,
};
use crate::notify::{code_message, mask_phone, status_message, MessagePurpose, NotificationDispatcher};
use crate::state::TicketState;

pub struct LifecycleService<S: TicketStore> {
    executor: TransitionExecutor<S>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl<S: TicketStore> LifecycleService<S> {
    pub fn new(executor: TransitionExecutor<S>, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self { executor, notifier }
    }

    /// Reads and policy queries go straight to the executor.
    pub fn executor(&self) -> &TransitionExecutor<S> {
        &self.executor
    }

    pub async fn create_ticket(
        &self,
        new: &NewTicket,
        actor: &Actor,
    ) -> Result<CreatedTicket, TransitionError> {
        self.executor.create_ticket(new, actor).await
    }

    pub async fn execute_transition(
        &self,
        ticket_id: &str,
        to: TicketState,
        actor: &Actor,
        payload: &TransitionPayload,
    ) -> Result<TransitionOutcome, TransitionError> {
        let outcome = self
            .executor
            .execute_transition(ticket_id, to, actor, payload)
            .await?;
        if let Some(message) = status_message(&outcome.ticket.ticket_number, outcome.new_state) {
            self.dispatch(
                &outcome.ticket.customer_phone,
                &message,
                MessagePurpose::StatusUpdate,
            )
            .await;
        }
        Ok(outcome)
    }

    /// Issue a code and text it to the phone it was issued for.
    pub async fn issue_confirmation_code(
        &self,
        ticket_id: &str,
        phone: Option<&str>,
        purpose: CodePurpose,
        actor: &Actor,
    ) -> Result<IssuedCode, TransitionError> {
        let issued = self
            .executor
            .issue_confirmation_code(ticket_id, phone, purpose, actor)
            .await?;
        let ticket_number = match self.executor.get_ticket(ticket_id).await {
            Ok(ticket) => ticket.ticket_number,
            Err(_) => ticket_id.to_string(),
        };
        self.dispatch(
            &issued.phone,
            &code_message(&ticket_number, &issued),
            purpose.into(),
        )
        .await;
        Ok(issued)
    }

    pub async fn verify_confirmation_code(
        &self,
        ticket_id: &str,
        phone: Option<&str>,
        purpose: CodePurpose,
        code: &str,
    ) -> Result<Verification, TransitionError> {
        self.executor
            .verify_confirmation_code(ticket_id, phone, purpose, code)
            .await
    }

    async fn dispatch(&self, phone: &str, message: &str, purpose: MessagePurpose) {
        if let Err(e) = self.notifier.send(phone, message, purpose).await {
            tracing::warn!(
                phone = %mask_phone(phone),
                purpose = purpose.as_str(),
                error = %e,
                "notification failed after commit"
            );
        }
    }
}
