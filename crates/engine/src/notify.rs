//! Customer notifications.
//!
//! The engine only decides *what* to tell the customer; delivery (queueing,
//! retries, the SMS provider) belongs to the dispatcher. Dispatch happens
//! after commit and a failed send never undoes the operation that caused it.

use async_trait::async_trait;
use serde::Serialize;

use crate::confirmation::{CodePurpose, IssuedCode};
use crate::state::TicketState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePurpose {
    CompletionCode,
    LoginCode,
    StatusUpdate,
}

impl MessagePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            MessagePurpose::CompletionCode => "completion_code",
            MessagePurpose::LoginCode => "login_code",
            MessagePurpose::StatusUpdate => "status_update",
        }
    }
}

impl From<CodePurpose> for MessagePurpose {
    fn from(purpose: CodePurpose) -> Self {
        match purpose {
            CodePurpose::Completion => MessagePurpose::CompletionCode,
            CodePurpose::Login => MessagePurpose::LoginCode,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait NotificationDispatcher: Send + Sync + 'static {
    /// Hand one message to the delivery channel.
    async fn send(
        &self,
        phone: &str,
        message: &str,
        purpose: MessagePurpose,
    ) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(
        &self,
        phone: &str,
        message: &str,
        purpose: MessagePurpose,
    ) -> Result<(), NotifyError> {
        // Never log the message body: it may contain a code.
        tracing::info!(
            phone = %mask_phone(phone),
            purpose = purpose.as_str(),
            chars = message.len(),
            "notification (log only)"
        );
        Ok(())
    }
}

pub fn code_message(ticket_number: &str, issued: &IssuedCode) -> String {
    match issued.purpose {
        CodePurpose::Completion => format!(
            "Your confirmation code for repair {ticket_number} is {}. Share it with the technician only at handover.",
            issued.code
        ),
        CodePurpose::Login => format!("Your FieldOps login code is {}.", issued.code),
    }
}

/// Status text for states the customer is told about, `None` for the rest.
pub fn status_message(ticket_number: &str, state: TicketState) -> Option<String> {
    let text = match state {
        TicketState::Assigned => "a technician has been assigned",
        TicketState::OnRoute => "your technician is on the way",
        TicketState::WaitingParts => "we are waiting for spare parts",
        TicketState::PickupDevice => "your device will be picked up for workshop repair",
        TicketState::ReadyDelivery => "your device is ready for delivery",
        TicketState::Completed => "the repair is complete",
        TicketState::NotFixed => "we could not fix the device",
        TicketState::Cancelled => "the request was cancelled",
        _ => return None,
    };
    Some(format!("Repair {ticket_number}: {text}."))
}

/// `+15551234567` -> `********4567`.
pub fn mask_phone(phone: &str) -> String {
    let digits = phone.chars().count();
    phone
        .chars()
        .enumerate()
        .map(|(i, c)| if i + 4 < digits { '*' } else { c })
        .collect()
}
