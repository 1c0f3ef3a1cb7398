//! SMS delivery through an HTTP gateway.

use async_trait::async_trait;
use fieldops_engine::notify::mask_phone;
use fieldops_engine::{MessagePurpose, NotificationDispatcher, NotifyError};

/// POSTs `{"to", "message", "purpose"}` to a gateway URL.
///
/// Delivery runs on a blocking thread and is not awaited: the caller has
/// already committed and only needs the message queued.
pub(crate) struct WebhookDispatcher {
    url: String,
    agent: ureq::Agent,
}

impl WebhookDispatcher {
    pub(crate) fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn send(
        &self,
        phone: &str,
        message: &str,
        purpose: MessagePurpose,
    ) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "to": phone,
            "message": message,
            "purpose": purpose.as_str(),
        });
        let agent = self.agent.clone();
        let url = self.url.clone();
        let masked = mask_phone(phone);

        tokio::task::spawn_blocking(move || {
            match agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send_json(&body)
            {
                Ok(_) => tracing::debug!(phone = %masked, purpose = purpose.as_str(), "sms queued"),
                Err(e) => tracing::warn!(
                    phone = %masked,
                    purpose = purpose.as_str(),
                    error = %e,
                    "sms gateway rejected message"
                ),
            }
        });
        Ok(())
    }
}
