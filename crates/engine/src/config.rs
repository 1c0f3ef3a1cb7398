use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the lifecycle engine. Every field has a default, so an
/// empty `[lifecycle]` table (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Lifetime of an issued confirmation code.
    pub code_ttl_secs: u64,
    /// Wrong guesses a code survives; the last one supersedes it.
    pub code_max_attempts: u32,
    /// Upper bound on one whole transition, including lock waits.
    pub operation_timeout_ms: u64,
    /// Upper bound on waiting for a single row lock.
    pub lock_timeout_ms: u64,
    /// Optimistic-conflict retries before reporting a transient failure.
    pub max_conflict_retries: u32,
    /// Prefix of generated ticket numbers, e.g. `FS-2025-000042`.
    pub ticket_number_prefix: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 600,
            code_max_attempts: 5,
            operation_timeout_ms: 5_000,
            lock_timeout_ms: 2_000,
            max_conflict_retries: 3,
            ticket_number_prefix: "FS".to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn code_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.code_ttl_secs as i64)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
