//! Ticket states, actor roles and priorities.
//!
//! Records in storage carry these as strings; the engine parses them back
//! with [`FromStr`] and writes them with [`as_str`](TicketState::as_str).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A name that does not belong to the vocabulary it was parsed against.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownName {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    #[serde(alias = "pending")]
    New,
    Assigned,
    Scheduled,
    OnRoute,
    Arrived,
    Inspecting,
    Diagnosed,
    Repairing,
    WaitingParts,
    PickupDevice,
    InWorkshop,
    ReadyDelivery,
    Completed,
    NotFixed,
    Cancelled,
}

impl TicketState {
    pub const INITIAL: TicketState = TicketState::New;

    pub const ALL: [TicketState; 15] = [
        TicketState::New,
        TicketState::Assigned,
        TicketState::Scheduled,
        TicketState::OnRoute,
        TicketState::Arrived,
        TicketState::Inspecting,
        TicketState::Diagnosed,
        TicketState::Repairing,
        TicketState::WaitingParts,
        TicketState::PickupDevice,
        TicketState::InWorkshop,
        TicketState::ReadyDelivery,
        TicketState::Completed,
        TicketState::NotFixed,
        TicketState::Cancelled,
    ];

    pub const TERMINAL: [TicketState; 3] = [
        TicketState::Completed,
        TicketState::NotFixed,
        TicketState::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketState::New => "new",
            TicketState::Assigned => "assigned",
            TicketState::Scheduled => "scheduled",
            TicketState::OnRoute => "on_route",
            TicketState::Arrived => "arrived",
            TicketState::Inspecting => "inspecting",
            TicketState::Diagnosed => "diagnosed",
            TicketState::Repairing => "repairing",
            TicketState::WaitingParts => "waiting_parts",
            TicketState::PickupDevice => "pickup_device",
            TicketState::InWorkshop => "in_workshop",
            TicketState::ReadyDelivery => "ready_delivery",
            TicketState::Completed => "completed",
            TicketState::NotFixed => "not_fixed",
            TicketState::Cancelled => "cancelled",
        }
    }

    /// Whether this state ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketState {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `pending` is the task vocabulary's name for the intake state.
        if s == "pending" {
            return Ok(TicketState::New);
        }
        TicketState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "state",
                value: s.to_string(),
            })
    }
}

/// Role of the actor performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Technician,
    Supervisor,
    Admin,
    Workshop,
    /// Customer-facing automation (intake forms, scheduled jobs).
    System,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Technician,
        Role::Supervisor,
        Role::Admin,
        Role::Workshop,
        Role::System,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Technician => "technician",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
            Role::Workshop => "workshop",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "role",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip_through_from_str() {
        for state in TicketState::ALL {
            assert_eq!(state.as_str().parse::<TicketState>(), Ok(state));
        }
    }

    #[test]
    fn pending_is_an_alias_for_new() {
        assert_eq!("pending".parse::<TicketState>(), Ok(TicketState::New));
        let parsed: TicketState = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(parsed, TicketState::New);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"new\"");
    }

    #[test]
    fn serde_names_match_as_str() {
        for state in TicketState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        for role in Role::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{}\"", role.as_str()));
        }
    }

    #[test]
    fn only_three_terminal_states() {
        let terminal: Vec<_> = TicketState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                TicketState::Completed,
                TicketState::NotFixed,
                TicketState::Cancelled
            ]
        );
    }

    #[test]
    fn unknown_role_rejected() {
        let err = "customer".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "role");
        assert_eq!(err.to_string(), "unknown role 'customer'");
    }
}
