//! Request lifecycle states and the transition table.
//!
//! # State Transition Diagram
//!
//! ```text
//! create() → Created ──┬── attempt_resolve() = [] ──→ Assigned ── start ─→ InProgress ──┐
//!                      └── attempt_resolve() = [..] → Reported ─ children done ─→ Assigned│
//!                                                                                          │
//!   Assigned | InProgress ──┬── resolve ──→ Completed (terminal)                          │
//!                           └── overrule ─→ Overruled ─→ Created (re-resolution) ←────────┘
//!
//!   any live state ──┬── external delivery ─→ Received  (terminal)
//!                    └── withdraw ──────────→ Cancelled (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a request inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Registered, no resolver chosen yet
    Created,
    /// A resolver reported prerequisites; waiting on child requests
    Reported,
    /// A resolver accepted the request and is working it
    Assigned,
    /// The resolver started externally observable work
    InProgress,
    /// The resolver fulfilled the request
    Completed,
    /// Fulfilled directly by an external actor, bypassing the resolver
    Received,
    /// Withdrawn by the requester or by cleanup
    Cancelled,
    /// Taken away from its resolver; re-enters resolution
    Overruled,
}

impl RequestState {
    pub const ALL: [RequestState; 8] = [
        RequestState::Created,
        RequestState::Reported,
        RequestState::Assigned,
        RequestState::InProgress,
        RequestState::Completed,
        RequestState::Received,
        RequestState::Cancelled,
        RequestState::Overruled,
    ];

    /// Convert to the persisted string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RequestState::Created => "Created",
            RequestState::Reported => "Reported",
            RequestState::Assigned => "Assigned",
            RequestState::InProgress => "InProgress",
            RequestState::Completed => "Completed",
            RequestState::Received => "Received",
            RequestState::Cancelled => "Cancelled",
            RequestState::Overruled => "Overruled",
        }
    }

    /// Parse from the persisted string representation.
    pub fn from_db_str(s: &str) -> Result<Self, RequestStateParseError> {
        match s.to_lowercase().as_str() {
            "created" => Ok(RequestState::Created),
            "reported" => Ok(RequestState::Reported),
            "assigned" => Ok(RequestState::Assigned),
            "inprogress" | "in_progress" | "in-progress" => Ok(RequestState::InProgress),
            "completed" | "complete" => Ok(RequestState::Completed),
            "received" => Ok(RequestState::Received),
            "cancelled" | "canceled" => Ok(RequestState::Cancelled),
            "overruled" => Ok(RequestState::Overruled),
            _ => Err(RequestStateParseError(s.to_string())),
        }
    }

    /// Terminal states remove the request from the manager's index once
    /// notifications have been dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Received | RequestState::Cancelled
        )
    }

    /// States in which a resolver is bound to the request.
    pub fn has_resolver(&self) -> bool {
        matches!(
            self,
            RequestState::Reported | RequestState::Assigned | RequestState::InProgress
        )
    }

    /// Whether a caller outside the resolution algorithm may request this
    /// state through `update_request_state`.
    pub fn is_externally_drivable(&self) -> bool {
        matches!(
            self,
            RequestState::InProgress
                | RequestState::Completed
                | RequestState::Received
                | RequestState::Cancelled
                | RequestState::Overruled
        )
    }

    /// The full transition table, including transitions only the resolution
    /// algorithm performs.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Created, Reported | Assigned | Received | Cancelled) => true,
            (Reported, Assigned | Received | Cancelled | Overruled) => true,
            (Assigned, InProgress | Completed | Received | Cancelled | Overruled) => true,
            (InProgress, Completed | Received | Cancelled | Overruled) => true,
            (Overruled, Created | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for RequestState {
    type Err = RequestStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid request state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStateParseError(pub String);

impl fmt::Display for RequestStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid request state: {}", self.0)
    }
}

impl std::error::Error for RequestStateParseError {}
