//! Error types for quartermaster operations

use crate::{RequestState, Token, TypeTag};
use thiserror::Error;

/// Type registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown type: no factory bound for {tag}")]
    UnknownType { tag: String },

    #[error("Duplicate registration: a factory is already bound for {tag}")]
    DuplicateRegistration { tag: TypeTag },

    #[error("Type mismatch for {tag}: expected {expected}")]
    TypeMismatch { tag: String, expected: &'static str },

    #[error("Invalid factory input for {tag}: expected {expected}")]
    InvalidFactoryInput { tag: TypeTag, expected: &'static str },

    #[error("Malformed document at {field}: {reason}")]
    MalformedDocument { field: String, reason: String },
}

/// Request graph and state machine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request not found: {token}")]
    NotFound { token: Token },

    #[error("Illegal state transition for request {token}: {from} -> {to}")]
    IllegalStateTransition {
        token: Token,
        from: RequestState,
        to: RequestState,
    },

    #[error("Cycle detected linking child {child} under request {parent}")]
    CycleDetected { parent: Token, child: Token },

    #[error("Requester not registered: {requester}")]
    UnknownRequester { requester: Token },

    #[error("Provider already registered: {provider}")]
    ProviderAlreadyRegistered { provider: Token },

    #[error("Provider not registered: {provider}")]
    ProviderNotRegistered { provider: Token },

    #[error("Resolver {resolver} is already registered")]
    DuplicateResolver { resolver: Token },

    #[error("Cannot load into a manager holding {live} live requests")]
    LoadIntoLiveManager { live: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    ParseFailed { reason: String },
}

/// Failure raised from inside a resolver's `attempt_resolve` or `resolve`.
///
/// The manager catches these at the call boundary, logs them, and moves on to
/// the next candidate. They never reach the requester. Panics are not faults:
/// they unwind through the manager like any other panic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Resolver fault: {reason}")]
pub struct ResolverFault {
    pub reason: String,
}

impl ResolverFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<QuartermasterError> for ResolverFault {
    fn from(err: QuartermasterError) -> Self {
        ResolverFault::new(err.to_string())
    }
}

/// Master error type for all quartermaster errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuartermasterError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for quartermaster operations.
pub type QuartermasterResult<T> = Result<T, QuartermasterError>;

// =============================================================================
// TESTS
// =============================================================================
