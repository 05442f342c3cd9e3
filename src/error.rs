//! Error taxonomy shared by the session manager, the recording orchestrator
//! and the messaging server.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the boundary layer (HTTP handlers, command channel)
#[derive(Debug, Error)]
pub enum Error {
    #[error("Recording with name \"{name}\" already exists")]
    NameCollision { name: String },

    #[error("{what} \"{name}\" not found")]
    NotFound { what: &'static str, name: String },

    #[error("No template \"{name}\" found with type {template_type}")]
    UnknownTemplate { name: String, template_type: String },

    #[error("Connection to target {target} unavailable: {reason}")]
    ConnectionUnavailable { target: String, reason: String },

    #[error("Recording could not be saved: {destination} already exists and rename attempts were exhausted")]
    DestinationExhausted { destination: String },

    #[error("Invalid subprotocol \"{0}\"")]
    AuthenticationFailure(String),

    #[error("Invalid recording options: {0}")]
    InvalidOptions(String),

    #[error("Malformed event template: {0}")]
    MalformedTemplate(String),

    #[error("Rule with name \"{name}\" already exists")]
    RuleExists { name: String },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Task against target {target} exceeded its lease of {seconds}s")]
    LeaseTimeout { target: String, seconds: u64 },

    /// The agent session failed mid-task and must not be reused
    #[error("Session to target {target} lost: {reason}")]
    SessionLost { target: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Error::Internal(message.to_string())
    }

    /// Whether the session that produced this error is no longer usable
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::SessionLost { .. } | Error::LeaseTimeout { .. })
    }

    /// HTTP status the boundary layer reports for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::NameCollision { .. }
            | Error::InvalidOptions(_)
            | Error::MalformedTemplate(_)
            | Error::InvalidRule(_)
            | Error::UnknownTemplate { .. } => 400,
            Error::RuleExists { .. } => 409,
            Error::AuthenticationFailure(_) => 401,
            Error::ConnectionUnavailable { .. } | Error::SessionLost { .. } => 502,
            Error::LeaseTimeout { .. } => 504,
            Error::DestinationExhausted { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Internal(_) => 500,
        }
    }
}
