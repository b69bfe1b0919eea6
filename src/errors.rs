//! Error types for the sFAB fabric

use std::time::Duration;

use thiserror::Error;

/// Main error type for fabric operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No connection is registered under the given identity
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// The agent is registered, but its key has no authorized disposition
    #[error("agent not authorized: {0}")]
    AgentNotAuthorized(String),

    /// The agent's mailbox did not accept the message in time
    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    /// Underlying SSH transport error
    #[error("transport failed: {0}")]
    Transport(#[from] russh::Error),

    /// The transport died while a command was mid-flight
    #[error("agent disconnected prematurely")]
    PrematureDisconnect,

    /// A required field was missing at listen/connect time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key parsing, generation, or encoding error
    #[error("key error: {0}")]
    Key(String),

    /// The hub presented a key this agent does not trust
    #[error("hub key not authorized for {0}")]
    HubNotAuthorized(String),

    /// The peer violated the fabric's protocol contract
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a key error with the given message
    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    /// Whether this error means the agent cannot take work right now,
    /// either because it is not connected or because its key is not
    /// authorized
    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, Self::AgentNotFound(_) | Self::AgentNotAuthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_unavailable_covers_both_directory_failures() {
        assert!(Error::AgentNotFound("bob@postgres.ql".into()).is_agent_unavailable());
        assert!(Error::AgentNotAuthorized("bob@postgres.ql".into()).is_agent_unavailable());
        assert!(!Error::PrematureDisconnect.is_agent_unavailable());
        assert!(!Error::DispatchTimeout(Duration::from_secs(5)).is_agent_unavailable());
    }

    #[test]
    fn test_error_messages_name_the_agent() {
        let err = Error::AgentNotFound("worker/3@test".into());
        assert!(err.to_string().contains("worker/3@test"));

        let err = Error::configuration("missing host key");
        assert!(err.to_string().contains("missing host key"));
    }
}
