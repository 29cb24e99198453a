use thiserror::Error;

/// Errors surfaced by the transport provider and the session manager.
///
/// Every variant carries owned strings so errors can be cloned into
/// `SessionEvent::Error` and compared in tests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid signaling endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("transport could not be opened: {0}")]
    Transport(String),

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("provider is bound to document `{bound}`, cannot connect to `{requested}`")]
    DocumentMismatch { bound: String, requested: String },

    #[error("document update rejected: {0}")]
    Document(String),

    #[error("malformed peer frame: {0}")]
    Protocol(String),

    #[error("presence state could not be published: {0}")]
    Presence(String),

    #[error("undo scope failure: {0}")]
    Undo(String),
}

impl SessionError {
    /// Whether the link survives this error: a bad frame or a failed local
    /// operation, as opposed to a transport or endpoint failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Document(_) | Self::Protocol(_) | Self::Presence(_) | Self::Undo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let error = SessionError::InvalidEndpoint {
            url: "http://relay.test".into(),
            reason: "unsupported scheme".into(),
        };
        assert_eq!(
            error.to_string(),
            "invalid signaling endpoint `http://relay.test`: unsupported scheme"
        );
        assert_eq!(
            SessionError::ReconnectExhausted { attempts: 5 }.to_string(),
            "reconnect gave up after 5 attempts"
        );
    }

    #[test]
    fn only_in_session_failures_are_recoverable() {
        assert!(SessionError::Protocol("bad frame".into()).is_recoverable());
        assert!(!SessionError::Transport("refused".into()).is_recoverable());
        assert!(!SessionError::ReconnectExhausted { attempts: 5 }.is_recoverable());
    }
}
