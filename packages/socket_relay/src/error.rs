//! Relay error taxonomy. Every variant is handled where it occurs; none of them
//! stop the process.

use crate::transport::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The upstream TCP connection could not be established. Not retried.
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A write to the upstream link failed or the link is not connected.
    #[error("upstream write failed: {0}")]
    Write(String),

    /// The browser session has already closed.
    #[error("session {0} is closed")]
    SessionSend(SessionId),
}

impl RelayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connect { .. } => "connect_failed",
            Self::Write(_) => "write_failed",
            Self::SessionSend(_) => "session_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let connect = RelayError::Connect {
            addr: "localhost:6514".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(connect.error_code(), "connect_failed");
        assert_eq!(
            RelayError::Write("not connected".into()).error_code(),
            "write_failed"
        );
        assert_eq!(
            RelayError::SessionSend(SessionId::new()).error_code(),
            "session_closed"
        );
    }

    #[test]
    fn connect_error_names_the_address() {
        let err = RelayError::Connect {
            addr: "example.invalid:6514".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let msg = err.to_string();
        assert!(msg.contains("example.invalid:6514"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
