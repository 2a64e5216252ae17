//! Error types for the buffer server.

use super::ConnectionId;
use crate::protocol::CodecError;

/// Errors raised by the buffer server and its connections.
#[derive(Debug, thiserror::Error)]
pub enum BufferServerError {
    /// A subscriber asked for a custom policy that is not registered.
    #[error("unknown distribution policy: '{0}'")]
    UnknownPolicy(String),

    /// The connection is closed and cannot accept more data.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// A frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            BufferServerError::UnknownPolicy("sticky".into()).to_string(),
            "unknown distribution policy: 'sticky'"
        );
        assert_eq!(
            BufferServerError::ConnectionClosed(7).to_string(),
            "connection 7 is closed"
        );
        assert_eq!(
            BufferServerError::from(CodecError::Truncated).to_string(),
            "codec error: truncated frame"
        );
    }
}
