use std::io;
use thiserror::Error;

/// Central error type for the staccato engine.
///
/// Request-level failures (bad syntax, missing files) never show up here: the
/// connection state machine turns them into HTTP responses. This type covers
/// what tears a connection down or stops the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rejected configuration (zero workers, missing document root, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer closed its half of the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The read buffer filled up before a complete request arrived.
    #[error("read buffer is full")]
    BufferFull,

    /// The socket accepted zero bytes of a non-empty write.
    #[error("socket accepted no bytes")]
    WriteZero,
}

impl ServerError {
    /// Errors a client causes by simply going away. Logged at debug level only.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::PeerClosed => true,
            ServerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_convert() {
        let err: ServerError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ServerError::Io(_)));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_display() {
        let err = ServerError::Config("workers must be >= 1".to_string());
        assert_eq!(err.to_string(), "invalid configuration: workers must be >= 1");
        assert!(!err.is_disconnect());
        assert!(ServerError::PeerClosed.is_disconnect());
    }
}
