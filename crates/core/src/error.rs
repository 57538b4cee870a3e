use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Invalid TLS credentials: {0}")]
    Credentials(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Timeout")]
    Timeout,
}

impl CoreError {
    /// Whether the error came from the frame body rather than the connection.
    ///
    /// A decode error leaves the stream usable: the offending frame is
    /// dropped and reading continues.
    pub fn is_decode(&self) -> bool {
        matches!(self, CoreError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_decode() {
        let err = CoreError::Decode("unknown variant".to_string());
        assert_eq!(err.to_string(), "Decode error: unknown variant");
        assert!(err.is_decode());
    }

    #[test]
    fn test_error_display_credentials() {
        let err = CoreError::Credentials("/etc/decoynet/ca.pem: not found".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid TLS credentials: /etc/decoynet/ca.pem: not found"
        );
        assert!(!err.is_decode());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn test_error_display_timeout() {
        assert_eq!(CoreError::Timeout.to_string(), "Timeout");
    }
}
