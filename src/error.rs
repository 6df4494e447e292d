use std::fmt;
use std::io;

#[derive(Debug)]
pub enum CoordError {
    InvalidArgument(String),
    Io(io::Error),
    TransportUnavailable(String),
    ConnectionFailed(String),
    PeerNotFound(String),
    DuplicatePeerName(String),
    SendQueueFull,
    MessageTooLarge(u32),
    Serialization(postcard::Error),
    Json(serde_json::Error),
    VersionMismatch { expected: u16, got: u16 },
    HandshakeFailed(String),
    HandshakeTimeout,
    Timeout { operation: String, elapsed_ms: u64 },
    Cancelled,
    GroupNotFound(String),
    GroupSetNotFound(String),
}

impl CoordError {
    /// Failures that must stop a process before it enters its run loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_) | Self::DuplicatePeerName(_))
    }
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::TransportUnavailable(msg) => write!(f, "transport unavailable: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            Self::PeerNotFound(name) => write!(f, "peer not found: {name}"),
            Self::DuplicatePeerName(name) => write!(f, "duplicate peer name: {name}"),
            Self::SendQueueFull => write!(f, "send queue full"),
            Self::MessageTooLarge(size) => write!(f, "message too large: {size} bytes"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "version mismatch: expected {expected}, got {got}")
            }
            Self::HandshakeFailed(msg) => write!(f, "handshake failed: {msg}"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::Timeout {
                operation,
                elapsed_ms,
            } => write!(f, "{operation} timed out after {elapsed_ms} ms"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::GroupNotFound(name) => write!(f, "group not found: {name}"),
            Self::GroupSetNotFound(name) => write!(f, "group set not found: {name}"),
        }
    }
}

impl std::error::Error for CoordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CoordError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<postcard::Error> for CoordError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization(err)
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CoordError::SendQueueFull.to_string(), "send queue full");
        assert_eq!(CoordError::HandshakeTimeout.to_string(), "handshake timeout");
        assert_eq!(CoordError::Cancelled.to_string(), "cancelled");

        let err = CoordError::GroupNotFound("raid1".into());
        assert!(err.to_string().contains("raid1"));

        let err = CoordError::Timeout {
            operation: "group query for Ghost".into(),
            elapsed_ms: 2000,
        };
        assert_eq!(err.to_string(), "group query for Ghost timed out after 2000 ms");

        let err = CoordError::VersionMismatch {
            expected: 1,
            got: 2,
        };
        let s = err.to_string();
        assert!(s.contains('1') && s.contains('2'));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoordError::TransportUnavailable("bind".into()).is_fatal());
        assert!(CoordError::DuplicatePeerName("bob".into()).is_fatal());
        assert!(!CoordError::Cancelled.is_fatal());
        assert!(!CoordError::GroupSetNotFound("x".into()).is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: CoordError = io_err.into();
        assert!(matches!(err, CoordError::Io(_)));
    }

    #[test]
    fn test_error_from_postcard() {
        let err: CoordError = postcard::Error::DeserializeBadVarint.into();
        assert!(matches!(err, CoordError::Serialization(_)));
    }

    #[test]
    fn test_error_source() {
        use std::error::Error;

        let io_err = CoordError::Io(io::Error::new(io::ErrorKind::Other, "test"));
        assert!(io_err.source().is_some());

        let ser_err = CoordError::Serialization(postcard::Error::DeserializeBadVarint);
        assert!(ser_err.source().is_some());

        let json_err: CoordError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(json_err.source().is_some());

        assert!(CoordError::SendQueueFull.source().is_none());
    }
}
