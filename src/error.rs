//! Error types for the WebSocket client engine
//!
//! Two layers:
//! - [`Error`]: codec and transport failures, returned through [`Result`]
//! - [`ConnectionError`]: the record a [`Connection`](crate::Connection) keeps
//!   as its last error, readable by the application at any time

use std::fmt;
use std::io;

/// Result type alias for codec and transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Codec / transport error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket
    Io(io::Error),
    /// Malformed WebSocket frame
    InvalidFrame(&'static str),
    /// Frame carried an opcode outside RFC 6455
    UnknownOpcode(u8),
    /// Frame length exceeds what the decoder supports
    FrameTooLarge,
    /// Malformed HTTP in the upgrade exchange
    InvalidHttp(&'static str),
    /// Upgrade response rejected
    HandshakeFailed(&'static str),
    /// Nothing available within the read timeout
    WouldBlock,
    /// Peer closed the stream
    ConnectionClosed,
    /// Connection reset by peer
    ConnectionReset,
    /// Operation not valid in the current state
    InvalidState(&'static str),
    /// TLS setup failure
    Tls(String),
}

impl Error {
    /// Raw OS error code, when this error came from the socket layer
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::UnknownOpcode(op) => write!(f, "Unknown opcode: {:#x}", op),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::WouldBlock => write!(f, "Would block"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::ConnectionReset => write!(f, "Connection reset by peer"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Tls(msg) => write!(f, "TLS error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

/// Category of a connection-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A required connection field was absent at `connect()`
    MissingParameter,
    /// The upgrade request could not be written
    HandshakeSendFailed,
    /// The upgrade response was not a 101 with an accept key
    HandshakeParseFailed,
    /// A read or write on the established connection failed
    SocketReadWriteFailed,
    /// The connect retry budget was exhausted
    ConnectToHostFailed,
    /// The peer sent a Close frame
    ConnectionClosedByPeer,
    /// The peer sent something the decoder could not accept
    ProtocolError,
    /// No pong arrived within the configured timeout
    PongTimeout,
    /// Request not valid in the current lifecycle state
    InvalidState,
}

impl ErrorCode {
    /// Stable numeric value (1-based, 0 is reserved for "no error")
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::MissingParameter => 1,
            ErrorCode::HandshakeSendFailed => 2,
            ErrorCode::HandshakeParseFailed => 3,
            ErrorCode::SocketReadWriteFailed => 4,
            ErrorCode::ConnectToHostFailed => 5,
            ErrorCode::ConnectionClosedByPeer => 6,
            ErrorCode::ProtocolError => 7,
            ErrorCode::PongTimeout => 8,
            ErrorCode::InvalidState => 9,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::MissingParameter => "missing parameter",
            ErrorCode::HandshakeSendFailed => "handshake send failed",
            ErrorCode::HandshakeParseFailed => "handshake parse failed",
            ErrorCode::SocketReadWriteFailed => "socket read/write failed",
            ErrorCode::ConnectToHostFailed => "connect to host failed",
            ErrorCode::ConnectionClosedByPeer => "connection closed by peer",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::PongTimeout => "pong timeout",
            ErrorCode::InvalidState => "invalid state",
        };
        f.write_str(name)
    }
}

/// Last error recorded on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    code: ErrorCode,
    description: String,
    transport_code: Option<i32>,
}

impl ConnectionError {
    /// Create an error with a description
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            transport_code: None,
        }
    }

    /// Create an error from a codec/transport failure, keeping its OS code
    pub fn from_error(code: ErrorCode, err: &Error) -> Self {
        Self {
            code,
            description: err.to_string(),
            transport_code: err.os_code(),
        }
    }

    /// Replace the category, keeping description and transport code
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Underlying OS error code, if the failure came from the socket
    pub fn transport_code(&self) -> Option<i32> {
        self.transport_code
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)?;
        if let Some(code) = self.transport_code {
            write!(f, " (os error {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(e, Error::WouldBlock));

        let e: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(e, Error::ConnectionClosed));

        let e: Error = io::Error::from_raw_os_error(111).into();
        assert_eq!(e.os_code(), Some(111));
    }

    #[test]
    fn test_connection_error_keeps_transport_code() {
        let io_err = Error::Io(io::Error::from_raw_os_error(32));
        let err = ConnectionError::from_error(ErrorCode::SocketReadWriteFailed, &io_err);
        assert_eq!(err.code(), ErrorCode::SocketReadWriteFailed);
        assert_eq!(err.transport_code(), Some(32));

        let err = err.with_code(ErrorCode::HandshakeSendFailed);
        assert_eq!(err.code(), ErrorCode::HandshakeSendFailed);
        assert_eq!(err.transport_code(), Some(32));
    }

    #[test]
    fn test_display() {
        let err = ConnectionError::new(ErrorCode::MissingParameter, "No URL host provided");
        assert_eq!(err.to_string(), "missing parameter: No URL host provided");
        assert_eq!(ErrorCode::ConnectionClosedByPeer.as_i32(), 6);
    }
}
