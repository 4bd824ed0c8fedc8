use std::io;

use thiserror::Error;

use crate::framing::DecodeError;

/// Exit status classes. Each is a distinct bit so scripts can branch on the
/// failure class.
pub const EXIT_USAGE: u8 = 1;
pub const EXIT_TERMINAL: u8 = 1 << 1;
pub const EXIT_COMMAND: u8 = 1 << 2;
pub const EXIT_TLS: u8 = 1 << 3;
pub const EXIT_NETWORK: u8 = 1 << 4;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Usage(String),

    /// Malformed 4-byte size frame. The connection is discarded.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed tagged message. That stream's dispatch ends.
    #[error("protocol error: {0}")]
    Decode(DecodeError),

    /// Read or write failure on one viewer. The viewer is pruned.
    #[error("connection I/O error: {0}")]
    ConnectionIo(#[source] io::Error),

    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: i32, rows: i32 },

    /// Resize or raw-mode failure. Fatal to the whole session.
    #[error("{0}")]
    Terminal(String),

    #[error("could not start program {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ProxyError::Usage(_) => EXIT_USAGE,
            ProxyError::Terminal(_) | ProxyError::InvalidSize { .. } => EXIT_TERMINAL,
            ProxyError::Command { .. } => EXIT_COMMAND,
            ProxyError::Tls(_) => EXIT_TLS,
            ProxyError::Handshake(_)
            | ProxyError::Decode(_)
            | ProxyError::ConnectionIo(_)
            | ProxyError::Network(_) => EXIT_NETWORK,
        }
    }

    /// Whether this error must tear down the whole session rather than just
    /// the stream it was observed on.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ProxyError::Terminal(_))
    }
}

impl From<DecodeError> for ProxyError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(err) => ProxyError::ConnectionIo(err),
            other => ProxyError::Decode(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_bits() {
        let codes = [EXIT_USAGE, EXIT_TERMINAL, EXIT_COMMAND, EXIT_TLS, EXIT_NETWORK];
        for (i, a) in codes.iter().enumerate() {
            assert_eq!(a.count_ones(), 1, "{a} is not a single bit");
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(codes, [1, 2, 4, 8, 16]);
    }

    #[test]
    fn errors_map_to_their_class() {
        assert_eq!(ProxyError::Usage("x".into()).exit_code(), EXIT_USAGE);
        assert_eq!(ProxyError::Terminal("x".into()).exit_code(), EXIT_TERMINAL);
        let spawn = ProxyError::Command {
            command: "nope".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.exit_code(), EXIT_COMMAND);
        assert_eq!(ProxyError::Tls("x".into()).exit_code(), EXIT_TLS);
        assert_eq!(ProxyError::Network("x".into()).exit_code(), EXIT_NETWORK);
    }

    #[test]
    fn only_terminal_errors_are_session_fatal() {
        assert!(ProxyError::Terminal("ioctl".into()).is_session_fatal());
        assert!(!ProxyError::InvalidSize { cols: 0, rows: 0 }.is_session_fatal());
        assert!(!ProxyError::Handshake("short".into()).is_session_fatal());
        assert!(!ProxyError::ConnectionIo(io::Error::from(io::ErrorKind::BrokenPipe))
            .is_session_fatal());
    }

    #[test]
    fn decode_io_errors_become_connection_errors() {
        let err: ProxyError = DecodeError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).into();
        assert!(matches!(err, ProxyError::ConnectionIo(_)));

        let err: ProxyError = DecodeError::UnknownType(7).into();
        assert!(matches!(err, ProxyError::Decode(DecodeError::UnknownType(7))));
    }
}
