//! Errors surfaced by the transports and transaction engines.
use crate::protocol as proto;

/// Represents all possible failures of a serial exchange.
///
/// Connection failures ([`Error::NotConnected`], [`Error::TransportIo`]) and
/// protocol failures ([`Error::RetryExhausted`]) are distinct so callers can
/// pick a different recovery (reconnect vs. abandon the request).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport holds no open line.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The serial device failed while the line was open. The transport has
    /// already closed itself when this is returned.
    #[error("Transport I/O error on {name}: {source}")]
    TransportIo {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The link was up but no usable reply arrived within the retry budget.
    #[error("No response received after {attempts} attempt(s)")]
    RetryExhausted { attempts: u32 },

    /// Wraps `proto::Error`.
    #[error(transparent)]
    Parameter(#[from] proto::Error),
}

impl Error {
    /// Returns `true` for failures of the connection itself, as opposed to a
    /// device that did not answer.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::NotConnected(_) | Error::TransportIo { .. })
    }
}

/// The result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_distinct() {
        assert!(Error::NotConnected("comm".into()).is_connection_error());
        assert!(Error::TransportIo {
            name: "comm".into(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        }
        .is_connection_error());
        assert!(!Error::RetryExhausted { attempts: 3 }.is_connection_error());
        assert!(!Error::from(proto::Error::BaudRateZero).is_connection_error());
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::RetryExhausted { attempts: 3 }.to_string(),
            "No response received after 3 attempt(s)"
        );
        assert_eq!(
            Error::from(proto::Error::BaudRateZero).to_string(),
            "Baud rate must be greater than zero"
        );
    }
}
