//! IMAP error types.

use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::result;
use std::string::FromUtf8Error;

use bufstream::IntoInnerError as BufError;
use thiserror::Error;

/// A convenience wrapper around `Result` for `imap_harvest::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while talking to an IMAP server or acting on its mail.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// DNS resolution or the TCP connection to the server failed.
    #[error("failed to connect to host {host} port {port}: {source}")]
    Connect {
        /// Host we tried to reach.
        host: String,
        /// Port we tried to reach.
        port: u16,
        /// The underlying socket error.
        #[source]
        source: IoError,
    },
    /// The TLS handshake or TLS setup failed.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// Authentication was refused, or no acceptable mechanism was available.
    #[error("{0}")]
    Auth(String),
    /// A `BAD` response from the IMAP server.
    #[error("IMAP {command} command failed: BAD {information}")]
    Bad {
        /// The command that was rejected.
        command: String,
        /// Explanation given by the server.
        information: String,
    },
    /// A `NO` response from the IMAP server.
    #[error("IMAP {command} command failed: NO {information}")]
    No {
        /// The command that was refused.
        command: String,
        /// Explanation given by the server.
        information: String,
    },
    /// Error parsing a server response.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Error validating input data.
    #[error(transparent)]
    Validate(#[from] ValidateError),
    /// The connection was terminated unexpectedly.
    #[error("connection lost")]
    ConnectionLost,
    /// A socket operation did not finish within the account's timeout.
    #[error("timed out waiting for the server")]
    Timeout,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error(transparent)]
    Io(IoError),
    /// A message could not be handed to its delivery target.
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// The run was interrupted.
    #[error("interrupted")]
    Cancelled,
    /// The run was aborted by a delivery failure under the paranoid policy.
    #[error("aborted: {0}")]
    Aborted(String),
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// A timestamp file used by a date filter could not be read or decoded.
    #[error("failed to decode a timestamp from the first line of {}", path.display())]
    Timestamp {
        /// The file that was read.
        path: PathBuf,
    },
}

impl Error {
    /// Whether this error is a transient I/O failure that the caller may retry at batch
    /// granularity.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Whether the connection can no longer be trusted to be in sync with the server after this
    /// error. Tagged `BAD`/`NO` responses leave the session usable; everything that happens below
    /// the protocol level does not.
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::Tls(_)
                | Error::Parse(_)
                | Error::ConnectionLost
                | Error::Timeout
                | Error::Io(_)
        )
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

impl<T> From<BufError<T>> for Error {
    fn from(err: BufError<T>) -> Error {
        IoError::from(err).into()
    }
}

/// An error occured while trying to parse a server response.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Indicates an error parsing the status response. Such as OK, NO, and BAD.
    #[error("unable to parse status response")]
    Invalid(Vec<u8>),
    /// The client received an unexpected response that did not belong to the issued command.
    #[error("unexpected response: {0}")]
    Unexpected(String),
    /// The client could not find or decode the server's authentication challenge.
    #[error("unable to parse authentication response: {0}")]
    Authentication(String),
    /// The client received data that was not UTF-8 encoded.
    #[error("unable to parse data ({0:?}) as UTF-8 text")]
    DataNotUtf8(Vec<u8>, #[source] FromUtf8Error),
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in an input
/// string.
#[derive(Debug, Error)]
#[error("invalid character in input: {0:?}")]
pub struct ValidateError(pub char);
