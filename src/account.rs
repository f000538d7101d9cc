//! Server accounts.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// The host GMail serves IMAP on. Accounts on it delete by moving mail into the trash folder.
pub const GMAIL_HOST: &str = "imap.gmail.com";

/// The folder GMail keeps deleted mail in.
pub const GMAIL_TRASH: &str = "[Gmail]/Trash";

/// How the socket to the server is secured.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Plain TCP, no encryption at all.
    Plain,
    /// TLS from the first byte (IMAPS).
    #[default]
    Ssl,
    /// Plain TCP upgraded with `STARTTLS` before authentication.
    StartTls,
}

impl ConnectionMode {
    /// The well-known port for this mode.
    pub fn default_port(self) -> u16 {
        match self {
            ConnectionMode::Ssl => 993,
            ConnectionMode::Plain | ConnectionMode::StartTls => 143,
        }
    }

    /// Whether credentials sent over a socket in this mode are protected.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, ConnectionMode::Plain)
    }
}

/// Which authentication paths an account may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Permit the `LOGIN` command when `CRAM-MD5` is not offered.
    pub allow_login: bool,
    /// Permit `LOGIN` over a connection that is not encrypted.
    pub allow_plain: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        AuthPolicy {
            allow_login: true,
            allow_plain: false,
        }
    }
}

/// A resolved credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wrap a password. Only the first line is kept, as passwords cannot contain newlines.
    pub fn new(password: impl Into<String>) -> Self {
        let mut password = password.into();
        if let Some(end) = password.find(['\r', '\n']) {
            password.truncate(end);
        }
        Password(password)
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Everything needed to open and authenticate one session.
///
/// Accounts are built once, before any connection is made, and are never changed afterwards.
#[derive(Clone, Debug)]
pub struct Account {
    /// Server host name, also used for TLS certificate verification.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Transport security.
    pub mode: ConnectionMode,
    /// Applied to connecting and to every socket read and write.
    pub timeout: Duration,
    /// User name.
    pub user: String,
    /// The user's password.
    pub password: Password,
    /// Allowed authentication paths.
    pub auth: AuthPolicy,
}

impl Account {
    /// An account with the default port for `mode`, a 60 second timeout and the default
    /// authentication policy.
    pub fn new(
        host: impl Into<String>,
        mode: ConnectionMode,
        user: impl Into<String>,
        password: Password,
    ) -> Self {
        Account {
            host: host.into(),
            port: mode.default_port(),
            mode,
            timeout: Duration::from_secs(60),
            user: user.into(),
            password,
            auth: AuthPolicy::default(),
        }
    }

    /// `user@host:port`, the label reports use for this account.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Whether this account lives on GMail.
    pub fn is_gmail(&self) -> bool {
        self.host.eq_ignore_ascii_case(GMAIL_HOST)
    }
}
