use std::fmt;

use super::Flag;

/// Meta-information about an IMAP mailbox, as returned by
/// [`SELECT`](https://tools.ietf.org/html/rfc3501#section-6.3.1).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Mailbox {
    /// Defined flags in the mailbox.
    pub flags: Vec<Flag>,

    /// The number of messages in the mailbox.
    pub exists: u32,

    /// The number of messages with the \Recent flag set.
    pub recent: u32,

    /// The next unique identifier value. If this is missing, the client can not make any
    /// assumptions about the next unique identifier value.
    pub uid_next: Option<u32>,

    /// The unique identifier validity value.
    pub uid_validity: Option<u32>,

    /// Whether the server opened the mailbox read-only.
    pub read_only: bool,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flags: {:?}, exists: {}, recent: {}, uid_next: {:?}, uid_validity: {:?}, read_only: {}",
            self.flags, self.exists, self.recent, self.uid_next, self.uid_validity, self.read_only
        )
    }
}
