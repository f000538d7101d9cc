use super::{Flag, Seq, Uid};

/// An IMAP [`FETCH` response](https://tools.ietf.org/html/rfc3501#section-7.4.2) that contains
/// data about a particular message. This response occurs as the result of a `FETCH` or `STORE`
/// command, as well as by unilateral server decision (e.g., flag updates made by another client).
///
/// A reply to a `UID` command always carries the UID, so a `Fetch` without one is unsolicited.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fetch {
    /// The ordinal number of this message in its containing mailbox.
    pub message: Seq,

    /// A number expressing the unique identifier of the message.
    pub uid: Option<Uid>,

    /// A number expressing the [RFC-2822](https://tools.ietf.org/html/rfc2822) size of the
    /// message.
    pub size: Option<u32>,

    pub(crate) flags: Option<Vec<Flag>>,
    pub(crate) body: Option<Vec<u8>>,
}

impl Fetch {
    /// A list of flags that are set for this message, if `FLAGS` was part of the response.
    pub fn flags(&self) -> Option<&[Flag]> {
        self.flags.as_deref()
    }

    /// Whether the response reported `flag` as set. `None` when no flag list was sent.
    pub fn has_flag(&self, flag: &Flag) -> Option<bool> {
        self.flags.as_ref().map(|flags| flags.contains(flag))
    }

    /// The full message, if `BODY[]` or `RFC822` was part of the response.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Take the message body out of the response.
    pub fn take_body(&mut self) -> Option<Vec<u8>> {
        self.body.take()
    }
}
