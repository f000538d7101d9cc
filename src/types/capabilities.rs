use std::collections::hash_set::Iter;
use std::collections::HashSet;

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports.
/// The capability list will include the atom "IMAP4rev1".
///
/// A capability name which begins with `AUTH=` indicates that the server supports that particular
/// authentication mechanism. The `LOGINDISABLED` capability indicates that the `LOGIN` command is
/// disabled. Capability names are compared case-insensitively; they are stored upper-cased.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities(pub(crate) HashSet<String>);

impl Capabilities {
    /// Check if the server has the given capability.
    pub fn has_str(&self, s: &str) -> bool {
        self.0.contains(&s.to_ascii_uppercase())
    }

    /// Check if the server offers the given `AUTHENTICATE` mechanism.
    pub fn has_auth(&self, mechanism: &str) -> bool {
        self.has_str(&format!("AUTH={}", mechanism))
    }

    /// Iterate over all the server's capabilities
    pub fn iter(&self) -> Iter<'_, String> {
        self.0.iter()
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Capabilities(
            iter.into_iter()
                .map(|s| s.as_ref().to_ascii_uppercase())
                .collect(),
        )
    }
}
