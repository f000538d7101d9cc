use std::fmt;

/// With the exception of [`Flag::Custom`], these flags are system flags that are pre-defined in
/// [RFC 3501 section 2.3.2](https://tools.ietf.org/html/rfc3501#section-2.3.2). All system flags
/// begin with `\` in the IMAP protocol.
///
/// Only `\Seen`, `\Flagged` and `\Deleted` are ever stored by this crate; the others are parsed
/// so that flag lists coming back from `FETCH` round-trip faithfully into conflict reports.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum Flag {
    /// Message has been read
    Seen,

    /// Message has been answered
    Answered,

    /// Message is "flagged" for urgent/special attention
    Flagged,

    /// Message is "deleted" for removal by later EXPUNGE
    Deleted,

    /// Message has not completed composition (marked as a draft).
    Draft,

    /// Message is "recently" arrived in this mailbox.
    Recent,

    /// The permanent flags of a mailbox can include this special flag (`\*`), which indicates
    /// that it is possible to create new keywords by attempting to store those flags.
    MayCreate,

    /// A non-standard user- or server-defined flag.
    Custom(String),
}

impl Flag {
    fn system(s: &str) -> Option<Self> {
        match s {
            "\\Seen" => Some(Flag::Seen),
            "\\Answered" => Some(Flag::Answered),
            "\\Flagged" => Some(Flag::Flagged),
            "\\Deleted" => Some(Flag::Deleted),
            "\\Draft" => Some(Flag::Draft),
            "\\Recent" => Some(Flag::Recent),
            "\\*" => Some(Flag::MayCreate),
            _ => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::MayCreate => write!(f, "\\*"),
            Flag::Custom(ref s) => write!(f, "{}", s),
        }
    }
}

impl From<String> for Flag {
    fn from(s: String) -> Self {
        Flag::system(&s).unwrap_or(Flag::Custom(s))
    }
}

impl<'a> From<&'a str> for Flag {
    fn from(s: &'a str) -> Self {
        Flag::system(s).unwrap_or_else(|| Flag::Custom(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_flags_roundtrip() {
        for name in ["\\Seen", "\\Flagged", "\\Deleted", "\\Answered", "\\Draft"] {
            assert_eq!(Flag::from(name).to_string(), name);
        }
        assert_eq!(Flag::from("\\Seen"), Flag::Seen);
    }

    #[test]
    fn keywords_are_custom() {
        assert_eq!(
            Flag::from("$Forwarded".to_string()),
            Flag::Custom("$Forwarded".to_string())
        );
    }
}
