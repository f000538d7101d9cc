//! Detecting other IMAP clients changing messages under us.
//!
//! Between a `SEARCH` and the `STORE` that follows it another client (a webmail session, a second
//! instance of this tool) can change or remove the messages we selected. Every metadata `FETCH`
//! and every `STORE` reply is cross-checked against what the search implied; any mismatch raises
//! the session's [`ConflictFlag`], after which no destructive action runs in the affected folder
//! for the rest of the session.

use std::collections::HashSet;

use log::warn;

use crate::batch::StoreOp;
use crate::filter::{FlaggedState, MessageFilter, SeenState};
use crate::types::{Fetch, Flag, Uid};

/// Set once another client has been seen acting in parallel with us. Never cleared.
///
/// Each observation remembers the folder that was selected when it was made, so destructive
/// actions can be refused in exactly the folders where the race was seen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictFlag {
    reasons: Vec<(Option<String>, String)>,
}

impl ConflictFlag {
    /// Whether a conflict has been detected anywhere in the session.
    pub fn is_raised(&self) -> bool {
        !self.reasons.is_empty()
    }

    /// Whether a conflict was detected while `folder` was selected, or while no folder was.
    pub fn is_raised_in(&self, folder: &str) -> bool {
        self.reasons
            .iter()
            .any(|(f, _)| f.as_deref().map_or(true, |f| f == folder))
    }

    /// Raise the flag.
    pub fn raise(&mut self, folder: Option<&str>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            "another IMAP client is performing potentially conflicting actions in parallel with us: {}",
            reason
        );
        self.reasons.push((folder.map(str::to_string), reason));
    }

    /// What was observed, in order.
    pub fn reasons(&self) -> impl Iterator<Item = &str> {
        self.reasons.iter().map(|(_, r)| r.as_str())
    }

    /// One report line per observation, naming the folder it was made in.
    pub fn lines(&self) -> Vec<String> {
        self.reasons
            .iter()
            .map(|(folder, reason)| match folder {
                Some(folder) => format!("conflict in `{}`: {}", folder, reason),
                None => format!("conflict: {}", reason),
            })
            .collect()
    }
}

/// The result of checking a metadata `FETCH` against the batch it was issued for.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MetadataCheck {
    /// UID and size of every requested message that came back, in request order.
    pub sizes: Vec<(Uid, u32)>,
    /// Requested UIDs the server returned nothing usable for.
    pub missing: Vec<Uid>,
    /// Observations that indicate a conflict.
    pub conflicts: Vec<String>,
}

/// Cross-check the reply to `UID FETCH <requested> (UID RFC822.SIZE FLAGS)`.
///
/// Messages whose flags no longer match `filter` are still returned in `sizes`: they were matched
/// by our search and delivering them is never wrong, but their state changed under us.
pub fn check_metadata(filter: &MessageFilter, requested: &[Uid], fetches: &[Fetch]) -> MetadataCheck {
    let wanted: HashSet<Uid> = requested.iter().copied().collect();
    let mut found = std::collections::HashMap::new();
    let mut check = MetadataCheck::default();

    for fetch in fetches {
        let (uid, size) = match (fetch.uid, fetch.size) {
            (Some(uid), Some(size)) => (uid, size),
            _ => {
                check.conflicts.push(format!(
                    "FETCH response #{} without UID and RFC822.SIZE: {:?}",
                    fetch.message, fetch
                ));
                continue;
            }
        };
        if !wanted.contains(&uid) {
            check
                .conflicts
                .push(format!("FETCH returned UID {} which was not requested", uid));
            continue;
        }
        if let Some(reason) = flags_contradict(filter, uid, fetch) {
            check.conflicts.push(reason);
        }
        found.entry(uid).or_insert(size);
    }

    for &uid in requested {
        match found.remove(&uid) {
            Some(size) => check.sizes.push((uid, size)),
            None => check.missing.push(uid),
        }
    }
    if !check.missing.is_empty() {
        check.conflicts.push(format!(
            "FETCH did not return {} of the requested messages",
            check.missing.len()
        ));
    }
    check
}

fn flags_contradict(filter: &MessageFilter, uid: Uid, fetch: &Fetch) -> Option<String> {
    let seen = fetch.has_flag(&Flag::Seen)?;
    let flagged = fetch.has_flag(&Flag::Flagged)?;
    let bad_seen = match filter.seen {
        SeenState::Any => false,
        SeenState::Seen => !seen,
        SeenState::Unseen => seen,
    };
    let bad_flagged = match filter.flagged {
        FlaggedState::Any => false,
        FlaggedState::Flagged => !flagged,
        FlaggedState::Unflagged => flagged,
    };
    if bad_seen || bad_flagged {
        Some(format!(
            "UID {} changed flags since it was searched: {:?}",
            uid,
            fetch.flags().unwrap_or(&[])
        ))
    } else {
        None
    }
}

/// Cross-check the `FETCH` responses a `UID STORE <batch> <op>` produced.
///
/// Silent stores make the server omit echoes of our own change, so whatever does come back is
/// either an echo that must agree with `op`, or news of someone else's change.
pub fn check_store(op: StoreOp, batch: &[Uid], fetches: &[Fetch]) -> Vec<String> {
    let mut conflicts = Vec::new();
    for fetch in fetches {
        let uid = match fetch.uid {
            Some(uid) => uid,
            None => {
                conflicts.push(format!(
                    "unsolicited FETCH for message #{} during STORE: {:?}",
                    fetch.message,
                    fetch.flags().unwrap_or(&[])
                ));
                continue;
            }
        };
        if !batch.contains(&uid) {
            conflicts.push(format!("STORE reported on UID {} outside its batch", uid));
            continue;
        }
        if let Some((flag, set)) = op.resulting_flag() {
            if let Some(has) = fetch.has_flag(&flag) {
                if has != set {
                    conflicts.push(format!(
                        "STORE {} on UID {} was undone, flags are now {:?}",
                        op,
                        uid,
                        fetch.flags().unwrap_or(&[])
                    ));
                }
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(message: u32, uid: Option<Uid>, size: Option<u32>, flags: &[Flag]) -> Fetch {
        Fetch {
            message,
            uid,
            size,
            flags: Some(flags.to_vec()),
            body: None,
        }
    }

    #[test]
    fn flag_is_monotonic() {
        let mut flag = ConflictFlag::default();
        assert!(!flag.is_raised());
        flag.raise(Some("INBOX"), "one");
        assert!(flag.is_raised());
        assert!(!flag.is_raised_in("[Gmail]/Trash"));
        flag.raise(None, "two");
        assert!(flag.is_raised_in("INBOX"));
        assert!(flag.is_raised_in("[Gmail]/Trash"));
        assert_eq!(flag.reasons().collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(flag.lines(), vec!["conflict in `INBOX`: one", "conflict: two"]);
    }

    #[test]
    fn clean_metadata() {
        let fetches = vec![
            fetch(1, Some(10), Some(100), &[]),
            fetch(2, Some(11), Some(200), &[Flag::Answered]),
        ];
        let check = check_metadata(&MessageFilter::unseen(), &[10, 11], &fetches);
        assert_eq!(check.sizes, vec![(10, 100), (11, 200)]);
        assert!(check.missing.is_empty());
        assert!(check.conflicts.is_empty());
    }

    #[test]
    fn seen_under_unseen_filter_is_a_conflict() {
        let fetches = vec![fetch(1, Some(10), Some(100), &[Flag::Seen])];
        let check = check_metadata(&MessageFilter::unseen(), &[10], &fetches);
        assert_eq!(check.sizes, vec![(10, 100)]);
        assert_eq!(check.conflicts.len(), 1);
    }

    #[test]
    fn vanished_and_foreign_messages() {
        let fetches = vec![
            fetch(1, Some(10), Some(100), &[]),
            fetch(2, Some(99), Some(5), &[]),
            fetch(3, None, None, &[Flag::Seen]),
        ];
        let check = check_metadata(&MessageFilter::default(), &[10, 11], &fetches);
        assert_eq!(check.sizes, vec![(10, 100)]);
        assert_eq!(check.missing, vec![11]);
        assert_eq!(check.conflicts.len(), 3);
    }

    #[test]
    fn store_echoes() {
        let ok = vec![fetch(1, Some(10), None, &[Flag::Seen])];
        assert!(check_store(StoreOp::AddSeen, &[10], &ok).is_empty());

        let undone = vec![fetch(1, Some(10), None, &[])];
        assert_eq!(check_store(StoreOp::AddSeen, &[10], &undone).len(), 1);

        let foreign = vec![fetch(4, None, None, &[Flag::Deleted])];
        assert_eq!(check_store(StoreOp::AddSeen, &[10], &foreign).len(), 1);

        let trash = vec![fetch(1, Some(10), None, &[])];
        assert!(check_store(StoreOp::GmailTrash, &[10], &trash).is_empty());
    }
}
