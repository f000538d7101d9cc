//! Flag-changing actions: `mark` and the deletion state machine.
//!
//! Deletion takes one of three paths, chosen per folder before anything is sent:
//!
//! - `delete`: `selected -> flagged-deleted -> expunged`, expunging after every stored batch;
//! - `delete-noexpunge`: `selected -> flagged-deleted`, leaving the expunge to the server;
//! - `gmail-trash`: `selected -> moved-to-trash`, since GMail ignores `\Deleted` and `EXPUNGE`
//!   outside of its trash folder.

use std::fmt;
use std::io::{Read, Write};

use serde::Deserialize;

use crate::account::{Account, GMAIL_TRASH};
use crate::batch::{store, StoreOp, StoreOutcome};
use crate::cancel::CancelToken;
use crate::client::Session;
use crate::error::{Error, Result};
use crate::filter::{FlaggedState, MessageFilter, SeenState};
use crate::outcome::AccountReport;
use crate::types::Uid;

/// How `delete` gets rid of messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteMethod {
    /// `gmail-trash` on GMail outside of its trash folder, `delete` everywhere else.
    #[default]
    Auto,
    /// Flag `\Deleted`, then `EXPUNGE`.
    Delete,
    /// Flag `\Deleted` only.
    DeleteNoexpunge,
    /// Move to GMail's trash.
    GmailTrash,
}

impl DeleteMethod {
    /// The operation to use in `folder` of `account`.
    pub fn resolve(self, account: &Account, folder: &str) -> StoreOp {
        match self {
            DeleteMethod::Auto if account.is_gmail() && folder != GMAIL_TRASH => StoreOp::GmailTrash,
            DeleteMethod::Auto | DeleteMethod::Delete => StoreOp::Delete { expunge: true },
            DeleteMethod::DeleteNoexpunge => StoreOp::Delete { expunge: false },
            DeleteMethod::GmailTrash => StoreOp::GmailTrash,
        }
    }
}

impl fmt::Display for DeleteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeleteMethod::Auto => "auto",
            DeleteMethod::Delete => "delete",
            DeleteMethod::DeleteNoexpunge => "delete-noexpunge",
            DeleteMethod::GmailTrash => "gmail-trash",
        })
    }
}

/// The flag change a `mark` action applies.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MarkFlag {
    /// Set `\Seen`.
    Seen,
    /// Clear `\Seen`.
    Unseen,
    /// Set `\Flagged`.
    Flagged,
    /// Clear `\Flagged`.
    Unflagged,
}

impl MarkFlag {
    /// The `STORE` to issue.
    pub fn op(self) -> StoreOp {
        match self {
            MarkFlag::Seen => StoreOp::AddSeen,
            MarkFlag::Unseen => StoreOp::RemoveSeen,
            MarkFlag::Flagged => StoreOp::AddFlagged,
            MarkFlag::Unflagged => StoreOp::RemoveFlagged,
        }
    }

    /// Restrict `filter` to messages the mark would change, unless it already constrains flags.
    pub fn narrow(self, filter: &mut MessageFilter) {
        if filter.seen != SeenState::Any || filter.flagged != FlaggedState::Any {
            return;
        }
        match self {
            MarkFlag::Seen => filter.seen = SeenState::Unseen,
            MarkFlag::Unseen => filter.seen = SeenState::Seen,
            MarkFlag::Flagged => filter.flagged = FlaggedState::Unflagged,
            MarkFlag::Unflagged => filter.flagged = FlaggedState::Flagged,
        }
    }
}

/// Record `outcome` in `report`, handing back the error that must end the account's session,
/// if any.
fn settle(outcome: StoreOutcome, folder: &str, report: &mut AccountReport) -> Result<()> {
    let mut fatal = None;
    for e in outcome.errors {
        if fatal.is_none() && (e.breaks_connection() || matches!(e, Error::Cancelled)) {
            fatal = Some(e);
        } else {
            report.error(format!("`{}`: {}", folder, e));
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Apply `flag` to `uids` of the selected `folder`.
pub fn mark_folder<T: Read + Write>(
    session: &mut Session<T>,
    folder: &str,
    uids: &[Uid],
    flag: MarkFlag,
    store_number: usize,
    cancel: &CancelToken,
    report: &mut AccountReport,
) -> Result<()> {
    let outcome = store(session, uids, flag.op(), store_number, Some(cancel));
    report.marked += outcome.stored;
    if outcome.stored > 0 {
        report.change(format!("`{}`: marked {} messages", folder, outcome.stored));
    }
    settle(outcome, folder, report)
}

/// Delete `uids` from the selected `folder` of `account`.
///
/// Nothing is deleted when another client was seen changing messages in this folder earlier in
/// the session, or when any earlier action on the account reported an error.
#[allow(clippy::too_many_arguments)]
pub fn delete_folder<T: Read + Write>(
    session: &mut Session<T>,
    account: &Account,
    folder: &str,
    uids: &[Uid],
    method: DeleteMethod,
    store_number: usize,
    cancel: &CancelToken,
    report: &mut AccountReport,
) -> Result<()> {
    if uids.is_empty() {
        return Ok(());
    }
    if session.conflict().is_raised_in(folder) {
        report.skip(format!(
            "`{}`: not deleting {} messages because another IMAP client changed messages in this folder",
            folder,
            uids.len()
        ));
        return Ok(());
    }
    if report.has_errors() {
        report.error(format!(
            "one of the previous commands reported issues: not deleting {} messages from `{}`",
            uids.len(),
            folder
        ));
        return Ok(());
    }

    let op = method.resolve(account, folder);
    let outcome = store(session, uids, op, store_number, Some(cancel));
    if outcome.stored > 0 {
        if op == StoreOp::GmailTrash {
            report.trashed += outcome.stored;
            report.change(format!("`{}`: trashed {} messages", folder, outcome.stored));
        } else {
            report.deleted += outcome.stored;
            report.change(format!("`{}`: deleted {} messages", folder, outcome.stored));
        }
    }
    settle(outcome, folder, report)
}
