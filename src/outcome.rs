//! What a run did, and telling the outside world about it.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use log::{error, info, warn};

use crate::account::Account;

/// Changes and failures on one account during one cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountReport {
    /// `user on host`.
    pub account: String,
    /// Messages handed to a sink successfully.
    pub delivered: usize,
    /// Messages that should have been delivered but were not.
    pub undelivered: usize,
    /// Messages whose flags were changed.
    pub marked: usize,
    /// Messages moved to GMail's trash.
    pub trashed: usize,
    /// Messages flagged `\Deleted`.
    pub deleted: usize,
    /// One line per folder and action that changed something.
    pub changes: Vec<String>,
    /// One line per failure.
    pub errors: Vec<String>,
    /// One line per destructive action refused because of a conflict.
    pub skipped: Vec<String>,
    /// One line per sign of another client changing messages in parallel with us.
    pub conflicts: Vec<String>,
    /// Matching messages per folder, from `count` actions.
    pub counts: Vec<(String, usize)>,
}

impl AccountReport {
    /// An empty report for `account`.
    pub fn new(account: &Account) -> Self {
        AccountReport {
            account: format!("{} on {}", account.user, account.host),
            ..Default::default()
        }
    }

    /// Record a change.
    pub fn change(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}: {}", self.account, line);
        self.changes.push(line);
    }

    /// Record a failure.
    pub fn error(&mut self, line: impl Into<String>) {
        let line = line.into();
        error!("{}: {}", self.account, line);
        self.errors.push(line);
    }

    /// Record a refused destructive action.
    pub fn skip(&mut self, line: impl Into<String>) {
        let line = line.into();
        warn!("{}: {}", self.account, line);
        self.skipped.push(line);
    }

    /// Whether anything failed on this account so far.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn section(&self, lines: &[&String]) -> Option<String> {
        if lines.is_empty() {
            return None;
        }
        let mut out = format!("{}:", self.account);
        for line in lines {
            out.push_str("\n- ");
            out.push_str(line);
        }
        Some(out)
    }
}

/// A titled message for a hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    /// One line.
    pub title: String,
    /// Any number of lines.
    pub body: String,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}\n", self.title, self.body)
    }
}

/// The good and the bad news of a cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Present when something changed.
    pub good: Option<Notice>,
    /// Present when something failed.
    pub bad: Option<Notice>,
}

/// Everything one cycle over all accounts did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// One report per account, in processing order.
    pub accounts: Vec<AccountReport>,
    /// New-mail hooks to run, deduplicated, in the order they were first queued.
    pub new_mail_hooks: Vec<String>,
    /// Set when a paranoid delivery failure stopped the run.
    pub aborted: Option<String>,
    /// Set when the run was interrupted.
    pub interrupted: bool,
}

fn plural(n: usize, what: &str) -> String {
    if n == 1 {
        format!("{} {}", n, what)
    } else {
        format!("{} {}s", n, what)
    }
}

impl RunOutcome {
    /// Queue a new-mail hook unless it is queued already.
    pub fn queue_hook(&mut self, command: &str) {
        if !self.new_mail_hooks.iter().any(|c| c == command) {
            self.new_mail_hooks.push(command.to_string());
        }
    }

    /// Whether any account reported a failure or a conflict, or the run was aborted.
    pub fn has_errors(&self) -> bool {
        self.aborted.is_some()
            || self.accounts.iter().any(|a| {
                !a.errors.is_empty() || !a.skipped.is_empty() || !a.conflicts.is_empty()
            })
    }

    /// The results of `count` actions, one line per folder: `<n> <folder>` when `porcelain`,
    /// otherwise prefixed with the account.
    pub fn counts(&self, porcelain: bool) -> String {
        let mut out = String::new();
        for report in &self.accounts {
            for (folder, n) in &report.counts {
                if porcelain {
                    out.push_str(&format!("{} {}\n", n, folder));
                } else {
                    out.push_str(&format!(
                        "{}: `{}` has {}\n",
                        report.account,
                        folder,
                        plural(*n, "matching message")
                    ));
                }
            }
        }
        out
    }

    /// Render the cycle for humans.
    pub fn summary(&self) -> Summary {
        let sum = |f: fn(&AccountReport) -> usize| self.accounts.iter().map(f).sum::<usize>();
        let delivered = sum(|a| a.delivered);
        let undelivered = sum(|a| a.undelivered);
        let marked = sum(|a| a.marked);
        let trashed = sum(|a| a.trashed);
        let deleted = sum(|a| a.deleted);
        let errors = sum(|a| a.errors.len() + a.conflicts.len() + a.skipped.len())
            + usize::from(self.aborted.is_some());

        let mut good = Vec::new();
        if delivered > 0 {
            good.push(format!("fetched {}", plural(delivered, "new message")));
        }
        if marked > 0 {
            good.push(format!("marked {}", plural(marked, "message")));
        }
        if trashed > 0 {
            good.push(format!("trashed {}", plural(trashed, "message")));
        }
        if deleted > 0 {
            good.push(format!("deleted {}", plural(deleted, "message")));
        }

        let mut bad = Vec::new();
        if undelivered > 0 {
            bad.push(format!("failed to fetch {}", plural(undelivered, "message")));
        }
        if errors > 0 {
            bad.push(format!("produced {}", plural(errors, "new error")));
        }

        let good_body: Vec<String> = self
            .accounts
            .iter()
            .filter_map(|a| a.section(&a.changes.iter().collect::<Vec<_>>()))
            .collect();
        let mut bad_body: Vec<String> = self
            .accounts
            .iter()
            .filter_map(|a| {
                let lines: Vec<_> = a.errors.iter().chain(&a.conflicts).chain(&a.skipped).collect();
                a.section(&lines)
            })
            .collect();
        if let Some(reason) = &self.aborted {
            bad_body.push(format!("run aborted: {}", reason));
        }

        Summary {
            good: (!good.is_empty()).then(|| Notice {
                title: good.join(", "),
                body: good_body.join("\n"),
            }),
            bad: (!bad.is_empty()).then(|| Notice {
                title: bad.join(", "),
                body: bad_body.join("\n"),
            }),
        }
    }

    /// Fire the hooks for this cycle: every queued new-mail hook once, then `on_success` or
    /// `on_failure` commands with the matching notice.
    pub fn dispatch<H: Hooks + ?Sized>(&self, hooks: &mut H, on_success: &[String], on_failure: &[String]) {
        let summary = self.summary();
        let quiet = Notice {
            title: String::new(),
            body: String::new(),
        };
        let mut fired = HashSet::new();
        for command in &self.new_mail_hooks {
            if fired.insert(command.as_str()) {
                hooks.invoke(command, summary.good.as_ref().unwrap_or(&quiet));
            }
        }

        let mut fired = HashSet::new();
        if let Some(notice) = &summary.good {
            for command in on_success {
                if fired.insert(command.as_str()) {
                    hooks.invoke(command, notice);
                }
            }
        }
        let mut fired = HashSet::new();
        if let Some(notice) = &summary.bad {
            for command in on_failure {
                if fired.insert(command.as_str()) {
                    hooks.invoke(command, notice);
                }
            }
        }
    }
}

/// Runs end-of-cycle hooks.
pub trait Hooks {
    /// Run `command`, telling it about `notice`. Failures are the hook's business.
    fn invoke(&mut self, command: &str, notice: &Notice);
}

/// Runs hooks through `sh -c`, with `title\nbody\n` on stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellHooks;

impl Hooks for ShellHooks {
    fn invoke(&mut self, command: &str, notice: &Notice) {
        info!("running `{}`", command);
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to run `{}`: {}", command, e);
                return;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(notice.to_string().as_bytes()) {
                warn!("failed to feed `{}`: {}", command, e);
            }
        }
        match child.wait() {
            Ok(status) if !status.success() => warn!("`{}` exited with {}", command, status),
            Ok(_) => {}
            Err(e) => warn!("failed to wait for `{}`: {}", command, e),
        }
    }
}
