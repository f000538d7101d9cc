//! TOML configuration.
//!
//! A file names accounts and a `for-each` sequence of actions:
//!
//! ```toml
//! interval = 600
//! success_cmd = ["notify-send -t 3000 -- mail"]
//!
//! [[account]]
//! host = "imap.gmail.com"
//! user = "alice@gmail.com"
//!
//! [[action]]
//! kind = "fetch"
//! folders = ["INBOX"]
//! maildir = "~/Mail/INBOX"
//!
//! [[action]]
//! kind = "delete"
//! all_folders = true
//! not_folders = ["[Gmail]/Starred"]
//! older_than = [30]
//! ```
//!
//! Passwords are never read from the file; [`Config::resolve`] asks a [`Credentials`] for them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::account::{Account, AuthPolicy, ConnectionMode, Password};
use crate::batch::BatchLimits;
use crate::client_builder::TcpConnector;
use crate::delete::{DeleteMethod, MarkFlag};
use crate::deliver::SinkSpec;
use crate::error::{Error, Result};
use crate::fetch::{FetchFailurePolicy, MarkAction};
use crate::filter::{expand_home, FlaggedState, MessageFilter, SeenState, TimeSource};
use crate::folders::FolderSelector;
use crate::orchestrator::{Action, ActionKind, Plan};
use crate::scheduler::{HookCommands, Schedule};

/// Supplies passwords.
pub trait Credentials {
    /// The password of `user` on `host`.
    fn password(&self, host: &str, user: &str) -> Result<Password>;
}

impl<F> Credentials for F
where
    F: Fn(&str, &str) -> Result<Password>,
{
    fn password(&self, host: &str, user: &str) -> Result<Password> {
        self(host, user)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_jitter() -> u64 {
    60
}

fn yes() -> bool {
    true
}

/// Batch limits as written in the file; unset ones keep their defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// UIDs per `UID STORE`.
    pub store_number: Option<usize>,
    /// UIDs per metadata `UID FETCH`.
    pub fetch_number: Option<usize>,
    /// Messages per body `UID FETCH`.
    pub batch_number: Option<usize>,
    /// Bytes per body `UID FETCH`.
    pub batch_size: Option<u64>,
}

/// One `[[account]]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    /// Server host.
    pub host: String,
    /// Server port; the mode's well-known port when unset.
    pub port: Option<u16>,
    /// `plain`, `ssl` or `starttls`.
    #[serde(default)]
    pub mode: ConnectionMode,
    /// Socket timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// User name.
    pub user: String,
    /// Permit `LOGIN` when `CRAM-MD5` is not offered.
    #[serde(default = "yes")]
    pub allow_login: bool,
    /// Permit `LOGIN` over an unencrypted socket.
    #[serde(default)]
    pub allow_plain: bool,
}

/// What an `[[action]]` does.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionName {
    /// See [`ActionKind::Count`].
    Count,
    /// See [`ActionKind::Mark`].
    Mark,
    /// See [`ActionKind::Fetch`].
    Fetch,
    /// See [`ActionKind::Delete`].
    Delete,
}

/// One `[[action]]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    /// The action.
    pub kind: ActionName,

    /// Folders to work on.
    #[serde(default)]
    pub folders: Vec<String>,
    /// Work on every selectable folder. Ignored when `folders` is given.
    #[serde(default)]
    pub all_folders: bool,
    /// Folders to skip.
    #[serde(default)]
    pub not_folders: Vec<String>,

    /// `\Seen` constraint; fetch defaults to `unseen`, delete to `seen`.
    pub seen: Option<SeenState>,
    /// `\Flagged` constraint.
    pub flagged: Option<FlaggedState>,
    /// Day counts for the older-than bound.
    #[serde(default)]
    pub older_than: Vec<i64>,
    /// Files holding a UNIX timestamp for the older-than bound.
    #[serde(default)]
    pub older_than_timestamp_in: Vec<PathBuf>,
    /// Files whose modification time is an older-than bound.
    #[serde(default)]
    pub older_than_mtime_of: Vec<PathBuf>,
    /// Day counts for the newer-than bound.
    #[serde(default)]
    pub newer_than: Vec<i64>,
    /// Files holding a UNIX timestamp for the newer-than bound.
    #[serde(default)]
    pub newer_than_timestamp_in: Vec<PathBuf>,
    /// Files whose modification time is a newer-than bound.
    #[serde(default)]
    pub newer_than_mtime_of: Vec<PathBuf>,
    /// `From` must contain each of these.
    #[serde(default)]
    pub from: Vec<String>,
    /// `From` must contain none of these.
    #[serde(default)]
    pub not_from: Vec<String>,

    /// Flag to apply (`mark`) or what to mark delivered messages as (`fetch`).
    pub mark: Option<MarkAction>,
    /// Deliver into this Maildir (`fetch`).
    pub maildir: Option<PathBuf>,
    /// Deliver through this shell command (`fetch`).
    pub mda: Option<String>,
    /// Delivery failure policy (`fetch`).
    pub policy: Option<FetchFailurePolicy>,
    /// Commands to run when new mail arrived (`fetch`).
    #[serde(default)]
    pub new_mail_cmd: Vec<String>,
    /// How to delete (`delete`).
    pub method: Option<DeleteMethod>,

    /// Only search and report.
    #[serde(default)]
    pub dry_run: bool,
}

/// A whole configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between cycle starts; a single cycle when unset.
    pub interval: Option<u64>,
    /// Maximum random delay before every cycle, in seconds.
    #[serde(default = "default_jitter")]
    pub jitter: u64,
    /// Batch limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Run after a cycle that changed something.
    #[serde(default)]
    pub success_cmd: Vec<String>,
    /// Run after a cycle that failed somewhere.
    #[serde(default)]
    pub failure_cmd: Vec<String>,
    /// Mirror the IMAP conversations to stderr.
    #[serde(default)]
    pub debug: bool,
    /// Accounts, processed in this order.
    #[serde(default, rename = "account")]
    pub accounts: Vec<AccountConfig>,
    /// Actions, run in this order on every account.
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionConfig>,
}

/// A configuration with credentials resolved and every default applied.
#[derive(Debug)]
pub struct Setup {
    /// The accounts.
    pub accounts: Vec<Account>,
    /// The actions and their limits.
    pub plan: Plan,
    /// How to repeat; `None` for a single cycle.
    pub schedule: Option<Schedule>,
    /// End-of-cycle hooks.
    pub hooks: HookCommands,
    /// How to reach the servers.
    pub connector: TcpConnector,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config(message.into())
}

impl Config {
    /// Parse a configuration.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| invalid(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(expand_home(path))
            .map_err(|e| invalid(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Validate, fill in defaults, and ask `credentials` for every account's password.
    pub fn resolve<C: Credentials + ?Sized>(&self, credentials: &C) -> Result<Setup> {
        if self.accounts.is_empty() {
            return Err(invalid("no accounts specified"));
        }
        if self.actions.is_empty() {
            return Err(invalid("no actions specified"));
        }

        let limits = self.limits()?;
        let actions = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| a.resolve().map_err(|e| invalid(format!("action {}: {}", i + 1, e))))
            .collect::<Result<Vec<_>>>()?;

        let mut accounts = Vec::with_capacity(self.accounts.len());
        for a in &self.accounts {
            let password = credentials.password(&a.host, &a.user)?;
            accounts.push(Account {
                host: a.host.clone(),
                port: a.port.unwrap_or_else(|| a.mode.default_port()),
                mode: a.mode,
                timeout: Duration::from_secs(a.timeout),
                user: a.user.clone(),
                password,
                auth: AuthPolicy {
                    allow_login: a.allow_login,
                    allow_plain: a.allow_plain,
                },
            });
        }

        let schedule = match self.interval {
            Some(0) => return Err(invalid("interval must be positive")),
            Some(every) => Some(Schedule {
                jitter: Duration::from_secs(self.jitter),
                ..Schedule::every(Duration::from_secs(every))
            }),
            None => None,
        };

        Ok(Setup {
            accounts,
            plan: Plan { actions, limits },
            schedule,
            hooks: HookCommands {
                on_success: self.success_cmd.clone(),
                on_failure: self.failure_cmd.clone(),
            },
            connector: TcpConnector {
                debug: self.debug,
                danger_skip_tls_verify: false,
            },
        })
    }

    fn limits(&self) -> Result<BatchLimits> {
        let defaults = BatchLimits::default();
        let l = &self.limits;
        let limits = BatchLimits {
            store_number: l.store_number.unwrap_or(defaults.store_number),
            fetch_number: l.fetch_number.unwrap_or(defaults.fetch_number),
            batch_number: l.batch_number.unwrap_or(defaults.batch_number),
            batch_size: l.batch_size.unwrap_or(defaults.batch_size),
        };
        if limits.store_number == 0
            || limits.fetch_number == 0
            || limits.batch_number == 0
            || limits.batch_size == 0
        {
            return Err(invalid("batch limits must be positive"));
        }
        Ok(limits)
    }
}

impl ActionConfig {
    fn resolve(&self) -> std::result::Result<Action, String> {
        let name = match self.kind {
            ActionName::Count => "count",
            ActionName::Mark => "mark",
            ActionName::Fetch => "fetch",
            ActionName::Delete => "delete",
        };
        let only_for = |set: bool, field: &str, kind: ActionName| {
            if set && self.kind != kind {
                Err(format!("`{}` does not apply to {}", field, name))
            } else {
                Ok(())
            }
        };
        only_for(self.maildir.is_some(), "maildir", ActionName::Fetch)?;
        only_for(self.mda.is_some(), "mda", ActionName::Fetch)?;
        only_for(self.policy.is_some(), "policy", ActionName::Fetch)?;
        only_for(!self.new_mail_cmd.is_empty(), "new_mail_cmd", ActionName::Fetch)?;
        only_for(self.method.is_some(), "method", ActionName::Delete)?;
        if self.mark.is_some() && !matches!(self.kind, ActionName::Mark | ActionName::Fetch) {
            return Err(format!("`mark` does not apply to {}", name));
        }

        if self.folders.is_empty() && !self.all_folders {
            return Err("no folders specified, set `folders` or `all_folders`".to_string());
        }
        let folders = FolderSelector {
            all: self.all_folders && self.folders.is_empty(),
            include: self.folders.clone(),
            exclude: self.not_folders.clone(),
        };

        let mut filter = MessageFilter {
            seen: self.seen.unwrap_or_default(),
            flagged: self.flagged.unwrap_or_default(),
            older_than: sources(&self.older_than, &self.older_than_timestamp_in, &self.older_than_mtime_of),
            newer_than: sources(&self.newer_than, &self.newer_than_timestamp_in, &self.newer_than_mtime_of),
            from: self.from.clone(),
            not_from: self.not_from.clone(),
        };

        let kind = match self.kind {
            ActionName::Count => ActionKind::Count,
            ActionName::Mark => {
                let flag = match self.mark {
                    Some(MarkAction::Seen) => MarkFlag::Seen,
                    Some(MarkAction::Unseen) => MarkFlag::Unseen,
                    Some(MarkAction::Flagged) => MarkFlag::Flagged,
                    Some(MarkAction::Unflagged) => MarkFlag::Unflagged,
                    Some(other) => return Err(format!("cannot mark messages as `{}`", other)),
                    None => return Err("`mark` needs a flag to set".to_string()),
                };
                flag.narrow(&mut filter);
                ActionKind::Mark(flag)
            }
            ActionName::Fetch => {
                if self.seen.is_none() {
                    filter.seen = SeenState::Unseen;
                }
                let sink = match (&self.maildir, &self.mda) {
                    (Some(path), None) => SinkSpec::Maildir(path.clone()),
                    (None, Some(command)) => SinkSpec::Mda(command.clone()),
                    _ => return Err("exactly one of `maildir` and `mda` is required".to_string()),
                };
                ActionKind::Fetch {
                    sink,
                    mark: self.mark.unwrap_or_default(),
                    policy: self.policy.unwrap_or_default(),
                    new_mail_cmd: self.new_mail_cmd.clone(),
                }
            }
            ActionName::Delete => {
                if self.seen.is_none() {
                    filter.seen = SeenState::Seen;
                }
                ActionKind::Delete {
                    method: self.method.unwrap_or_default(),
                }
            }
        };

        Ok(Action {
            kind,
            filter,
            folders,
            dry_run: self.dry_run,
        })
    }
}

fn sources(days: &[i64], timestamps: &[PathBuf], mtimes: &[PathBuf]) -> Vec<TimeSource> {
    days.iter()
        .map(|d| TimeSource::Days(*d))
        .chain(timestamps.iter().cloned().map(TimeSource::TimestampIn))
        .chain(mtimes.iter().cloned().map(TimeSource::MtimeOf))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(_host: &str, user: &str) -> Result<Password> {
        Ok(Password::new(format!("{}-secret", user)))
    }

    const EXAMPLE: &str = r#"
        interval = 600
        jitter = 30
        success_cmd = ["notify-send mail"]
        debug = true

        [limits]
        store_number = 50

        [[account]]
        host = "imap.gmail.com"
        user = "alice@gmail.com"

        [[account]]
        host = "mail.example.org"
        mode = "starttls"
        user = "bob"
        timeout = 10
        allow_login = false

        [[action]]
        kind = "fetch"
        folders = ["INBOX"]
        mda = "procmail"
        new_mail_cmd = ["play ding.wav"]

        [[action]]
        kind = "delete"
        all_folders = true
        not_folders = ["[Gmail]/Starred"]
        older_than = [30]
        older_than_timestamp_in = ["~/.last-backup"]
    "#;

    #[test]
    fn example_resolves() {
        let setup = Config::parse(EXAMPLE).unwrap().resolve(&creds).unwrap();

        let alice = &setup.accounts[0];
        assert_eq!(alice.port, 993);
        assert_eq!(alice.timeout, Duration::from_secs(60));
        assert_eq!(alice.password, Password::new("alice@gmail.com-secret"));
        assert!(alice.auth.allow_login);
        let bob = &setup.accounts[1];
        assert_eq!((bob.mode, bob.port), (ConnectionMode::StartTls, 143));
        assert!(!bob.auth.allow_login);

        assert_eq!(setup.plan.limits.store_number, 50);
        assert_eq!(setup.plan.limits.batch_size, 4 * 1024 * 1024);

        let fetch = &setup.plan.actions[0];
        assert_eq!(fetch.filter, MessageFilter::unseen());
        assert_eq!(
            fetch.kind,
            ActionKind::Fetch {
                sink: SinkSpec::Mda("procmail".into()),
                mark: MarkAction::Auto,
                policy: FetchFailurePolicy::Careful,
                new_mail_cmd: vec!["play ding.wav".into()],
            }
        );

        let delete = &setup.plan.actions[1];
        assert_eq!(delete.filter.seen, SeenState::Seen);
        assert_eq!(
            delete.filter.older_than,
            vec![
                TimeSource::Days(30),
                TimeSource::TimestampIn("~/.last-backup".into())
            ]
        );
        assert!(delete.folders.needs_listing());
        assert_eq!(delete.kind, ActionKind::Delete { method: DeleteMethod::Auto });

        let schedule = setup.schedule.unwrap();
        assert_eq!(schedule.every, Duration::from_secs(600));
        assert_eq!(schedule.jitter, Duration::from_secs(30));
        assert_eq!(schedule.floor, Duration::from_secs(60));
        assert_eq!(setup.hooks.on_success, vec!["notify-send mail"]);
        assert!(setup.connector.debug);
    }

    fn action(body: &str) -> Result<Setup> {
        let text = format!(
            "[[account]]\nhost = \"h\"\nuser = \"u\"\n[[action]]\n{}",
            body
        );
        Config::parse(&text)?.resolve(&creds)
    }

    fn config_error(r: Result<Setup>) -> String {
        match r {
            Err(Error::Config(message)) => message,
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn mark_narrows_its_filter() {
        let setup = action("kind = \"mark\"\nfolders = [\"INBOX\"]\nmark = \"unseen\"").unwrap();
        let a = &setup.plan.actions[0];
        assert_eq!(a.kind, ActionKind::Mark(MarkFlag::Unseen));
        assert_eq!(a.filter.seen, SeenState::Seen);
        assert!(setup.schedule.is_none());
    }

    #[test]
    fn negative_days_reach_into_the_future() {
        let setup = action("kind = \"count\"\nfolders = [\"INBOX\"]\nnewer_than = [-1]").unwrap();
        assert_eq!(
            setup.plan.actions[0].filter.newer_than,
            vec![TimeSource::Days(-1)]
        );
    }

    #[test]
    fn explicit_folders_win_over_all() {
        let setup = action("kind = \"count\"\nall_folders = true\nfolders = [\"INBOX\"]").unwrap();
        let folders = &setup.plan.actions[0].folders;
        assert!(!folders.needs_listing());
        assert_eq!(folders.include, vec!["INBOX"]);
    }

    #[test]
    fn invalid_actions() {
        assert!(config_error(action("kind = \"count\"")).contains("no folders"));
        assert!(config_error(action("kind = \"fetch\"\nfolders = [\"INBOX\"]")).contains("exactly one"));
        assert!(config_error(action(
            "kind = \"fetch\"\nfolders = [\"INBOX\"]\nmda = \"a\"\nmaildir = \"b\""
        ))
        .contains("exactly one"));
        assert!(config_error(action("kind = \"mark\"\nfolders = [\"INBOX\"]\nmark = \"noop\"")).contains("noop"));
        assert!(config_error(action("kind = \"count\"\nfolders = [\"INBOX\"]\nmethod = \"delete\""))
            .contains("`method` does not apply to count"));
        assert!(config_error(action("kind = \"count\"\nfolders = [\"INBOX\"]\nbogus = 1")).contains("bogus"));
    }

    #[test]
    fn invalid_globals() {
        assert!(config_error(Config::parse("[[action]]\nkind = \"count\"\nall_folders = true")
            .and_then(|c| c.resolve(&creds)))
        .contains("no accounts"));
        let text = "interval = 0\n[[account]]\nhost = \"h\"\nuser = \"u\"\n[[action]]\nkind = \"count\"\nall_folders = true";
        assert!(config_error(Config::parse(text).and_then(|c| c.resolve(&creds))).contains("interval"));
        let text = "[limits]\nbatch_number = 0\n[[account]]\nhost = \"h\"\nuser = \"u\"\n[[action]]\nkind = \"count\"\nall_folders = true";
        assert!(config_error(Config::parse(text).and_then(|c| c.resolve(&creds))).contains("positive"));
    }

    #[test]
    fn credential_errors_propagate() {
        let refuse = |_: &str, _: &str| -> Result<Password> { Err(Error::Config("no password".into())) };
        let text = "[[account]]\nhost = \"h\"\nuser = \"u\"\n[[action]]\nkind = \"count\"\nall_folders = true";
        assert!(Config::parse(text).unwrap().resolve(&refuse).is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, EXAMPLE).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::parse(EXAMPLE).unwrap());
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
