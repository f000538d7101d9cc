//! Batch operations over IMAP mailboxes: count, mark, fetch into local delivery, and delete
//! messages across many accounts and folders, in bounded batches, without losing mail.
//!
//! Nothing is marked on the server before it was durably delivered, nothing is deleted while
//! another client is seen changing the same folder, and a run can be interrupted between any two
//! batches.
//!
//! # Usage
//!
//! A plan is usually loaded from a configuration file, see [`config`]. Built by hand, fetching
//! unseen mail from `INBOX` into a Maildir once looks like this:
//!
//! ```no_run
//! use imap_harvest::{
//!     Account, Action, ActionKind, CancelToken, ConnectionMode, FetchFailurePolicy,
//!     FolderSelector, MarkAction, MessageFilter, Orchestrator, Password, Plan, SinkSpec,
//!     TcpConnector,
//! };
//!
//! let account = Account::new(
//!     "imap.example.org",
//!     ConnectionMode::Ssl,
//!     "alice",
//!     Password::new("hunter2"),
//! );
//! let plan = Plan {
//!     actions: vec![Action {
//!         kind: ActionKind::Fetch {
//!             sink: SinkSpec::Maildir("/home/alice/Mail/INBOX".into()),
//!             mark: MarkAction::Auto,
//!             policy: FetchFailurePolicy::Careful,
//!             new_mail_cmd: Vec::new(),
//!         },
//!         filter: MessageFilter::unseen(),
//!         folders: FolderSelector::only(["INBOX"]),
//!         dry_run: false,
//!     }],
//!     ..Default::default()
//! };
//!
//! let outcome = Orchestrator::new(TcpConnector::default()).run_cycle(
//!     &[account],
//!     &plan,
//!     &CancelToken::new(),
//! );
//! if let Some(notice) = outcome.summary().good {
//!     println!("{}", notice);
//! }
//! ```
//!
//! Repeating cycles, with end-of-cycle hooks, is the job of the [`Scheduler`].

#![warn(missing_docs)]

mod parse;
mod types;

pub mod account;
pub mod authenticator;
pub mod batch;
pub mod cancel;
pub mod client;
pub mod client_builder;
pub mod config;
pub mod conflict;
pub mod conn;
pub mod delete;
pub mod deliver;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod folders;
pub mod orchestrator;
pub mod outcome;
pub mod scheduler;

pub use crate::account::{Account, AuthPolicy, ConnectionMode, Password};
pub use crate::batch::BatchLimits;
pub use crate::cancel::{CancelToken, Wakeup};
pub use crate::client::{Client, Session};
pub use crate::client_builder::{ClientBuilder, Connector, TcpConnector};
pub use crate::config::{Config, Credentials, Setup};
pub use crate::conn::Connection;
pub use crate::delete::{DeleteMethod, MarkFlag};
pub use crate::deliver::{DeliverySink, SinkSpec};
pub use crate::error::{Error, Result};
pub use crate::fetch::{FetchFailurePolicy, MarkAction};
pub use crate::filter::{FlaggedState, MessageFilter, SeenState, TimeSource};
pub use crate::folders::FolderSelector;
pub use crate::orchestrator::{Action, ActionKind, Orchestrator, Plan};
pub use crate::outcome::{Hooks, Notice, RunOutcome, ShellHooks, Summary};
pub use crate::scheduler::{HookCommands, Schedule, Scheduler};
pub use types::*;

#[cfg(test)]
mod mock_server;
#[cfg(test)]
mod mock_stream;
