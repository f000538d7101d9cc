//! `for-each`: running a sequence of actions over every account.
//!
//! Each account gets one session for the whole sequence. Actions run strictly in order, so later
//! actions see the marks made by earlier ones, and folders are processed in the order their
//! [`FolderSelector`] resolves to. A failing account never stops the others; only a paranoid
//! delivery failure or an interrupt ends the whole cycle early.

use std::fmt::Write as _;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::account::Account;
use crate::batch::{search, BatchLimits};
use crate::cancel::CancelToken;
use crate::client::Session;
use crate::client_builder::Connector;
use crate::delete::{delete_folder, mark_folder, DeleteMethod, MarkFlag};
use crate::deliver::{DeliverySink, SinkSpec};
use crate::error::{Error, Result};
use crate::fetch::{fetch_folder, FetchFailurePolicy, FetchSettings, Flow, MarkAction};
use crate::filter::{FilterCache, MessageFilter, SearchCriteria};
use crate::folders::FolderSelector;
use crate::outcome::{AccountReport, RunOutcome};
use crate::types::Name;

/// What an action does to the messages it selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Count them.
    Count,
    /// Change a flag.
    Mark(MarkFlag),
    /// Deliver them, then mark what was delivered.
    Fetch {
        /// Where to.
        sink: SinkSpec,
        /// What to mark delivered messages as.
        mark: MarkAction,
        /// How delivery failures escalate.
        policy: FetchFailurePolicy,
        /// Commands to run once per cycle when this action delivered anything.
        new_mail_cmd: Vec<String>,
    },
    /// Remove them.
    Delete {
        /// How.
        method: DeleteMethod,
    },
}

impl ActionKind {
    /// The action's name.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Count => "count",
            ActionKind::Mark(_) => "mark",
            ActionKind::Fetch { .. } => "fetch",
            ActionKind::Delete { .. } => "delete",
        }
    }
}

/// One step of a `for-each` sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    /// What to do.
    pub kind: ActionKind,
    /// To which messages.
    pub filter: MessageFilter,
    /// In which folders.
    pub folders: FolderSelector,
    /// Only search and report what would be done.
    pub dry_run: bool,
}

/// A validated sequence of actions plus the limits they run under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// The actions, in execution order.
    pub actions: Vec<Action>,
    /// Batch limits shared by all actions.
    pub limits: BatchLimits,
}

impl Plan {
    /// Describe what every action would do, without connecting anywhere. Date bounds are
    /// resolved against `now`.
    pub fn describe(&self, now: DateTime<Utc>) -> Result<String> {
        let mut cache = FilterCache::new(now);
        let mut out = String::new();
        for (i, action) in self.actions.iter().enumerate() {
            let criteria = cache.get(&action.filter)?;
            let _ = write!(
                out,
                "{}. {} {} matching {}",
                i + 1,
                action.kind.name(),
                action.folders.describe(),
                criteria
            );
            match &action.kind {
                ActionKind::Count => {}
                ActionKind::Mark(flag) => {
                    let _ = write!(out, ", marking them as {}", flag.op());
                }
                ActionKind::Fetch {
                    sink, mark, policy, ..
                } => {
                    let mark = match mark.resolve(&action.filter) {
                        Some(op) => op.to_string(),
                        None => "nothing".to_string(),
                    };
                    let _ = write!(
                        out,
                        ", delivering to {} and marking them as {} ({} on failure)",
                        sink, mark, policy
                    );
                }
                ActionKind::Delete { method } => {
                    let _ = write!(out, ", using method {}", method);
                }
            }
            if action.dry_run {
                out.push_str(" (dry run)");
            }
            out.push('\n');
        }
        Ok(out)
    }
}

enum AccountEnd {
    Done,
    AbortRun,
    Cancelled,
}

/// Runs a [`Plan`] over accounts, connecting through `C`.
#[derive(Debug)]
pub struct Orchestrator<C: Connector> {
    connector: C,
}

impl<C: Connector> Orchestrator<C> {
    /// An orchestrator connecting through `connector`.
    pub fn new(connector: C) -> Self {
        Orchestrator { connector }
    }

    /// Run `plan` over every account once.
    pub fn run_cycle(&self, accounts: &[Account], plan: &Plan, cancel: &CancelToken) -> RunOutcome {
        // one clock for the whole cycle, so every account sees the same criteria
        let mut filters = FilterCache::new(Utc::now());
        let mut outcome = RunOutcome::default();

        for account in accounts {
            if cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
            let mut report = AccountReport::new(account);
            let end = self.run_account(account, plan, &mut filters, cancel, &mut report, &mut outcome);
            outcome.accounts.push(report);
            match end {
                AccountEnd::Done => {}
                AccountEnd::AbortRun => {
                    outcome.aborted = Some(format!(
                        "a message from {} could not be delivered",
                        account.label()
                    ));
                    break;
                }
                AccountEnd::Cancelled => {
                    outcome.interrupted = true;
                    break;
                }
            }
        }
        outcome
    }

    fn run_account(
        &self,
        account: &Account,
        plan: &Plan,
        filters: &mut FilterCache,
        cancel: &CancelToken,
        report: &mut AccountReport,
        outcome: &mut RunOutcome,
    ) -> AccountEnd {
        info!("processing {}", account.label());
        let session = self
            .connector
            .connect(account)
            .and_then(|client| client.sign_in(account));
        let mut session = match session {
            Ok((session, method)) => {
                debug!("signed in to {} with {:?}", account.label(), method);
                session
            }
            Err(e) => {
                report.error(format!("failed to sign in: {}", e));
                return AccountEnd::Done;
            }
        };

        let mut account_run = AccountRun {
            session: &mut session,
            account,
            plan,
            filters: &mut *filters,
            cancel,
            report: &mut *report,
            outcome: &mut *outcome,
            listed: None,
        };
        let result = account_run.run();

        let mut broken = false;
        let end = match result {
            Ok(Flow::AbortRun) => AccountEnd::AbortRun,
            Ok(Flow::Continue) | Ok(Flow::AbortAccount) => AccountEnd::Done,
            Err(Error::Cancelled) => AccountEnd::Cancelled,
            Err(e) => {
                broken = e.breaks_connection();
                report.error(e.to_string());
                AccountEnd::Done
            }
        };
        report.conflicts.extend(session.conflict().lines());

        if broken {
            debug!("not logging out of {}, the connection is gone", account.label());
        } else if cancel.is_forced() {
            warn!("dropping the connection to {}", account.label());
        } else if let Err(e) = session.logout() {
            debug!("LOGOUT from {} failed: {}", account.label(), e);
        }
        end
    }
}

struct AccountRun<'a, T: Read + Write> {
    session: &'a mut Session<T>,
    account: &'a Account,
    plan: &'a Plan,
    filters: &'a mut FilterCache,
    cancel: &'a CancelToken,
    report: &'a mut AccountReport,
    outcome: &'a mut RunOutcome,
    listed: Option<Vec<Name>>,
}

impl<'a, T: Read + Write> AccountRun<'a, T> {
    fn run(&mut self) -> Result<Flow> {
        let plan = self.plan;
        for action in &plan.actions {
            let flow = self.action(action)?;
            if flow != Flow::Continue {
                if flow == Flow::AbortAccount {
                    warn!(
                        "{}: skipping the remaining actions",
                        self.account.label()
                    );
                }
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    fn folders(&mut self, selector: &FolderSelector) -> Result<Vec<String>> {
        if selector.needs_listing() && self.listed.is_none() {
            self.listed = Some(self.session.list("", "*")?);
        }
        Ok(selector.resolve(self.listed.as_deref().unwrap_or(&[])))
    }

    fn action(&mut self, action: &Action) -> Result<Flow> {
        let criteria = match self.filters.get(&action.filter) {
            Ok(criteria) => criteria.clone(),
            Err(e) => {
                self.report
                    .error(format!("not running {}: {}", action.kind.name(), e));
                return Ok(Flow::Continue);
            }
        };
        let folders = match self.folders(&action.folders) {
            Ok(folders) => folders,
            Err(e) if e.breaks_connection() => return Err(e),
            Err(e) => {
                self.report.error(format!(
                    "not running {}: failed to list folders: {}",
                    action.kind.name(),
                    e
                ));
                return Ok(Flow::Continue);
            }
        };

        let mut sink: Option<Box<dyn DeliverySink>> = None;
        let mut settings = None;
        if let ActionKind::Fetch {
            sink: spec,
            mark,
            policy,
            ..
        } = &action.kind
        {
            if !action.dry_run {
                match spec.open() {
                    Ok(opened) => sink = Some(opened),
                    Err(e) => {
                        self.report.error(format!("not fetching: {}", e));
                        return Ok(Flow::Continue);
                    }
                }
            }
            settings = Some(FetchSettings {
                limits: self.plan.limits,
                policy: *policy,
                mark: mark.resolve(&action.filter),
            });
        }

        let delivered_before = self.report.delivered;
        let mut flow = Flow::Continue;
        for folder in &folders {
            self.cancel.check()?;
            if let Err(e) = self.session.select(folder) {
                if e.breaks_connection() {
                    return Err(e);
                }
                self.report
                    .error(format!("failed to select `{}`: {}", folder, e));
                continue;
            }

            let result = self.folder(action, folder, &criteria, sink.as_deref_mut(), settings.as_ref());
            let broken = matches!(&result, Err(e) if e.breaks_connection());
            if !broken && !self.cancel.is_forced() {
                self.session.close()?;
            }
            flow = match result {
                Ok(flow) => flow,
                Err(e) if e.breaks_connection() || matches!(e, Error::Cancelled) => return Err(e),
                Err(e) => {
                    self.report.error(format!("`{}`: {}", folder, e));
                    Flow::Continue
                }
            };
            if flow != Flow::Continue {
                break;
            }
        }

        if let ActionKind::Fetch { new_mail_cmd, .. } = &action.kind {
            if self.report.delivered > delivered_before {
                for command in new_mail_cmd {
                    self.outcome.queue_hook(command);
                }
            }
        }
        Ok(flow)
    }

    fn folder(
        &mut self,
        action: &Action,
        folder: &str,
        criteria: &SearchCriteria,
        sink: Option<&mut (dyn DeliverySink + 'static)>,
        settings: Option<&FetchSettings>,
    ) -> Result<Flow> {
        let uids = search(self.session, criteria)?;

        if action.kind == ActionKind::Count {
            info!("folder `{}` has {} messages matching {}", folder, uids.len(), criteria);
            self.report.counts.push((folder.to_string(), uids.len()));
            return Ok(Flow::Continue);
        }
        if uids.is_empty() {
            debug!("nothing to {} in `{}`", action.kind.name(), folder);
            return Ok(Flow::Continue);
        }
        if action.dry_run {
            info!(
                "dry-run: not running {} on {} messages matching {} from folder `{}`",
                action.kind.name(),
                uids.len(),
                criteria,
                folder
            );
            return Ok(Flow::Continue);
        }

        let store_number = self.plan.limits.store_number;
        match (&action.kind, sink, settings) {
            (ActionKind::Mark(flag), _, _) => {
                mark_folder(self.session, folder, &uids, *flag, store_number, self.cancel, self.report)?;
                Ok(Flow::Continue)
            }
            (ActionKind::Fetch { .. }, Some(sink), Some(settings)) => fetch_folder(
                self.session,
                folder,
                &action.filter,
                &uids,
                sink,
                settings,
                self.cancel,
                self.report,
            ),
            (ActionKind::Delete { method }, _, _) => {
                delete_folder(
                    self.session,
                    self.account,
                    folder,
                    &uids,
                    *method,
                    store_number,
                    self.cancel,
                    self.report,
                )?;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }
}
