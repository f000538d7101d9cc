//! The fetch pipeline: download matching messages, deliver them, and mark what was delivered.
//!
//! Per body batch the states are `fetched -> delivering -> delivered | delivery-failed`, and only
//! then is the batch marked. What happens to the rest of the run when deliveries fail is up to the
//! [`FetchFailurePolicy`].

use std::fmt;
use std::io::{Read, Write};

use log::{error, warn};
use serde::Deserialize;

use crate::batch::{
    self, fetch_bodies, fetch_metadata, uid_chunks, BatchLimits, BodyBatch, BodyBatcher, StoreOp,
};
use crate::cancel::CancelToken;
use crate::client::Session;
use crate::deliver::DeliverySink;
use crate::error::{Error, Result};
use crate::filter::{FlaggedState, MessageFilter, SeenState};
use crate::outcome::AccountReport;
use crate::types::Uid;

/// How delivery failures affect the rest of the run.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FetchFailurePolicy {
    /// Leave failed messages unmarked and carry on.
    Yolo,
    /// Stop the account's remaining actions when a whole batch failed.
    #[default]
    Careful,
    /// Stop everything at the first failure, without marking any of its batch.
    Paranoid,
}

impl fmt::Display for FetchFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchFailurePolicy::Yolo => "yolo",
            FetchFailurePolicy::Careful => "careful",
            FetchFailurePolicy::Paranoid => "paranoid",
        })
    }
}

/// What to do to fetched messages on the server.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MarkAction {
    /// `Seen` when searching for exactly unseen messages, `Flagged` when searching for exactly
    /// unflagged ones, nothing otherwise.
    #[default]
    Auto,
    /// Leave them alone.
    Noop,
    /// Set `\Seen`.
    Seen,
    /// Clear `\Seen`.
    Unseen,
    /// Set `\Flagged`.
    Flagged,
    /// Clear `\Flagged`.
    Unflagged,
}

impl MarkAction {
    /// The concrete operation for messages selected by `filter`.
    pub fn resolve(self, filter: &MessageFilter) -> Option<StoreOp> {
        match self {
            MarkAction::Auto => match (filter.seen, filter.flagged) {
                (SeenState::Unseen, FlaggedState::Any) => Some(StoreOp::AddSeen),
                (SeenState::Any, FlaggedState::Unflagged) => Some(StoreOp::AddFlagged),
                _ => None,
            },
            MarkAction::Noop => None,
            MarkAction::Seen => Some(StoreOp::AddSeen),
            MarkAction::Unseen => Some(StoreOp::RemoveSeen),
            MarkAction::Flagged => Some(StoreOp::AddFlagged),
            MarkAction::Unflagged => Some(StoreOp::RemoveFlagged),
        }
    }
}

impl fmt::Display for MarkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MarkAction::Auto => "auto",
            MarkAction::Noop => "noop",
            MarkAction::Seen => "seen",
            MarkAction::Unseen => "unseen",
            MarkAction::Flagged => "flagged",
            MarkAction::Unflagged => "unflagged",
        })
    }
}

/// Where to go after a folder was processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// On to the next folder or action.
    Continue,
    /// Skip the rest of this account's actions.
    AbortAccount,
    /// Stop the whole run.
    AbortRun,
}

/// How one fetch action runs, resolved before it starts.
#[derive(Clone, Copy, Debug)]
pub struct FetchSettings {
    /// Batch limits.
    pub limits: BatchLimits,
    /// Failure escalation.
    pub policy: FetchFailurePolicy,
    /// Post-delivery flag change, already resolved against the filter.
    pub mark: Option<StoreOp>,
}

#[derive(Debug, Default)]
struct Tally {
    delivered: usize,
    failed: usize,
    marked: usize,
}

/// Fetch and deliver `uids` of the selected `folder`.
///
/// `uids` must come from a fresh search under `filter`. Counts and failures are recorded in
/// `report` even when this returns an error.
#[allow(clippy::too_many_arguments)]
pub fn fetch_folder<T, S>(
    session: &mut Session<T>,
    folder: &str,
    filter: &MessageFilter,
    uids: &[Uid],
    sink: &mut S,
    settings: &FetchSettings,
    cancel: &CancelToken,
    report: &mut AccountReport,
) -> Result<Flow>
where
    T: Read + Write,
    S: DeliverySink + ?Sized,
{
    let mut tally = Tally::default();
    let mut pipeline = Pipeline {
        session,
        folder,
        sink,
        settings,
        cancel,
        report: &mut *report,
        tally: &mut tally,
    };
    let result = pipeline.run(filter, uids);

    report.delivered += tally.delivered;
    report.undelivered += tally.failed;
    report.marked += tally.marked;
    if tally.delivered > 0 {
        report.change(match settings.mark {
            Some(_) if tally.marked == tally.delivered => format!(
                "`{}`: fetched and marked {} messages",
                folder, tally.delivered
            ),
            Some(_) => format!(
                "`{}`: fetched {} but marked {} messages",
                folder, tally.delivered, tally.marked
            ),
            None => format!("`{}`: fetched {} messages", folder, tally.delivered),
        });
    }
    if tally.failed > 0 {
        report.error(format!(
            "`{}`: failed to fetch {} messages",
            folder, tally.failed
        ));
    }
    result
}

struct Pipeline<'a, T: Read + Write, S: DeliverySink + ?Sized> {
    session: &'a mut Session<T>,
    folder: &'a str,
    sink: &'a mut S,
    settings: &'a FetchSettings,
    cancel: &'a CancelToken,
    report: &'a mut AccountReport,
    tally: &'a mut Tally,
}

impl<'a, T: Read + Write, S: DeliverySink + ?Sized> Pipeline<'a, T, S> {
    fn run(&mut self, filter: &MessageFilter, uids: &[Uid]) -> Result<Flow> {
        let limits = self.settings.limits;
        let mut batcher = BodyBatcher::new(limits);

        for chunk in uid_chunks(uids, limits.fetch_number) {
            self.cancel.check()?;
            let meta = fetch_metadata(self.session, filter, chunk)?;
            self.tally.failed += meta.missing.len();
            for full in batcher.extend(meta.sizes) {
                let flow = self.batch(&full)?;
                if flow != Flow::Continue {
                    return Ok(flow);
                }
            }
        }
        match batcher.finish() {
            Some(last) => self.batch(&last),
            None => Ok(Flow::Continue),
        }
    }

    fn batch(&mut self, batch: &BodyBatch) -> Result<Flow> {
        self.cancel.check()?;
        let bodies = fetch_bodies(self.session, batch)?;
        self.tally.failed += bodies.missing.len();

        // from here on the batch is finished even if an interrupt arrives
        let outcomes = self.sink.deliver(&bodies.messages);
        let done: Vec<Uid> = outcomes
            .iter()
            .filter(|o| o.delivered && o.markable)
            .map(|o| o.uid)
            .collect();
        let failed = outcomes.len() - done.len();
        self.tally.delivered += done.len();
        self.tally.failed += failed;

        if failed > 0 {
            match self.settings.policy {
                FetchFailurePolicy::Yolo => {}
                FetchFailurePolicy::Paranoid => {
                    error!(
                        "`{}`: {} of {} messages of a batch were not delivered, aborting",
                        self.folder,
                        failed,
                        outcomes.len()
                    );
                    self.report.error(format!(
                        "`{}`: delivery failed under the paranoid policy, not marking {} delivered messages of the batch",
                        self.folder,
                        done.len()
                    ));
                    return Ok(Flow::AbortRun);
                }
                FetchFailurePolicy::Careful if done.is_empty() => {
                    self.report.error(format!(
                        "`{}`: no message of a batch of {} could be delivered, skipping the remaining actions of this account",
                        self.folder, failed
                    ));
                    return Ok(Flow::AbortAccount);
                }
                FetchFailurePolicy::Careful => {}
            }
        }

        if let Some(op) = self.settings.mark {
            self.mark(&done, op)?;
        }
        Ok(Flow::Continue)
    }

    fn mark(&mut self, done: &[Uid], op: StoreOp) -> Result<()> {
        if done.is_empty() {
            return Ok(());
        }
        let mut outcome = batch::store(self.session, done, op, self.settings.limits.store_number, None);
        self.tally.marked += outcome.stored;
        let fatal = outcome.errors.iter().position(Error::breaks_connection);
        let fatal = fatal.map(|i| outcome.errors.remove(i));
        for e in outcome.errors {
            self.report
                .error(format!("`{}`: failed to mark fetched messages: {}", self.folder, e));
        }
        if outcome.failed > 0 {
            warn!(
                "`{}`: {} delivered messages stay unmarked and will be fetched again",
                self.folder, outcome.failed
            );
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
