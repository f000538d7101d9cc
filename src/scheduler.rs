//! Repeating a cycle over all accounts.
//!
//! Every cycle, the first one included, starts after a random delay of up to `jitter`, so that a
//! server cannot tell from the timing of our connection how long we spent on the servers polled
//! before it. Cycles are spaced `every` apart measured from start to start; a slow cycle shortens
//! the following pause instead of pushing all later cycles back. The pause never drops below
//! `floor`.

use std::time::{Duration, Instant};

use log::{info, warn};
use rand::Rng;

use crate::account::Account;
use crate::cancel::{CancelToken, Wakeup};
use crate::client_builder::Connector;
use crate::error::{Error, Result};
use crate::orchestrator::{Orchestrator, Plan};
use crate::outcome::{Hooks, RunOutcome};

/// When to repeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// Start-to-start distance of cycles.
    pub every: Duration,
    /// Upper bound of the random delay added before every cycle.
    pub jitter: Duration,
    /// Shortest pause between two cycles.
    pub floor: Duration,
}

impl Schedule {
    /// Every `every`, with the default jitter and floor of one minute each.
    pub fn every(every: Duration) -> Self {
        Schedule {
            every,
            jitter: Duration::from_secs(60),
            floor: Duration::from_secs(60),
        }
    }

    /// The pause after a cycle that was meant to be followed by another at `nominal_next`,
    /// given it is now `now` and `jitter` was drawn.
    pub fn pause(&self, nominal_next: Instant, now: Instant, jitter: Duration) -> Duration {
        let wait = (nominal_next + jitter).saturating_duration_since(now);
        wait.max(self.floor)
    }

    fn draw_jitter(&self) -> Duration {
        let max = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Commands run at the end of every cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookCommands {
    /// Run when something changed.
    pub on_success: Vec<String>,
    /// Run when something failed.
    pub on_failure: Vec<String>,
}

/// Runs cycles and their end-of-cycle hooks.
#[derive(Debug)]
pub struct Scheduler<C: Connector, H: Hooks> {
    orchestrator: Orchestrator<C>,
    hooks: H,
    commands: HookCommands,
}

impl<C: Connector, H: Hooks> Scheduler<C, H> {
    /// A scheduler running cycles through `orchestrator` and reporting through `hooks`.
    pub fn new(orchestrator: Orchestrator<C>, hooks: H, commands: HookCommands) -> Self {
        Scheduler {
            orchestrator,
            hooks,
            commands,
        }
    }

    /// Run a single cycle right away.
    pub fn run_once(&mut self, accounts: &[Account], plan: &Plan, cancel: &CancelToken) -> RunOutcome {
        let outcome = self.orchestrator.run_cycle(accounts, plan, cancel);
        outcome.dispatch(&mut self.hooks, &self.commands.on_success, &self.commands.on_failure);
        outcome
    }

    /// Run cycles on `schedule` until cancelled. Returns the number of completed cycles, or
    /// `Error::Aborted` when a cycle was stopped by a paranoid delivery failure.
    pub fn run(
        &mut self,
        accounts: &[Account],
        plan: &Plan,
        schedule: &Schedule,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let mut cycles = 0;
        let first = schedule.draw_jitter();
        if !first.is_zero() {
            info!("sleeping for {:?} before the first cycle", first);
        }
        if cancel.sleep(first) == Wakeup::Cancelled {
            return Ok(cycles);
        }

        loop {
            let nominal_next = Instant::now() + schedule.every;
            let outcome = self.run_once(accounts, plan, cancel);
            cycles += 1;
            if let Some(reason) = outcome.aborted {
                return Err(Error::Aborted(reason));
            }
            if outcome.interrupted || cancel.is_cancelled() {
                return Ok(cycles);
            }

            let pause = schedule.pause(nominal_next, Instant::now(), schedule.draw_jitter());
            info!("sleeping for {:?}", pause);
            match cancel.sleep(pause) {
                Wakeup::Elapsed => {}
                Wakeup::Woken => info!("woken up early"),
                Wakeup::Cancelled => {
                    warn!("interrupted while sleeping");
                    return Ok(cycles);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{ConnectionMode, Password};
    use crate::deliver::SinkSpec;
    use crate::fetch::{FetchFailurePolicy, MarkAction};
    use crate::filter::MessageFilter;
    use crate::folders::FolderSelector;
    use crate::mock_server::MockServer;
    use crate::orchestrator::{Action, ActionKind};
    use crate::outcome::Notice;

    /// Records hook invocations and interrupts the token after `stop_after` failure notices.
    struct StopAfter {
        calls: Vec<String>,
        cancel: CancelToken,
        stop_after: usize,
    }

    impl Hooks for StopAfter {
        fn invoke(&mut self, command: &str, _notice: &Notice) {
            self.calls.push(command.to_string());
            if self.calls.iter().filter(|c| *c == "failed").count() >= self.stop_after {
                self.cancel.interrupt();
            }
        }
    }

    fn quick() -> Schedule {
        Schedule {
            every: Duration::from_millis(20),
            jitter: Duration::from_millis(5),
            floor: Duration::ZERO,
        }
    }

    fn failing_plan() -> Plan {
        Plan {
            actions: vec![Action {
                kind: ActionKind::Fetch {
                    sink: SinkSpec::Mda("cat > /dev/null; exit 1".into()),
                    mark: MarkAction::Auto,
                    policy: FetchFailurePolicy::Yolo,
                    new_mail_cmd: vec!["new".into()],
                },
                filter: MessageFilter::unseen(),
                folders: FolderSelector::only(["INBOX"]),
                dry_run: false,
            }],
            ..Default::default()
        }
    }

    fn account() -> Account {
        Account::new("mail.example.org", ConnectionMode::Ssl, "u", Password::new("p"))
    }

    #[test]
    fn pause_is_self_correcting() {
        let s = Schedule {
            every: Duration::from_secs(600),
            jitter: Duration::from_secs(60),
            floor: Duration::from_secs(60),
        };
        let start = Instant::now();
        let next = start + s.every;
        // a 100 second cycle leaves 500 seconds plus jitter
        assert_eq!(
            s.pause(next, start + Duration::from_secs(100), Duration::from_secs(7)),
            Duration::from_secs(507)
        );
        // an overlong cycle still gets the floor
        assert_eq!(
            s.pause(next, start + Duration::from_secs(900), Duration::ZERO),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let s = quick();
        for _ in 0..100 {
            assert!(s.draw_jitter() <= s.jitter);
        }
        assert_eq!(Schedule::every(Duration::from_secs(1)).floor, Duration::from_secs(60));
    }

    #[test]
    fn runs_until_interrupted() {
        let server = MockServer::default();
        server.state().add("INBOX", "Subject: x\n\n", &[]);
        let cancel = CancelToken::new();
        let hooks = StopAfter {
            calls: Vec::new(),
            cancel: cancel.clone(),
            stop_after: 3,
        };
        let commands = HookCommands {
            on_success: vec!["ok".into()],
            on_failure: vec!["failed".into()],
        };
        let mut scheduler = Scheduler::new(Orchestrator::new(server.clone()), hooks, commands);

        let cycles = scheduler
            .run(&[account()], &failing_plan(), &quick(), &cancel)
            .unwrap();
        assert_eq!(cycles, 3);
        // nothing was delivered, so neither the new-mail nor the success hook ran
        assert_eq!(scheduler.hooks.calls, vec!["failed", "failed", "failed"]);
        assert_eq!(server.state().sent("LOGOUT").len(), 3);
    }

    #[test]
    fn wake_starts_the_next_cycle_early() {
        let server = MockServer::default();
        server.state().add("INBOX", "Subject: x\n\n", &[]);
        let cancel = CancelToken::new();
        let hooks = StopAfter {
            calls: Vec::new(),
            cancel: cancel.clone(),
            stop_after: 2,
        };
        let commands = HookCommands {
            on_success: Vec::new(),
            on_failure: vec!["failed".into()],
        };
        let mut scheduler = Scheduler::new(Orchestrator::new(server.clone()), hooks, commands);
        let hour = Schedule {
            every: Duration::from_secs(3600),
            jitter: Duration::ZERO,
            floor: Duration::from_secs(3600),
        };

        // wakes sent before the sleep starts are dropped, so keep nudging until it is over
        let waker = cancel.clone();
        let nudger = std::thread::spawn(move || {
            while !waker.is_cancelled() {
                std::thread::sleep(Duration::from_millis(20));
                waker.wake();
            }
        });
        let started = Instant::now();
        let cycles = scheduler
            .run(&[account()], &failing_plan(), &hour, &cancel)
            .unwrap();
        nudger.join().unwrap();

        assert_eq!(cycles, 2);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(server.state().sent("LOGOUT").len(), 2);
    }

    #[test]
    fn cancelled_before_the_first_cycle() {
        let server = MockServer::default();
        let cancel = CancelToken::new();
        cancel.interrupt();
        let hooks = StopAfter {
            calls: Vec::new(),
            cancel: cancel.clone(),
            stop_after: 1,
        };
        let mut scheduler =
            Scheduler::new(Orchestrator::new(server.clone()), hooks, HookCommands::default());
        let cycles = scheduler
            .run(&[account()], &failing_plan(), &quick(), &cancel)
            .unwrap();
        assert_eq!(cycles, 0);
        assert!(server.state().commands.is_empty());
    }
}
