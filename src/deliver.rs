//! Delivery sinks: where fetched messages end up.
//!
//! A sink receives a whole body batch at once and reports, per message, whether the message is
//! now durably stored. Only those messages may be marked on the server.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error};
use nix::fcntl::{flock, FlockArg};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::filter::expand_home;
use crate::types::Uid;

/// A message body as fetched, with line endings normalised to `\n`.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// The message's UID in the folder it was fetched from.
    pub uid: Uid,
    /// The message.
    pub data: Vec<u8>,
}

impl RawMessage {
    /// Wrap a body as sent by the server, turning `\r\n` into `\n`.
    pub fn from_wire(uid: Uid, body: &[u8]) -> Self {
        let mut data = Vec::with_capacity(body.len());
        let mut i = 0;
        while i < body.len() {
            if body[i] == b'\r' && body.get(i + 1) == Some(&b'\n') {
                i += 1;
                continue;
            }
            data.push(body[i]);
            i += 1;
        }
        RawMessage { uid, data }
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("uid", &self.uid)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What happened to one message of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// The message.
    pub uid: Uid,
    /// The sink accepted it.
    pub delivered: bool,
    /// It may be marked on the server.
    pub markable: bool,
}

impl DeliveryOutcome {
    /// Stored for good.
    pub fn delivered(uid: Uid) -> Self {
        DeliveryOutcome {
            uid,
            delivered: true,
            markable: true,
        }
    }

    /// Not stored.
    pub fn failed(uid: Uid) -> Self {
        DeliveryOutcome {
            uid,
            delivered: false,
            markable: false,
        }
    }
}

/// Something that stores fetched messages.
pub trait DeliverySink {
    /// Store `messages`, returning one outcome per message in the same order. A message counts
    /// as delivered only once it would survive a crash.
    fn deliver(&mut self, messages: &[RawMessage]) -> Vec<DeliveryOutcome>;
}

impl<S: DeliverySink + ?Sized> DeliverySink for Box<S> {
    fn deliver(&mut self, messages: &[RawMessage]) -> Vec<DeliveryOutcome> {
        (**self).deliver(messages)
    }
}

/// How a fetch action delivers, as configured.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SinkSpec {
    /// Into a Maildir at this path.
    Maildir(PathBuf),
    /// Through this shell command, once per message, message on stdin.
    Mda(String),
}

impl SinkSpec {
    /// Open the sink.
    pub fn open(&self) -> Result<Box<dyn DeliverySink>> {
        Ok(match self {
            SinkSpec::Maildir(path) => Box::new(Maildir::open(path)?),
            SinkSpec::Mda(command) => Box::new(Mda::new(command.clone())),
        })
    }
}

impl fmt::Display for SinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSpec::Maildir(path) => write!(f, "Maildir `{}`", path.display()),
            SinkSpec::Mda(command) => write!(f, "MDA `{}`", command),
        }
    }
}

/// A Maildir: `tmp/`, `new/` and `cur/` under one directory.
///
/// A batch is written to `tmp/` and synced, then moved into `new/` under a name derived from the
/// content hash while holding an exclusive lock on `new/`, and finally `new/` itself is synced.
#[derive(Debug)]
pub struct Maildir {
    root: PathBuf,
    host: String,
    pid: u32,
    written: u64,
}

impl Maildir {
    /// Open the Maildir at `path`, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self> {
        let root = expand_home(path);
        for sub in ["tmp", "new", "cur"] {
            fs::create_dir_all(root.join(sub)).map_err(|e| {
                Error::Delivery(format!("failed to create `{}`: {}", root.join(sub).display(), e))
            })?;
        }
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string())
            .replace('/', "\\057")
            .replace(':', "\\072");
        Ok(Maildir {
            root,
            host,
            pid: std::process::id(),
            written: 0,
        })
    }

    fn write_tmp(&mut self, message: &RawMessage) -> std::io::Result<PathBuf> {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let path = self.root.join("tmp").join(format!(
            "IAP_{}_{}_{}.{},S={}.part",
            self.pid,
            epoch_ms,
            self.written,
            self.host,
            message.data.len()
        ));
        self.written += 1;

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let written = file.write_all(&message.data).and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(path)
    }

    fn final_name(&self, new: &Path, message: &RawMessage) -> PathBuf {
        let hash = format!("{:x}", Sha256::digest(&message.data));
        let mut n = 0u64;
        loop {
            let candidate = new.join(format!(
                "{}_{}.{},S={}",
                hash,
                n,
                self.host,
                message.data.len()
            ));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

impl DeliverySink for Maildir {
    fn deliver(&mut self, messages: &[RawMessage]) -> Vec<DeliveryOutcome> {
        let mut outcomes: Vec<DeliveryOutcome> =
            messages.iter().map(|m| DeliveryOutcome::failed(m.uid)).collect();

        let mut staged = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            match self.write_tmp(message) {
                Ok(path) => staged.push((i, path)),
                Err(e) => error!(
                    "failed to write UID {} to `{}`: {}",
                    message.uid,
                    self.root.display(),
                    e
                ),
            }
        }
        if staged.is_empty() {
            return outcomes;
        }

        let new = self.root.join("new");
        let lock = match File::open(&new) {
            Ok(dir) => match flock(dir.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => Some(dir),
                Err(e) => {
                    error!("failed to lock `{}`: {}", new.display(), e);
                    None
                }
            },
            Err(e) => {
                error!("failed to open `{}`: {}", new.display(), e);
                None
            }
        };
        let lock = match lock {
            Some(lock) => lock,
            None => {
                for (_, path) in staged {
                    let _ = fs::remove_file(path);
                }
                return outcomes;
            }
        };

        for (i, tmp) in staged {
            let message = &messages[i];
            let target = self.final_name(&new, message);
            match fs::rename(&tmp, &target) {
                Ok(()) => {
                    debug!("delivered UID {} to `{}`", message.uid, target.display());
                    outcomes[i] = DeliveryOutcome::delivered(message.uid);
                }
                Err(e) => {
                    error!("failed to move `{}` into `{}`: {}", tmp.display(), new.display(), e);
                    let _ = fs::remove_file(tmp);
                }
            }
        }

        // renames are only durable once the directory itself is synced
        if let Err(e) = lock.sync_all() {
            error!("failed to sync `{}`: {}", new.display(), e);
            for outcome in &mut outcomes {
                *outcome = DeliveryOutcome::failed(outcome.uid);
            }
        }
        drop(lock);
        outcomes
    }
}

/// An external mail delivery agent run through `sh -c`, one process per message.
#[derive(Clone, Debug)]
pub struct Mda {
    command: String,
}

impl Mda {
    /// Deliver through `command`.
    pub fn new(command: String) -> Self {
        Mda { command }
    }

    fn deliver_one(&self, message: &RawMessage) -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Delivery(format!("failed to spawn `{}`: {}", self.command, e)))?;

        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&message.data).and_then(|()| stdin.flush()),
            None => Ok(()),
        };
        let status = child.wait()?;

        if let Err(e) = written {
            return Err(Error::Delivery(format!(
                "failed to feed UID {} to `{}`: {}",
                message.uid, self.command, e
            )));
        }
        if !status.success() {
            return Err(Error::Delivery(format!(
                "`{}` failed on UID {}: {}",
                self.command, message.uid, status
            )));
        }
        Ok(())
    }
}

impl DeliverySink for Mda {
    fn deliver(&mut self, messages: &[RawMessage]) -> Vec<DeliveryOutcome> {
        messages
            .iter()
            .map(|message| match self.deliver_one(message) {
                Ok(()) => DeliveryOutcome::delivered(message.uid),
                Err(e) => {
                    error!("{}", e);
                    DeliveryOutcome::failed(message.uid)
                }
            })
            .collect()
    }
}

/// A sink that keeps messages in memory and fails the UIDs it is told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub(crate) stored: Vec<RawMessage>,
    pub(crate) fail: std::collections::HashSet<Uid>,
}

#[cfg(test)]
impl DeliverySink for MemorySink {
    fn deliver(&mut self, messages: &[RawMessage]) -> Vec<DeliveryOutcome> {
        messages
            .iter()
            .map(|m| {
                if self.fail.contains(&m.uid) {
                    DeliveryOutcome::failed(m.uid)
                } else {
                    self.stored.push(m.clone());
                    DeliveryOutcome::delivered(m.uid)
                }
            })
            .collect()
    }
}
