//! Message filters and their compilation into `SEARCH` criteria.
//!
//! Dates in IMAP searches have day granularity and are compared against the server's internal
//! date of each message. A bound of "N days" is turned into an instant (now minus N days, a file's
//! modification time, or a UNIX timestamp stored in a file), and that instant into the UTC day
//! it falls on:
//!
//! - `older_than` becomes `BEFORE <day>`, so only messages from strictly earlier days match, and
//!   `older_than 0` means older than the start of today;
//! - `newer_than` becomes `NOT BEFORE <day>`, so messages from that day onwards match, and
//!   `newer_than 0` means everything since the start of today.
//!
//! Negative day counts move the instant into the future. The two directions are complementary:
//! for the same N and the same clock, every message matches exactly one of them. When several sources are given for one direction, the most restrictive wins: the
//! earliest instant for `older_than`, the latest for `newer_than`.

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use crate::client::validate_str;
use crate::error::{Error, Result};

/// Constraint on the `\Seen` flag.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SeenState {
    /// Don't care.
    #[default]
    Any,
    /// Only messages with `\Seen`.
    Seen,
    /// Only messages without `\Seen`.
    Unseen,
}

/// Constraint on the `\Flagged` flag.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FlaggedState {
    /// Don't care.
    #[default]
    Any,
    /// Only messages with `\Flagged`.
    Flagged,
    /// Only messages without `\Flagged`.
    Unflagged,
}

/// Where one date bound comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimeSource {
    /// This many days before now.
    Days(i64),
    /// The UNIX timestamp (seconds, possibly fractional) on the first line of a file.
    TimestampIn(PathBuf),
    /// The modification time of a file.
    MtimeOf(PathBuf),
}

impl TimeSource {
    fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            TimeSource::Days(days) => Duration::try_days(*days)
                .and_then(|d| now.checked_sub_signed(d))
                .ok_or_else(|| Error::Config(format!("{} days is out of range", days))),
            TimeSource::TimestampIn(path) => read_timestamp(path),
            TimeSource::MtimeOf(path) => {
                let modified = fs::metadata(expand_home(path))?.modified()?;
                Ok(DateTime::<Utc>::from(modified))
            }
        }
    }
}

impl fmt::Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSource::Days(days) => write!(f, "{} days", days),
            TimeSource::TimestampIn(path) => write!(f, "timestamp in {}", path.display()),
            TimeSource::MtimeOf(path) => write!(f, "mtime of {}", path.display()),
        }
    }
}

fn read_timestamp(path: &Path) -> Result<DateTime<Utc>> {
    let bad = || Error::Timestamp {
        path: path.to_path_buf(),
    };
    let data = fs::read_to_string(expand_home(path)).map_err(|_| bad())?;
    let line = data.lines().next().unwrap_or("").trim();
    let (secs, frac) = match line.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (line, ""),
    };
    let secs: i64 = secs.parse().map_err(|_| bad())?;
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    // keep nanosecond precision of up to nine fractional digits
    let mut nanos = 0u32;
    for (i, c) in frac.chars().take(9).enumerate() {
        nanos += c.to_digit(10).unwrap_or(0) * 10u32.pow(8 - i as u32);
    }
    Utc.timestamp_opt(secs, nanos).single().ok_or_else(bad)
}

/// `~/x` to `$HOME/x`.
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Which messages of a folder an action applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageFilter {
    /// `\Seen` constraint.
    pub seen: SeenState,
    /// `\Flagged` constraint.
    pub flagged: FlaggedState,
    /// Only messages older than all of these.
    pub older_than: Vec<TimeSource>,
    /// Only messages newer than all of these.
    pub newer_than: Vec<TimeSource>,
    /// Only messages whose `From` contains each of these.
    pub from: Vec<String>,
    /// Only messages whose `From` contains none of these.
    pub not_from: Vec<String>,
}

impl MessageFilter {
    /// All messages without `\Seen`.
    pub fn unseen() -> Self {
        MessageFilter {
            seen: SeenState::Unseen,
            ..Default::default()
        }
    }

    /// All messages with `\Seen`.
    pub fn seen() -> Self {
        MessageFilter {
            seen: SeenState::Seen,
            ..Default::default()
        }
    }

    /// Whether the compiled criteria depend on the clock or on files, and so may change between
    /// polling cycles.
    pub fn is_dynamic(&self) -> bool {
        !self.older_than.is_empty() || !self.newer_than.is_empty()
    }

    /// Compile into `SEARCH` criteria, resolving date bounds against `now`.
    ///
    /// Terms come in a fixed order (seen, flagged, from, not-from, before, not-before) so equal
    /// filters compile to equal strings.
    pub fn compile(&self, now: DateTime<Utc>) -> Result<SearchCriteria> {
        let mut terms = Vec::new();

        match self.seen {
            SeenState::Any => {}
            SeenState::Seen => terms.push("SEEN".to_string()),
            SeenState::Unseen => terms.push("UNSEEN".to_string()),
        }
        match self.flagged {
            FlaggedState::Any => {}
            FlaggedState::Flagged => terms.push("FLAGGED".to_string()),
            FlaggedState::Unflagged => terms.push("UNFLAGGED".to_string()),
        }
        for from in &self.from {
            terms.push(format!("FROM {}", validate_str(from)?));
        }
        for from in &self.not_from {
            terms.push(format!("NOT FROM {}", validate_str(from)?));
        }

        if let Some(instant) = self.bound(&self.older_than, now, |it| it.min())? {
            terms.push(format!("BEFORE {}", imap_date(instant.date_naive())));
        }
        if let Some(instant) = self.bound(&self.newer_than, now, |it| it.max())? {
            terms.push(format!("NOT BEFORE {}", imap_date(instant.date_naive())));
        }

        if terms.is_empty() {
            return Ok(SearchCriteria("(ALL)".to_string()));
        }
        Ok(SearchCriteria(format!("({})", terms.join(" "))))
    }

    fn bound<F>(
        &self,
        sources: &[TimeSource],
        now: DateTime<Utc>,
        pick: F,
    ) -> Result<Option<DateTime<Utc>>>
    where
        F: FnOnce(std::vec::IntoIter<DateTime<Utc>>) -> Option<DateTime<Utc>>,
    {
        let instants = sources
            .iter()
            .map(|s| s.resolve(now))
            .collect::<Result<Vec<_>>>()?;
        Ok(pick(instants.into_iter()))
    }
}

/// `date` in the RFC 3501 `date` syntax, e.g. `7-Feb-2024`.
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// A compiled `SEARCH` criteria string, always parenthesised.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SearchCriteria(String);

impl SearchCriteria {
    /// The criteria as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compiled criteria for one cycle, so every folder and account searched in it uses the same
/// string for the same filter even if the clock crosses midnight mid-cycle.
#[derive(Debug)]
pub struct FilterCache {
    now: DateTime<Utc>,
    compiled: HashMap<MessageFilter, SearchCriteria>,
}

impl FilterCache {
    /// A cache resolving date bounds against `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        FilterCache {
            now,
            compiled: HashMap::new(),
        }
    }

    /// The instant date bounds are resolved against.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The criteria for `filter`, compiling it on first use.
    pub fn get(&mut self, filter: &MessageFilter) -> Result<&SearchCriteria> {
        Ok(match self.compiled.entry(filter.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(filter.compile(self.now)?),
        })
    }
}
