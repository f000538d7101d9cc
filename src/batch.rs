//! Splitting work on a folder into bounded UID batches.
//!
//! `STORE` and metadata `FETCH` batches are bounded by UID count only, which keeps command lines
//! short enough for servers that limit their length. Body `FETCH` batches are additionally bounded
//! by the sum of the messages' sizes, so a dropped connection costs at most one batch of
//! re-downloading. A message larger than the byte budget travels alone.
//!
//! Batches are derived from the UIDs a fresh `SEARCH` returned and are never kept across runs:
//! once any batch was marked, the outstanding set is whatever the next search finds.

use std::fmt;
use std::io::{Read, Write};

use log::{debug, info};

use crate::cancel::CancelToken;
use crate::client::Session;
use crate::conflict::{check_metadata, check_store};
use crate::deliver::RawMessage;
use crate::error::{Error, Result};
use crate::filter::{MessageFilter, SearchCriteria};
use crate::types::{Flag, Uid};

/// Size limits of every kind of batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    /// UIDs per `UID STORE`.
    pub store_number: usize,
    /// UIDs per metadata `UID FETCH`.
    pub fetch_number: usize,
    /// Messages per body `UID FETCH`.
    pub batch_number: usize,
    /// Bytes per body `UID FETCH`, by `RFC822.SIZE`.
    pub batch_size: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        BatchLimits {
            store_number: 150,
            fetch_number: 150,
            batch_number: 150,
            batch_size: 4 * 1024 * 1024,
        }
    }
}

/// Render UIDs as an IMAP sequence set. Runs of consecutive UIDs collapse into ranges; nothing
/// else does, so the set never names a UID that is not in `uids`.
pub fn uid_set(uids: &[Uid]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && end.checked_add(1) == Some(uids[i + 1]) {
            i += 1;
            end = uids[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}:{}", start, end));
        }
        i += 1;
    }
    out
}

/// Consecutive runs of at most `limit` UIDs.
pub fn uid_chunks(uids: &[Uid], limit: usize) -> std::slice::Chunks<'_, Uid> {
    uids.chunks(limit.max(1))
}

/// A group of messages fetched with one body `UID FETCH`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BodyBatch {
    /// The messages, in the order they were packed.
    pub uids: Vec<Uid>,
    /// Their summed `RFC822.SIZE`.
    pub bytes: u64,
}

impl BodyBatch {
    fn fits(&self, size: u32, limits: &BatchLimits) -> bool {
        self.uids.len() < limits.batch_number && self.bytes + u64::from(size) <= limits.batch_size
    }

    fn push(&mut self, uid: Uid, size: u32) {
        self.uids.push(uid);
        self.bytes += u64::from(size);
    }
}

/// Packs `(uid, size)` pairs into [`BodyBatch`]es as metadata arrives.
///
/// Each call to [`extend`](Self::extend) places as many messages as fit into the open batch,
/// first-fit in the given order; when some do not fit the open batch is closed and packing
/// continues with the leftovers. The last, partially filled batch stays open for the next call
/// and is handed out by [`finish`](Self::finish).
#[derive(Debug)]
pub struct BodyBatcher {
    limits: BatchLimits,
    open: BodyBatch,
}

impl BodyBatcher {
    /// A packer for `limits`.
    pub fn new(limits: BatchLimits) -> Self {
        BodyBatcher {
            limits,
            open: BodyBatch::default(),
        }
    }

    /// Add messages, returning every batch that got full.
    pub fn extend<I>(&mut self, items: I) -> Vec<BodyBatch>
    where
        I: IntoIterator<Item = (Uid, u32)>,
    {
        let mut full = Vec::new();
        let mut pending: Vec<(Uid, u32)> = items.into_iter().collect();
        loop {
            let mut leftovers = Vec::new();
            for (uid, size) in pending {
                if self.open.fits(size, &self.limits) {
                    self.open.push(uid, size);
                } else if self.open.uids.is_empty() {
                    // larger than a whole batch on its own
                    let mut alone = BodyBatch::default();
                    alone.push(uid, size);
                    full.push(alone);
                } else {
                    leftovers.push((uid, size));
                }
            }
            if leftovers.is_empty() {
                break;
            }
            full.push(std::mem::take(&mut self.open));
            pending = leftovers;
        }
        full
    }

    /// The open batch, unless it is empty.
    pub fn finish(self) -> Option<BodyBatch> {
        if self.open.uids.is_empty() {
            None
        } else {
            Some(self.open)
        }
    }
}

/// Pack all of `items` at once.
pub fn plan_body_batches<I>(items: I, limits: BatchLimits) -> Vec<BodyBatch>
where
    I: IntoIterator<Item = (Uid, u32)>,
{
    let mut batcher = BodyBatcher::new(limits);
    let mut batches = batcher.extend(items);
    batches.extend(batcher.finish());
    batches
}

/// A flag change applied with `UID STORE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `+FLAGS.SILENT (\Seen)`
    AddSeen,
    /// `-FLAGS.SILENT (\Seen)`
    RemoveSeen,
    /// `+FLAGS.SILENT (\Flagged)`
    AddFlagged,
    /// `-FLAGS.SILENT (\Flagged)`
    RemoveFlagged,
    /// `+FLAGS.SILENT (\Deleted)`, followed by `EXPUNGE` when `expunge` is set.
    Delete {
        /// Expunge after every stored batch.
        expunge: bool,
    },
    /// `+X-GM-LABELS (\Trash)`: GMail's move to trash.
    GmailTrash,
}

impl StoreOp {
    /// The `STORE` data item and value.
    pub fn query(self) -> &'static str {
        match self {
            StoreOp::AddSeen => "+FLAGS.SILENT (\\Seen)",
            StoreOp::RemoveSeen => "-FLAGS.SILENT (\\Seen)",
            StoreOp::AddFlagged => "+FLAGS.SILENT (\\Flagged)",
            StoreOp::RemoveFlagged => "-FLAGS.SILENT (\\Flagged)",
            StoreOp::Delete { .. } => "+FLAGS.SILENT (\\Deleted)",
            StoreOp::GmailTrash => "+X-GM-LABELS (\\Trash)",
        }
    }

    /// The flag the operation leaves set (`true`) or cleared (`false`), if it changes flags.
    pub fn resulting_flag(self) -> Option<(Flag, bool)> {
        match self {
            StoreOp::AddSeen => Some((Flag::Seen, true)),
            StoreOp::RemoveSeen => Some((Flag::Seen, false)),
            StoreOp::AddFlagged => Some((Flag::Flagged, true)),
            StoreOp::RemoveFlagged => Some((Flag::Flagged, false)),
            StoreOp::Delete { .. } => Some((Flag::Deleted, true)),
            StoreOp::GmailTrash => None,
        }
    }

    /// Whether the operation removes mail from the folder.
    pub fn is_destructive(self) -> bool {
        matches!(self, StoreOp::Delete { .. } | StoreOp::GmailTrash)
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::AddSeen => "SEEN",
            StoreOp::RemoveSeen => "UNSEEN",
            StoreOp::AddFlagged => "FLAGGED",
            StoreOp::RemoveFlagged => "UNFLAGGED",
            StoreOp::Delete { expunge: true } => "DELETE",
            StoreOp::Delete { expunge: false } => "DELETE-NOEXPUNGE",
            StoreOp::GmailTrash => "GMAIL-TRASH",
        })
    }
}

/// `UID SEARCH` the selected folder.
pub fn search<T: Read + Write>(
    session: &mut Session<T>,
    criteria: &SearchCriteria,
) -> Result<Vec<Uid>> {
    let uids = session.uid_search(criteria.as_str())?;
    debug!("{} messages match {}", uids.len(), criteria);
    Ok(uids)
}

/// Sizes of one metadata chunk, after cross-checking the reply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// UID and size of every message that can be fetched.
    pub sizes: Vec<(Uid, u32)>,
    /// Requested UIDs that cannot.
    pub missing: Vec<Uid>,
}

/// `UID FETCH <chunk> (UID RFC822.SIZE FLAGS)`. Anything suggesting another client changed the
/// messages since they were searched under `filter` raises the session's conflict flag.
pub fn fetch_metadata<T: Read + Write>(
    session: &mut Session<T>,
    filter: &MessageFilter,
    chunk: &[Uid],
) -> Result<Metadata> {
    let fetches = session.uid_fetch(&uid_set(chunk), "(UID RFC822.SIZE FLAGS)")?;
    let check = check_metadata(filter, chunk, &fetches);
    for reason in check.conflicts {
        session.raise_conflict(reason);
    }
    Ok(Metadata {
        sizes: check.sizes,
        missing: check.missing,
    })
}

/// Bodies of one batch.
#[derive(Debug, Default)]
pub struct Bodies {
    /// Fetched messages, line endings normalised.
    pub messages: Vec<RawMessage>,
    /// Batch members the server sent no body for.
    pub missing: Vec<Uid>,
}

/// `UID FETCH <batch> (BODY.PEEK[])`. `PEEK` keeps the server from setting `\Seen` on its own;
/// marking happens only after delivery.
pub fn fetch_bodies<T: Read + Write>(session: &mut Session<T>, batch: &BodyBatch) -> Result<Bodies> {
    info!(
        "fetching a batch of {} messages ({} bytes)",
        batch.uids.len(),
        batch.bytes
    );
    let fetches = session.uid_fetch(&uid_set(&batch.uids), "(BODY.PEEK[])")?;

    let mut bodies = Bodies::default();
    for mut fetch in fetches {
        match (fetch.uid, fetch.take_body()) {
            (Some(uid), Some(body)) if batch.uids.contains(&uid) => {
                if bodies.messages.iter().any(|m| m.uid == uid) {
                    continue;
                }
                bodies.messages.push(RawMessage::from_wire(uid, &body));
            }
            _ => {
                session.raise_conflict(format!(
                    "unexpected FETCH response #{} (UID {:?}) while fetching bodies",
                    fetch.message, fetch.uid
                ));
            }
        }
    }
    for &uid in &batch.uids {
        if !bodies.messages.iter().any(|m| m.uid == uid) {
            bodies.missing.push(uid);
        }
    }
    if !bodies.missing.is_empty() {
        session.raise_conflict(format!(
            "FETCH did not return the bodies of {} messages",
            bodies.missing.len()
        ));
    }
    Ok(bodies)
}

/// What a sequence of `STORE`s achieved.
#[derive(Debug, Default)]
pub struct StoreOutcome {
    /// Messages in batches the server acknowledged.
    pub stored: usize,
    /// Messages in batches that failed or were never sent.
    pub failed: usize,
    /// Why.
    pub errors: Vec<Error>,
}

/// Apply `op` to `uids` in batches of `store_number`.
///
/// A batch refused with `NO`/`BAD` is counted as failed and the next one is tried; a transport
/// error ends the whole sequence. With `cancel` given, no new batch starts after an interrupt;
/// marks that confirm deliveries pass `None` so they always complete.
pub fn store<T: Read + Write>(
    session: &mut Session<T>,
    uids: &[Uid],
    op: StoreOp,
    store_number: usize,
    cancel: Option<&CancelToken>,
) -> StoreOutcome {
    let mut outcome = StoreOutcome::default();
    let mut chunks = uid_chunks(uids, store_number);
    while let Some(chunk) = chunks.next() {
        if let Some(Err(e)) = cancel.map(CancelToken::check) {
            outcome.failed += chunk.len() + chunks.by_ref().map(<[Uid]>::len).sum::<usize>();
            outcome.errors.push(e);
            break;
        }

        match op {
            StoreOp::Delete { .. } => info!("deleting a batch of {} messages", chunk.len()),
            StoreOp::GmailTrash => info!(
                "moving a batch of {} messages to `{}`",
                chunk.len(),
                crate::account::GMAIL_TRASH
            ),
            _ => info!("marking a batch of {} messages as {}", chunk.len(), op),
        }

        let result = session
            .uid_store(&uid_set(chunk), op.query())
            .and_then(|fetches| {
                for reason in check_store(op, chunk, &fetches) {
                    session.raise_conflict(reason);
                }
                if let StoreOp::Delete { expunge: true } = op {
                    session.expunge()?;
                }
                Ok(())
            });

        match result {
            Ok(()) => outcome.stored += chunk.len(),
            Err(e) if e.breaks_connection() => {
                outcome.failed += chunk.len() + chunks.by_ref().map(<[Uid]>::len).sum::<usize>();
                outcome.errors.push(e);
                break;
            }
            Err(e) => {
                outcome.failed += chunk.len();
                outcome.errors.push(e);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::MockStream;
    use proptest::prelude::*;

    #[test]
    fn uid_sets() {
        assert_eq!(uid_set(&[1, 2, 3, 5]), "1:3,5");
        assert_eq!(uid_set(&[7]), "7");
        assert_eq!(uid_set(&[9, 3, 4]), "9,3:4");
        assert_eq!(uid_set(&[]), "");
        assert_eq!(uid_set(&[u32::MAX - 1, u32::MAX]), format!("{}:{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn store_limit_two() {
        let chunks: Vec<&[Uid]> = uid_chunks(&[1, 2, 3], 2).collect();
        assert_eq!(chunks, vec![&[1, 2][..], &[3][..]]);
    }

    #[test]
    fn oversized_message_travels_alone() {
        let limits = BatchLimits {
            batch_number: 10,
            batch_size: 100,
            ..Default::default()
        };
        let batches = plan_body_batches(vec![(1, 40), (2, 500), (3, 50), (4, 20)], limits);
        assert_eq!(
            batches,
            vec![
                BodyBatch {
                    uids: vec![1, 3],
                    bytes: 90
                },
                BodyBatch {
                    uids: vec![2],
                    bytes: 500
                },
                BodyBatch {
                    uids: vec![4],
                    bytes: 20
                },
            ]
        );
    }

    #[test]
    fn open_batch_carries_over() {
        let limits = BatchLimits {
            batch_number: 3,
            batch_size: 1000,
            ..Default::default()
        };
        let mut batcher = BodyBatcher::new(limits);
        assert!(batcher.extend(vec![(1, 10), (2, 10)]).is_empty());
        let full = batcher.extend(vec![(3, 10), (4, 10)]);
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].uids, vec![1, 2, 3]);
        assert_eq!(batcher.finish().unwrap().uids, vec![4]);
    }

    #[test]
    fn store_ops() {
        assert_eq!(StoreOp::AddSeen.query(), "+FLAGS.SILENT (\\Seen)");
        assert_eq!(StoreOp::GmailTrash.query(), "+X-GM-LABELS (\\Trash)");
        assert!(StoreOp::Delete { expunge: false }.is_destructive());
        assert!(!StoreOp::RemoveFlagged.is_destructive());
    }

    #[test]
    fn store_expunges_each_batch() {
        let mut s = Session::over(MockStream::new(
            b"a1 OK stored\r\n\
              * 1 EXPUNGE\r\n\
              * 1 EXPUNGE\r\n\
              a2 OK expunged\r\n\
              a3 OK stored\r\n\
              * 1 EXPUNGE\r\n\
              a4 OK expunged\r\n"
                .to_vec(),
        ));
        let out = store(&mut s, &[4, 5, 9], StoreOp::Delete { expunge: true }, 2, None);
        assert_eq!(out.stored, 3);
        assert_eq!(out.failed, 0);
        assert_eq!(
            String::from_utf8(s.stream.get_ref().written_buf.clone()).unwrap(),
            "a1 UID STORE 4:5 +FLAGS.SILENT (\\Deleted)\r\n\
             a2 EXPUNGE\r\n\
             a3 UID STORE 9 +FLAGS.SILENT (\\Deleted)\r\n\
             a4 EXPUNGE\r\n"
        );
        assert!(!s.conflict().is_raised());
    }

    #[test]
    fn store_continues_after_refusal() {
        let mut s = Session::over(MockStream::new(
            b"a1 NO read-only\r\na2 OK stored\r\n".to_vec(),
        ));
        let out = store(&mut s, &[1, 2, 3], StoreOp::AddSeen, 2, None);
        assert_eq!(out.stored, 1);
        assert_eq!(out.failed, 2);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn store_stops_when_cancelled() {
        let mut s = Session::over(MockStream::new(Vec::new()));
        let token = CancelToken::new();
        token.interrupt();
        let out = store(&mut s, &[1, 2, 3], StoreOp::AddSeen, 2, Some(&token));
        assert_eq!(out.stored, 0);
        assert_eq!(out.failed, 3);
        assert!(s.stream.get_ref().written_buf.is_empty());
    }

    #[test]
    fn metadata_conflicts_raise_the_flag() {
        let mut s = Session::over(MockStream::new(
            b"* 1 FETCH (UID 3 RFC822.SIZE 10 FLAGS (\\Seen))\r\n\
              * 2 FETCH (UID 4 RFC822.SIZE 20 FLAGS ())\r\n\
              a1 OK done\r\n"
                .to_vec(),
        ));
        let meta = fetch_metadata(&mut s, &MessageFilter::unseen(), &[3, 4]).unwrap();
        assert_eq!(meta.sizes, vec![(3, 10), (4, 20)]);
        assert!(s.conflict().is_raised());
    }

    #[test]
    fn bodies_are_normalised() {
        let mut s = Session::over(MockStream::new(
            b"* 1 FETCH (UID 3 BODY[] {9}\r\nA: b\r\n\r\nc)\r\na1 OK done\r\n".to_vec(),
        ));
        let batch = BodyBatch {
            uids: vec![3, 4],
            bytes: 20,
        };
        let bodies = fetch_bodies(&mut s, &batch).unwrap();
        assert_eq!(bodies.messages.len(), 1);
        assert_eq!(bodies.messages[0].data, b"A: b\n\nc".to_vec());
        assert_eq!(bodies.missing, vec![4]);
        assert_eq!(
            String::from_utf8(s.stream.get_ref().written_buf.clone()).unwrap(),
            "a1 UID FETCH 3:4 (BODY.PEEK[])\r\n"
        );
    }

    proptest! {
        #[test]
        fn chunks_cover_exactly_once(
            uids in proptest::collection::btree_set(1u32..100_000, 0..500),
            limit in 1usize..200,
        ) {
            let uids: Vec<Uid> = uids.into_iter().collect();
            let chunks: Vec<&[Uid]> = uid_chunks(&uids, limit).collect();
            prop_assert_eq!(chunks.len(), (uids.len() + limit - 1) / limit);
            prop_assert!(chunks.iter().all(|c| c.len() <= limit));
            let flat: Vec<Uid> = chunks.concat();
            prop_assert_eq!(flat, uids);
        }

        #[test]
        fn body_batches_respect_limits(
            sizes in proptest::collection::vec(1u32..10_000, 0..300),
            batch_number in 1usize..50,
            batch_size in 1u64..40_000,
        ) {
            let limits = BatchLimits { batch_number, batch_size, ..Default::default() };
            let items: Vec<(Uid, u32)> = sizes.iter().enumerate().map(|(i, s)| (i as Uid + 1, *s)).collect();
            let batches = plan_body_batches(items.clone(), limits);

            let mut seen: Vec<Uid> = batches.iter().flat_map(|b| b.uids.clone()).collect();
            seen.sort_unstable();
            let all: Vec<Uid> = items.iter().map(|(u, _)| *u).collect();
            prop_assert_eq!(seen, all);

            for b in &batches {
                prop_assert!(!b.uids.is_empty());
                prop_assert!(b.uids.len() <= batch_number);
                let sum: u64 = b.uids.iter().map(|u| u64::from(sizes[*u as usize - 1])).sum();
                prop_assert_eq!(sum, b.bytes);
                prop_assert!(sum <= batch_size || b.uids.len() == 1);
            }
        }

        #[test]
        fn uid_set_names_only_given_uids(
            uids in proptest::collection::btree_set(1u32..1000, 1..100),
        ) {
            let uids: Vec<Uid> = uids.into_iter().collect();
            let mut named = Vec::new();
            for part in uid_set(&uids).split(',') {
                match part.split_once(':') {
                    Some((a, b)) => named.extend(a.parse::<u32>().unwrap()..=b.parse::<u32>().unwrap()),
                    None => named.push(part.parse::<u32>().unwrap()),
                }
            }
            prop_assert_eq!(named, uids);
        }
    }
}
