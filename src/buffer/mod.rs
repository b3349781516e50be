//! # Event Buffer Module
//!
//! Ordered, durable, capacity-bounded queue of captured events awaiting
//! delivery.
//!
//! This module handles:
//! - Appending new events (the only insertion path)
//! - Returning pending events in creation order
//! - Delivery state transitions, each journaled before it is applied
//! - Evicting the oldest `Failed` entry when full; never `Pending` or `InFlight`
//! - Moving undeliverable events to the dead-letter store
//! - Recovering after a restart: `InFlight` entries become `Pending` again

pub mod dead_letter;
pub mod journal;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::BufferError;
use crate::model::{CaptureEvent, DeliveryState, EventId};
use journal::{Journal, JournalOp};

const JOURNAL_FILE: &str = "events.jsonl";
const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";

/// Reason recorded for Failed entries evicted to make room
pub const EVICTED_REASON: &str = "evicted: buffer at capacity";

/// Buffer handle shared by the capture path and the delivery worker
pub type SharedBuffer = Arc<Mutex<EventBuffer>>;

/// A buffered event together with its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Append order; defines creation order within the buffer
    pub seq: u64,
    pub event: CaptureEvent,
    pub retry_count: u32,
    /// Earliest time a retry may be attempted
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl BufferedEvent {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Entry counts by delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl BufferCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.failed
    }
}

/// Durable FIFO of capture events.
#[derive(Debug)]
pub struct EventBuffer {
    entries: BTreeMap<u64, BufferedEvent>,
    index: HashMap<EventId, u64>,
    next_seq: u64,
    capacity: usize,
    compact_after_ops: usize,
    journal: Journal,
    dead_letters: DeadLetterStore,
}

impl EventBuffer {
    /// Opens the buffer stored in `dir`, replaying its journal.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the journal and dead-letter files
    /// * `capacity` - Maximum number of buffered entries
    /// * `compact_after_ops` - Journal length that triggers compaction
    ///
    /// # Errors
    ///
    /// Returns error if the files cannot be opened or a journal record before
    /// the last line is corrupt.
    pub fn open<P: AsRef<Path>>(dir: P, capacity: usize, compact_after_ops: usize) -> Result<Self, BufferError> {
        let dir = dir.as_ref();
        let (journal, ops) = Journal::open(dir.join(JOURNAL_FILE))?;
        let dead_letters = DeadLetterStore::open(dir.join(DEAD_LETTER_FILE), capacity)?;

        let mut buffer = Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            capacity,
            compact_after_ops,
            journal,
            dead_letters,
        };

        let replayed = ops.len();
        for op in ops {
            buffer.apply(op);
        }

        let mut recovered = 0;
        for entry in buffer.entries.values_mut() {
            if entry.event.delivery_state() == &DeliveryState::InFlight {
                entry.event.set_delivery_state(DeliveryState::Pending);
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} in-flight events as pending", recovered);
        }

        if replayed > buffer.entries.len() || recovered > 0 {
            buffer.journal.compact(buffer.entries.values())?;
        }

        info!(
            "Opened event buffer at {} ({} entries, capacity {})",
            dir.display(),
            buffer.entries.len(),
            capacity
        );
        Ok(buffer)
    }

    /// Adds a new event as `Pending`.
    ///
    /// Returns the id of a `Failed` entry evicted to make room, if any.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the id is already buffered, `Full` if at capacity with
    /// no `Failed` entry to evict.
    pub fn append(&mut self, mut event: CaptureEvent) -> Result<Option<EventId>, BufferError> {
        if self.index.contains_key(&event.id()) {
            return Err(BufferError::Duplicate(event.id()));
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            let oldest_failed = self
                .entries
                .values()
                .find(|e| e.event.delivery_state().is_failed())
                .map(|e| e.event.id());

            match oldest_failed {
                Some(id) => {
                    warn!("Event buffer full, evicting failed event {}", id);
                    self.dead_letter(id, EVICTED_REASON)?;
                    evicted = Some(id);
                }
                None => {
                    return Err(BufferError::Full {
                        capacity: self.capacity,
                    });
                }
            }
        }

        event.set_delivery_state(DeliveryState::Pending);
        let entry = BufferedEvent {
            seq: self.next_seq,
            event,
            retry_count: 0,
            next_attempt_at: None,
        };

        let op = JournalOp::Append { entry };
        self.journal.record(&op)?;
        debug!("Buffered event (seq {})", self.next_seq);
        self.apply(op);
        self.maybe_compact()?;

        Ok(evicted)
    }

    /// Up to `max_n` pending events in creation order.
    pub fn peek_batch(&self, max_n: usize) -> Vec<CaptureEvent> {
        self.entries
            .values()
            .filter(|e| e.event.delivery_state().is_pending())
            .take(max_n)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Up to `max_n` pending entries whose retry backoff has elapsed at `now`.
    pub fn peek_due(&self, max_n: usize, now: DateTime<Utc>) -> Vec<BufferedEvent> {
        self.entries
            .values()
            .filter(|e| e.event.delivery_state().is_pending() && e.is_due(now))
            .take(max_n)
            .cloned()
            .collect()
    }

    /// Marks a pending event as being sent.
    pub fn mark_in_flight(&mut self, id: EventId) -> Result<(), BufferError> {
        let entry = self.entry(id)?;
        let (retry_count, next_attempt_at) = (entry.retry_count, entry.next_attempt_at);
        self.transition(id, DeliveryState::InFlight, retry_count, next_attempt_at)
    }

    /// Removes a delivered event and returns it in the `Delivered` state.
    pub fn mark_delivered(&mut self, id: EventId) -> Result<CaptureEvent, BufferError> {
        self.entry(id)?;
        let op = JournalOp::Remove { id };
        self.journal.record(&op)?;

        let mut event = self.remove(id)?.event;
        event.set_delivery_state(DeliveryState::Delivered);
        self.maybe_compact()?;
        Ok(event)
    }

    /// Marks an event as permanently failed. It stays buffered until evicted.
    pub fn mark_failed(&mut self, id: EventId, reason: &str) -> Result<(), BufferError> {
        let retry_count = self.entry(id)?.retry_count;
        let state = DeliveryState::Failed {
            reason: reason.to_string(),
        };
        self.transition(id, state, retry_count, None)
    }

    /// Returns an event to `Pending` with an incremented retry count.
    pub fn schedule_retry(
        &mut self,
        id: EventId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), BufferError> {
        self.entry(id)?;
        self.transition(id, DeliveryState::Pending, retry_count, Some(next_attempt_at))
    }

    /// Moves an event to the dead-letter store.
    pub fn dead_letter(&mut self, id: EventId, reason: &str) -> Result<DeadLetterRecord, BufferError> {
        let entry = self.entry(id)?.clone();
        let record = DeadLetterRecord {
            event: entry.event,
            reason: reason.to_string(),
            retry_count: entry.retry_count,
            dead_lettered_at: Utc::now(),
        };

        self.dead_letters.push(record.clone())?;
        self.journal.record(&JournalOp::Remove { id })?;
        self.remove(id)?;
        warn!("Dead-lettered event {} after {} retries: {}", id, record.retry_count, reason);
        Ok(record)
    }

    /// Returns `InFlight` entries left by an interrupted send to `Pending`.
    pub fn reclaim_in_flight(&mut self) -> Result<usize, BufferError> {
        let stale: Vec<(EventId, u32, Option<DateTime<Utc>>)> = self
            .entries
            .values()
            .filter(|e| e.event.delivery_state() == &DeliveryState::InFlight)
            .map(|e| (e.event.id(), e.retry_count, e.next_attempt_at))
            .collect();

        for (id, retry_count, next_attempt_at) in &stale {
            self.transition(*id, DeliveryState::Pending, *retry_count, *next_attempt_at)?;
        }
        if !stale.is_empty() {
            warn!("Reclaimed {} in-flight events", stale.len());
        }
        Ok(stale.len())
    }

    pub fn get(&self, id: EventId) -> Option<&BufferedEvent> {
        self.index.get(&id).and_then(|seq| self.entries.get(seq))
    }

    pub fn counts(&self) -> BufferCounts {
        let mut counts = BufferCounts::default();
        for entry in self.entries.values() {
            match entry.event.delivery_state() {
                DeliveryState::Pending => counts.pending += 1,
                DeliveryState::InFlight => counts.in_flight += 1,
                DeliveryState::Failed { .. } => counts.failed += 1,
                DeliveryState::Delivered => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent dead letters, at most `capacity` of them.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.recent()
    }

    fn entry(&self, id: EventId) -> Result<&BufferedEvent, BufferError> {
        self.get(id).ok_or(BufferError::NotFound(id))
    }

    fn transition(
        &mut self,
        id: EventId,
        state: DeliveryState,
        retry_count: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<(), BufferError> {
        let op = JournalOp::Transition {
            id,
            state,
            retry_count,
            next_attempt_at,
        };
        self.journal.record(&op)?;
        self.apply(op);
        self.maybe_compact()
    }

    fn remove(&mut self, id: EventId) -> Result<BufferedEvent, BufferError> {
        let seq = self.index.remove(&id).ok_or(BufferError::NotFound(id))?;
        self.entries.remove(&seq).ok_or(BufferError::NotFound(id))
    }

    /// Applies a journaled op to the in-memory state. Ops naming unknown ids
    /// are ignored so replay tolerates an entry removed by a later compaction.
    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::Append { entry } => {
                self.next_seq = self.next_seq.max(entry.seq + 1);
                self.index.insert(entry.event.id(), entry.seq);
                self.entries.insert(entry.seq, entry);
            }
            JournalOp::Transition {
                id,
                state,
                retry_count,
                next_attempt_at,
            } => {
                if let Some(entry) = self.index.get(&id).and_then(|seq| self.entries.get_mut(seq)) {
                    entry.event.set_delivery_state(state);
                    entry.retry_count = retry_count;
                    entry.next_attempt_at = next_attempt_at;
                }
            }
            JournalOp::Remove { id } => {
                if let Some(seq) = self.index.remove(&id) {
                    self.entries.remove(&seq);
                }
            }
        }
    }

    fn maybe_compact(&mut self) -> Result<(), BufferError> {
        if self.journal.ops_since_compaction() >= self.compact_after_ops
            && self.journal.ops_since_compaction() > self.entries.len()
        {
            self.journal.compact(self.entries.values())?;
        }
        Ok(())
    }
}
