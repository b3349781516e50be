//! # Delivery Module
//!
//! Drains the event buffer to the ingestion endpoint with at-least-once
//! semantics.
//!
//! This module handles:
//! - Sending due pending events in batches, keyed by event id
//! - Applying per-event results: 2xx delivered, 4xx failed, 5xx/429 retried
//! - Exponential backoff with jitter between retries
//! - Moving events out of retries to the dead-letter store
//! - Allowing one drain cycle at a time

pub mod backoff;
pub mod http;
pub mod transport;

pub use backoff::RetryPolicy;
pub use http::HttpTransport;
pub use transport::{BatchResponse, EventResult, IngestBatch, IngestTransport, OutgoingEvent};

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferedEvent, SharedBuffer};
use crate::config::DeliveryConfig;
use crate::diagnostics::{DiagnosticKind, DiagnosticRecord, Diagnostics};
use crate::error::{BufferError, DeliveryError, TransportError};
use crate::model::{CaptureEvent, EventId};

/// Invoked once per event after the endpoint acknowledged it
pub type DeliveryCallback = Arc<dyn Fn(&CaptureEvent) + Send + Sync>;

/// Counts for one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

/// What the endpoint's answer means for one event
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Rejected(String),
    Retry(String),
}

fn classify(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Delivered,
        429 => Outcome::Retry(format!("HTTP {status}")),
        400..=499 => Outcome::Rejected(format!("HTTP {status}")),
        _ => Outcome::Retry(format!("HTTP {status}")),
    }
}

/// Delivered ids remembered per buffered slot
const DELIVERED_WINDOW_FACTOR: usize = 4;

/// Most recently delivered ids, oldest forgotten first
#[derive(Debug)]
struct RecentIds {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Returns false if `id` was already remembered
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Sends buffered events and settles their delivery state.
pub struct DeliveryWorker {
    buffer: SharedBuffer,
    transport: Arc<dyn IngestTransport>,
    policy: RetryPolicy,
    batch_size: usize,
    diagnostics: Arc<Diagnostics>,
    drain_lock: tokio::sync::Mutex<()>,
    /// Ids recently acknowledged by the endpoint
    delivered: Mutex<RecentIds>,
    on_delivered: Mutex<Option<DeliveryCallback>>,
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("policy", &self.policy)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl DeliveryWorker {
    pub fn new(
        buffer: SharedBuffer,
        transport: Arc<dyn IngestTransport>,
        config: &DeliveryConfig,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let window = lock(&buffer).capacity().saturating_mul(DELIVERED_WINDOW_FACTOR);
        Self {
            buffer,
            transport,
            policy: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            diagnostics,
            drain_lock: tokio::sync::Mutex::new(()),
            delivered: Mutex::new(RecentIds::new(window)),
            on_delivered: Mutex::new(None),
        }
    }

    /// Registers the callback fired once per delivered event
    pub fn on_delivered(&self, callback: DeliveryCallback) {
        *lock(&self.on_delivered) = Some(callback);
    }

    /// Runs one drain cycle: sends up to `batch_size` due events and applies
    /// the results.
    ///
    /// # Errors
    ///
    /// `DrainInProgress` if another cycle holds the drain lock; `Buffer` if
    /// a state transition could not be journaled. Events whose transition
    /// failed stay `InFlight` and are reclaimed by the next cycle.
    pub async fn drain_once(&self) -> Result<DrainReport, DeliveryError> {
        let _drain = self
            .drain_lock
            .try_lock()
            .map_err(|_| DeliveryError::DrainInProgress)?;

        let batch = self.take_batch()?;
        if batch.is_empty() {
            debug!("Nothing due for delivery");
            return Ok(DrainReport::default());
        }

        let request = IngestBatch::from_events(batch.iter().map(|entry| &entry.event));
        debug!("Sending batch of {} events", batch.len());

        let outcomes: Vec<Outcome> = match self.transport.send_batch(&request).await {
            Ok(response) => batch
                .iter()
                .map(|entry| match response.status_of(&entry.event.id().as_key()) {
                    Some(status) => classify(status),
                    None => Outcome::Retry("no status in response".to_string()),
                })
                .collect(),
            Err(TransportError::Status(status)) => {
                warn!("Endpoint rejected batch with HTTP {}", status);
                batch.iter().map(|_| classify(status)).collect()
            }
            Err(e) => {
                warn!("Batch delivery failed: {}", e);
                batch.iter().map(|_| Outcome::Retry(e.to_string())).collect()
            }
        };

        let mut report = DrainReport::default();
        let mut delivered_events = Vec::new();
        let mut records = Vec::new();
        let mut first_error = None;

        {
            let mut buffer = lock(&self.buffer);
            let now = Utc::now();
            let mut rng = rand::thread_rng();

            for (entry, outcome) in batch.iter().zip(outcomes) {
                let id = entry.event.id();
                let result = match outcome {
                    Outcome::Delivered => buffer.mark_delivered(id).map(|event| {
                        if lock(&self.delivered).insert(id) {
                            report.sent += 1;
                            delivered_events.push(event);
                        }
                    }),
                    Outcome::Rejected(reason) => buffer.mark_failed(id, &reason).map(|()| {
                        report.failed += 1;
                        records.push(
                            DiagnosticRecord::new(
                                DiagnosticKind::Delivery,
                                format!("rejected by endpoint: {reason}"),
                            )
                            .with_capability(entry.event.kind())
                            .with_event(id),
                        );
                    }),
                    Outcome::Retry(reason) => {
                        let retries = entry.retry_count + 1;
                        if self.policy.exhausted(retries) {
                            buffer.dead_letter(id, &reason).map(|record| {
                                report.dead_lettered += 1;
                                records.push(
                                    DiagnosticRecord::new(
                                        DiagnosticKind::Delivery,
                                        format!(
                                            "dead-lettered after {} retries: {}",
                                            record.retry_count, reason
                                        ),
                                    )
                                    .with_capability(entry.event.kind())
                                    .with_event(id),
                                );
                            })
                        } else {
                            let delay = self.policy.delay(retries, &mut rng);
                            let next_attempt_at = chrono::Duration::from_std(delay)
                                .ok()
                                .and_then(|d| now.checked_add_signed(d))
                                .unwrap_or(now);
                            debug!("Retry {} for event {} in {:?}: {}", retries, id, delay, reason);
                            buffer
                                .schedule_retry(id, retries, next_attempt_at)
                                .map(|()| report.retried += 1)
                        }
                    }
                };

                if let Err(e) = result {
                    error!("Failed to settle event {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for record in records {
            self.diagnostics.record(record);
        }

        let callback = lock(&self.on_delivered).clone();
        if let Some(callback) = callback {
            for event in &delivered_events {
                callback(event);
            }
        }

        info!(
            "Drain complete: sent={} failed={} retried={} dead_lettered={}",
            report.sent, report.failed, report.retried, report.dead_lettered
        );

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// Marks the next due events `InFlight` and returns them.
    fn take_batch(&self) -> Result<Vec<BufferedEvent>, BufferError> {
        let mut buffer = lock(&self.buffer);
        // No other cycle holds the drain lock, so any InFlight entry is stale
        buffer.reclaim_in_flight()?;

        let due = buffer.peek_due(self.batch_size, Utc::now());
        let (already_delivered, batch): (Vec<_>, Vec<_>) = {
            let delivered = lock(&self.delivered);
            due.into_iter()
                .partition(|entry| delivered.contains(&entry.event.id()))
        };

        for entry in &already_delivered {
            debug!("Dropping already delivered event {}", entry.event.id());
            buffer.mark_delivered(entry.event.id())?;
        }
        for entry in &batch {
            buffer.mark_in_flight(entry.event.id())?;
        }
        Ok(batch)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
