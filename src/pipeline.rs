//! # Pipeline Module
//!
//! Explicit context owning every component of the capture pipeline.
//!
//! This module handles:
//! - Opening session, consent ledger, buffer and diagnostics from one data directory
//! - Running capture cycles: consent check, capture, buffer, optional drain
//! - Halting a capability after a denial or terminal device error until its
//!   consent record changes
//! - Starting and stopping the interval schedule

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferCounts, DeadLetterRecord, EventBuffer, SharedBuffer, EVICTED_REASON};
use crate::capture::platform::{CameraSource, LocationSource};
use crate::capture::DeviceCaptureAdapter;
use crate::config::Config;
use crate::consent::{
    ConsentDecision, ConsentGate, ConsentGrant, ConsentLedger, ConsentPrompter, ConsentRecord, ConsentState,
    Decision,
};
use crate::delivery::{DeliveryCallback, DeliveryWorker, DrainReport, IngestTransport};
use crate::diagnostics::{DiagnosticKind, DiagnosticRecord, Diagnostics};
use crate::error::{CaptureError, ConsentError, DeliveryError, Result};
use crate::model::{CaptureEvent, CaptureKind, Facing, Payload};
use crate::schedule::{
    IntervalSpec, ScheduleController, ScheduleState, ScheduleStats, ScheduledJob, TriggerOutcome,
};
use crate::session::Session;

const SESSION_FILE: &str = "session.json";
const CONSENT_FILE: &str = "consent.jsonl";

/// Device APIs supplied by the host
#[derive(Clone)]
pub struct Platform {
    pub location: Arc<dyn LocationSource>,
    pub camera: Arc<dyn CameraSource>,
}

/// What one capture cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Events appended to the buffer
    pub captured: usize,
    /// Capabilities skipped for lack of consent or after a halt
    pub skipped: usize,
    /// Results dropped because the run was cancelled or consent changed
    pub discarded: usize,
    pub transient_errors: usize,
    pub terminal_errors: usize,
    /// Events the buffer refused
    pub buffer_rejected: usize,
    pub drain: Option<DrainReport>,
}

/// Owns the consent gate, capture adapter, buffer, delivery worker and
/// scheduler for one session.
pub struct PipelineContext {
    config: Config,
    session: Session,
    consent: ConsentGate,
    capture: DeviceCaptureAdapter,
    buffer: SharedBuffer,
    delivery: DeliveryWorker,
    diagnostics: Arc<Diagnostics>,
    scheduler: ScheduleController,
    /// Halted capabilities, keyed to the consent record in force when halted
    halted: Mutex<HashMap<CaptureKind, Option<Uuid>>>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("session", &self.session)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Validates `config` and opens all persistent state under its data
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or any stored state
    /// cannot be read.
    pub fn open(
        config: Config,
        platform: Platform,
        prompter: Arc<dyn ConsentPrompter>,
        transport: Arc<dyn IngestTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let data_dir = PathBuf::from(&config.storage.data_dir);
        fs::create_dir_all(&data_dir)?;

        let session = Session::open(data_dir.join(SESSION_FILE))?;
        let ledger =
            ConsentLedger::open(data_dir.join(CONSENT_FILE)).map_err(|e| ConsentError::Ledger(e.to_string()))?;
        let consent = ConsentGate::new(session.session_id, &config.consent, ledger, prompter);

        let capture = DeviceCaptureAdapter::new(platform.location, platform.camera, &config.capture);
        let buffer = EventBuffer::open(&data_dir, config.buffer.capacity, config.buffer.compact_after_ops)?;
        let buffer: SharedBuffer = Arc::new(Mutex::new(buffer));

        let diagnostics = Arc::new(Diagnostics::from_config(&config.diagnostics, &data_dir));
        let delivery = DeliveryWorker::new(
            Arc::clone(&buffer),
            transport,
            &config.delivery,
            Arc::clone(&diagnostics),
        );

        info!(
            "Pipeline opened (session {}, visit {})",
            session.session_id, session.visit_count
        );

        Ok(Arc::new(Self {
            config,
            session,
            consent,
            capture,
            buffer,
            delivery,
            diagnostics,
            scheduler: ScheduleController::new(),
            halted: Mutex::new(HashMap::new()),
        }))
    }

    /// Starts the capture schedule.
    ///
    /// The schedule holds only a weak reference; dropping the last
    /// `Arc<PipelineContext>` stops it.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let spec = IntervalSpec {
            period: Duration::from_millis(self.config.schedule.interval_ms),
            run_immediately: self.config.schedule.run_immediately,
        };
        let job: Arc<dyn ScheduledJob> = Arc::new(CycleJob(Arc::downgrade(self)));
        self.scheduler.start(spec, job)?;
        Ok(())
    }

    /// Stops the schedule. A cycle in flight finishes, but its outstanding
    /// captures are cancelled and their results discarded.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn trigger_now(&self) -> TriggerOutcome {
        self.scheduler.trigger_now()
    }

    /// Waits until no scheduled cycle is in flight
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    pub fn schedule_state(&self) -> ScheduleState {
        self.scheduler.state()
    }

    pub fn schedule_stats(&self) -> ScheduleStats {
        self.scheduler.stats()
    }

    pub async fn request_consent(&self, kind: CaptureKind) -> Result<ConsentDecision> {
        Ok(self.consent.request_consent(kind).await?)
    }

    pub fn set_consent(&self, kind: CaptureKind, decision: Decision) -> Result<ConsentRecord> {
        Ok(self.consent.set_decision(kind, decision)?)
    }

    pub fn current_consent(&self, kind: CaptureKind) -> ConsentState {
        self.consent.current_consent(kind)
    }

    pub fn consent_records(&self) -> Vec<ConsentRecord> {
        self.consent.records()
    }

    /// Runs one cycle: captures every enabled, consented capability, buffers
    /// the results and optionally drains the buffer.
    pub async fn capture_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        let capture = &self.config.capture;

        if capture.enable_location {
            if let Some(grant) = self.authorize(CaptureKind::Location, &mut report) {
                let result = self
                    .capture
                    .capture_location(
                        &grant,
                        Duration::from_millis(capture.location_timeout_ms),
                        Duration::from_millis(capture.location_max_age_ms),
                        cancel,
                    )
                    .await;
                self.settle(CaptureKind::Location, result.map(Payload::Location), cancel, &mut report);
            }
        }

        if capture.enable_camera {
            if let Some(grant) = self.authorize(CaptureKind::CameraFrame, &mut report) {
                let result = self.capture.capture_camera_frame(&grant, Facing::Front, cancel).await;
                self.settle(CaptureKind::CameraFrame, result.map(Payload::CameraFrame), cancel, &mut report);

                if capture.capture_back_camera && !cancel.is_cancelled() && !self.is_halted(CaptureKind::CameraFrame)
                {
                    self.capture_back_camera(&grant, cancel, &mut report).await;
                }
            }
        }

        if self.config.delivery.drain_after_capture {
            match self.delivery.drain_once().await {
                Ok(drain) => report.drain = Some(drain),
                Err(DeliveryError::DrainInProgress) => debug!("Drain already running, skipping"),
                Err(e) => {
                    error!("Drain after capture failed: {}", e);
                    self.diagnostics
                        .record(DiagnosticRecord::new(DiagnosticKind::Delivery, e.to_string()));
                }
            }
        }

        report
    }

    /// Drains until nothing is due.
    pub async fn flush(&self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let report = self.delivery.drain_once().await?;
            if report.is_empty() {
                break;
            }
            total += report;
        }
        Ok(total)
    }

    pub fn on_delivered(&self, callback: DeliveryCallback) {
        self.delivery.on_delivered(callback);
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.diagnostics.snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        lock(&self.buffer).dead_letters()
    }

    pub fn buffer_counts(&self) -> BufferCounts {
        lock(&self.buffer).counts()
    }

    /// Up to `max_n` pending events in creation order
    pub fn pending_events(&self, max_n: usize) -> Vec<CaptureEvent> {
        lock(&self.buffer).peek_batch(max_n)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn capture_back_camera(&self, grant: &ConsentGrant, cancel: &CancellationToken, report: &mut CycleReport) {
        match self.capture.video_input_count().await {
            Ok(inputs) if inputs > 1 => {
                let result = self.capture.capture_camera_frame(grant, Facing::Back, cancel).await;
                self.settle(CaptureKind::CameraFrame, result.map(Payload::CameraFrame), cancel, report);
            }
            Ok(_) => debug!("Single video input, skipping back camera"),
            Err(e) => {
                warn!("Could not enumerate video inputs: {}", e);
                report.transient_errors += 1;
            }
        }
    }

    fn authorize(&self, kind: CaptureKind, report: &mut CycleReport) -> Option<ConsentGrant> {
        if self.is_halted(kind) {
            report.skipped += 1;
            return None;
        }

        match self.consent.authorize(kind) {
            Ok(grant) => Some(grant),
            Err(ConsentError::Denied(_)) => {
                report.skipped += 1;
                self.halt(
                    kind,
                    DiagnosticRecord::new(DiagnosticKind::Consent, "consent denied").with_capability(kind),
                );
                None
            }
            Err(e) => {
                debug!("Skipping {} capture: {}", kind, e);
                report.skipped += 1;
                None
            }
        }
    }

    fn settle(
        &self,
        kind: CaptureKind,
        result: std::result::Result<Payload, CaptureError>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) {
        match result {
            Ok(_) if cancel.is_cancelled() => {
                debug!("Discarding {} capture completed after stop", kind);
                report.discarded += 1;
            }
            Ok(payload) => self.store(kind, payload, report),
            Err(CaptureError::Cancelled) => {
                debug!("{} capture cancelled", kind);
                report.discarded += 1;
            }
            Err(e) if e.is_terminal() => {
                report.terminal_errors += 1;
                self.halt(
                    kind,
                    DiagnosticRecord::new(DiagnosticKind::Capture, e.to_string()).with_capability(kind),
                );
            }
            Err(e) => {
                warn!("{} capture failed: {}", kind, e);
                report.transient_errors += 1;
            }
        }
    }

    fn store(&self, kind: CaptureKind, payload: Payload, report: &mut CycleReport) {
        // Consent may have changed while the device was busy
        let event = match self
            .consent
            .authorize(kind)
            .and_then(|grant| CaptureEvent::new(&grant, payload))
        {
            Ok(event) => event,
            Err(e) => {
                info!("Discarding {} capture: {}", kind, e);
                report.discarded += 1;
                return;
            }
        };

        let id = event.id();
        let result = lock(&self.buffer).append(event);
        match result {
            Ok(evicted) => {
                report.captured += 1;
                debug!("Buffered {} event {}", kind, id);
                if let Some(evicted) = evicted {
                    self.diagnostics
                        .record(DiagnosticRecord::new(DiagnosticKind::Buffer, EVICTED_REASON).with_event(evicted));
                }
            }
            Err(e) => {
                report.buffer_rejected += 1;
                self.diagnostics.record(
                    DiagnosticRecord::new(DiagnosticKind::Buffer, e.to_string())
                        .with_capability(kind)
                        .with_event(id),
                );
            }
        }
    }

    fn is_halted(&self, kind: CaptureKind) -> bool {
        let halted_under = lock(&self.halted).get(&kind).copied();
        halted_under.map_or(false, |record_id| record_id == self.consent.current_record_id(kind))
    }

    fn halt(&self, kind: CaptureKind, record: DiagnosticRecord) {
        let record_id = self.consent.current_record_id(kind);
        lock(&self.halted).insert(kind, record_id);
        info!("Halting {} capture until its consent changes", kind);
        self.diagnostics.record(record);
    }
}

/// Scheduled job running one capture cycle per tick
struct CycleJob(Weak<PipelineContext>);

#[async_trait]
impl ScheduledJob for CycleJob {
    async fn run(&self, cancel: CancellationToken) {
        let Some(pipeline) = self.0.upgrade() else {
            return;
        };

        let report = pipeline.capture_cycle(&cancel).await;
        info!(
            captured = report.captured,
            skipped = report.skipped,
            discarded = report.discarded,
            transient_errors = report.transient_errors,
            terminal_errors = report.terminal_errors,
            "Capture cycle finished"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
