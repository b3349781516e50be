//! # Consent Capture
//!
//! Headless host for the capture pipeline.
//!
//! Asks for consent on the terminal, then captures from a simulated device
//! platform on the configured interval and delivers to the ingestion endpoint
//! until Ctrl+C.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use consent_capture::capture::simulated::{SimulatedCamera, SimulatedLocation};
use consent_capture::config::Config;
use consent_capture::consent::{ConsentDecision, ConsentPrompter, ConsentRequest};
use consent_capture::delivery::HttpTransport;
use consent_capture::error::ConsentError;
use consent_capture::model::CaptureKind;
use consent_capture::pipeline::{PipelineContext, Platform};

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

const LOG_FILE_PREFIX: &str = "consent-capture.log";

/// Consent prompt on the controlling terminal
struct TerminalPrompter {
    stdin: Mutex<BufReader<Stdin>>,
}

impl TerminalPrompter {
    fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait]
impl ConsentPrompter for TerminalPrompter {
    async fn prompt(&self, request: &ConsentRequest) -> Result<ConsentDecision, ConsentError> {
        let mut question = format!(
            "\nAllow {} capture? (consent agreement {})\n",
            describe(request.kind),
            request.consent_version
        );
        if request.previously_denied {
            question.push_str("You declined this in an earlier version.\n");
        }
        question.push_str("[y]es / [n]o / Enter to decide later: ");

        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(question.as_bytes())
            .await
            .map_err(|e| ConsentError::PromptUnavailable(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| ConsentError::PromptUnavailable(e.to_string()))?;

        let mut line = String::new();
        let read = self
            .stdin
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(|e| ConsentError::PromptUnavailable(e.to_string()))?;
        if read == 0 {
            return Err(ConsentError::PromptUnavailable("stdin closed".to_string()));
        }

        Ok(parse_answer(&line))
    }
}

fn describe(kind: CaptureKind) -> &'static str {
    match kind {
        CaptureKind::Location => "location",
        CaptureKind::CameraFrame => "camera",
    }
}

fn parse_answer(line: &str) -> ConsentDecision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ConsentDecision::Granted,
        "n" | "no" => ConsentDecision::Denied,
        _ => ConsentDecision::Dismissed,
    }
}

/// Logs to stdout and to a daily rolling file next to the diagnostics logs.
fn init_logging(config: &Config) -> WorkerGuard {
    let log_dir = Path::new(&config.storage.data_dir).join(&config.diagnostics.log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    guard
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("failed to load config from {path}")),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("failed to load config from {DEFAULT_CONFIG_PATH}")),
        None => Ok(Config::default()),
    }
}

/// Main entry point for the Consent Capture host
///
/// # Control Flow
///
/// 1. Load configuration and set up logging
/// 2. Open the pipeline over a simulated device platform
/// 3. Ask for consent for each enabled capability
/// 4. Capture on the configured interval until Ctrl+C
/// 5. Stop the schedule, let the running cycle finish and flush the buffer
///
/// # Errors
///
/// Returns error if the configuration is invalid or local state cannot be
/// opened.
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);

    info!("Consent Capture v{} starting...", env!("CARGO_PKG_VERSION"));

    let platform = Platform {
        location: Arc::new(SimulatedLocation::new(
            config.simulation.latitude,
            config.simulation.longitude,
        )),
        camera: Arc::new(SimulatedCamera::new(config.simulation.video_inputs)),
    };
    let transport = Arc::new(HttpTransport::new(&config.delivery)?);
    info!("Delivering to {}", transport.url());

    let enabled: Vec<CaptureKind> = CaptureKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            CaptureKind::Location => config.capture.enable_location,
            CaptureKind::CameraFrame => config.capture.enable_camera,
        })
        .collect();

    let pipeline = PipelineContext::open(config, platform, Arc::new(TerminalPrompter::new()), transport)?;

    for kind in enabled {
        match pipeline.request_consent(kind).await {
            Ok(decision) => info!("{} consent: {:?}", kind, decision),
            Err(e) => warn!("Could not ask for {} consent: {}", kind, e),
        }
    }

    pipeline.start()?;
    info!("Press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    pipeline.stop();
    pipeline.wait_idle().await;

    match pipeline.flush().await {
        Ok(report) => info!("Final flush: {} sent, {} retried", report.sent, report.retried),
        Err(e) => error!("Final flush failed: {}", e),
    }

    let counts = pipeline.buffer_counts();
    info!(
        "Shutdown complete ({} pending, {} failed, {} dead-lettered)",
        counts.pending,
        counts.failed,
        pipeline.dead_letters().len()
    );

    Ok(())
}
