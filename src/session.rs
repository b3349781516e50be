//! Session identity persisted across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::PipelineError;
use crate::model::SessionId;
use crate::storage::write_atomic;

/// Identity that groups consent records and events of one installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Number of times the pipeline has been opened with this session
    pub visit_count: u64,
}

impl Session {
    /// Loads the session stored at `path`, or creates a new one, and counts
    /// this visit.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Session` if the file exists but cannot be
    /// parsed, or if the updated session cannot be written.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();

        let mut session = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<Session>(&contents)
                .map_err(|e| PipelineError::Session(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let session = Session {
                    session_id: SessionId::new(),
                    created_at: Utc::now(),
                    visit_count: 0,
                };
                info!("Created session {}", session.session_id);
                session
            }
            Err(e) => return Err(e.into()),
        };

        session.visit_count += 1;
        let contents =
            serde_json::to_vec_pretty(&session).map_err(|e| PipelineError::Session(e.to_string()))?;
        write_atomic(path, &contents).map_err(|e| PipelineError::Session(e.to_string()))?;

        Ok(session)
    }
}
