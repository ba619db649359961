use thiserror::Error;

use crate::engine::Feature;
use crate::store::StoreError;

/// One failed engine attempt, kept so an exhausted fallback list can report
/// what each engine said.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineAttempt {
    pub engine: String,
    pub error: String,
}

/// A PDF/DOCX body an engine already downloaded while sniffing the content
/// type. The temp file is deleted when the artifact is dropped, on every exit
/// path.
#[derive(Debug)]
pub struct PrefetchArtifact {
    pub path: tempfile::TempPath,
    pub status_code: u16,
    pub content_type: String,
}

/// Everything that can go wrong while executing one scrape attempt.
///
/// `AddFeatures` and `RemoveFeatures` are control-flow signals, not failures:
/// the pipeline consumes them and restarts the fallback walk with an adjusted
/// feature set. The remaining variants either advance the fallback list or
/// terminate the job.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("engine {engine} failed: {message}")]
    Engine { engine: String, message: String },

    #[error("engine exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("TLS verification failed: {message}. Retry with skip_tls_verification to bypass")]
    Ssl { message: String },

    #[error("page failed to load ({code})")]
    Site { code: String },

    #[error("could not resolve host {host}")]
    DnsResolution { host: String },

    #[error("unsupported file type: {reason}")]
    UnsupportedFile { reason: String },

    #[error("page action '{kind}' at index {index} failed")]
    Action { index: usize, kind: String },

    #[error("content requires additional engine features")]
    AddFeatures {
        flags: Feature,
        pdf_prefetch: Option<PrefetchArtifact>,
    },

    #[error("requested features are not needed for this content")]
    RemoveFeatures { flags: Feature },

    #[error("redirect target is already owned by another job")]
    RacedRedirect,

    #[error("all engines exhausted after {} attempt(s)", tracker.len())]
    NoEnginesLeft { tracker: Vec<EngineAttempt> },

    #[error("job cancelled")]
    Cancelled,

    #[error("engine {engine} cannot run under zero data retention")]
    ZeroDataRetention { engine: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScrapeError {
    /// Whether the pipeline should record this error and try the next engine.
    pub fn advances_fallback(&self) -> bool {
        matches!(
            self,
            ScrapeError::Engine { .. }
                | ScrapeError::Timeout { .. }
                | ScrapeError::Ssl { .. }
                | ScrapeError::Site { .. }
                | ScrapeError::DnsResolution { .. }
                | ScrapeError::Action { .. }
                | ScrapeError::RacedRedirect
                | ScrapeError::ZeroDataRetention { .. }
        )
    }
}
