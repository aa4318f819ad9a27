use thiserror::Error;

pub type Result<T, E = ProtofitError> = std::result::Result<T, E>;

/// Unified error type covering failure scenarios across the tracker crates.
#[derive(Debug, Error)]
pub enum ProtofitError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("camera error: {0}")]
    Camera(String),
    #[error("vision error: {0}")]
    Vision(String),
    #[error("analysis error: {0}")]
    Analysis(String),
    /// Non-success response; `body` is the raw response text.
    #[error("analysis service returned {status}: {body}")]
    AnalysisStatus { status: u16, body: String },
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
