use serde::{Deserialize, Serialize};

use crate::exercise::Exercise;

/// Body of `POST /analyze`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Base64 JPEG without a data-URI prefix.
    pub image: String,
    pub exercise: Exercise,
}

/// Successful `/analyze` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisResult {
    pub reps: u32,
    pub feedback: String,
}
