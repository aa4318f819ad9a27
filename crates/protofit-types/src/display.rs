use serde::{Deserialize, Serialize};

use crate::exercise::Exercise;

pub const TRACKING_MESSAGE: &str = "Tracking...";
pub const BACKEND_ERROR_MESSAGE: &str = "Error connecting to backend.";
pub const INITIAL_REPS_TEXT: &str = "Reps: 0";

pub fn reps_text(reps: u32) -> String {
    format!("Reps: {reps}")
}

pub fn camera_alert_text(detail: &str) -> String {
    format!("Could not access webcam: {detail}")
}

/// Everything the front-end renders, written only by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayState {
    pub reps: String,
    pub feedback: String,
    pub status: String,
    pub start_enabled: bool,
    /// Blocking alert; the front-end keeps it up until dismissed.
    pub alert: Option<String>,
    pub exercise: Exercise,
    pub surface: Option<(u32, u32)>,
    pub frames_rendered: u64,
}

impl DisplayState {
    pub fn new(exercise: Exercise) -> Self {
        Self {
            reps: INITIAL_REPS_TEXT.to_string(),
            feedback: String::new(),
            status: "Idle".to_string(),
            start_enabled: true,
            alert: None,
            exercise,
            surface: None,
            frames_rendered: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reps_text_format() {
        assert_eq!(reps_text(7), "Reps: 7");
        assert_eq!(reps_text(0), INITIAL_REPS_TEXT);
    }

    #[test]
    fn alert_text_includes_detail() {
        assert_eq!(
            camera_alert_text("permission denied"),
            "Could not access webcam: permission denied"
        );
    }
}
