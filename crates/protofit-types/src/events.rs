use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{exercise::Exercise, telemetry::TickMetrics};

/// Event bus message kinds moving through the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Lifecycle,
    Analysis,
    Selection,
    Telemetry,
}

/// Immutable event envelope for logging, the front-end, and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Lifecycle(LifecycleEvent),
    Analysis(AnalysisEvent),
    Selection(SelectionEvent),
    Telemetry(TelemetryEvent),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    Acquiring,
    Active,
    SurfaceReady,
    Denied,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub session: Option<Uuid>,
    pub phase: SessionPhase,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Success { reps: u32, feedback: String },
    Failure { reason: String },
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    pub seq: u64,
    pub exercise: Exercise,
    pub outcome: AnalysisOutcome,
    pub round_trip_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionEvent {
    pub exercise: Exercise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub session: Uuid,
    pub ticks: TickMetrics,
    pub frames_rendered: u64,
}

impl TrackerEvent {
    pub fn new(payload: EventPayload) -> Self {
        let kind = match &payload {
            EventPayload::Lifecycle(_) => EventKind::Lifecycle,
            EventPayload::Analysis(_) => EventKind::Analysis,
            EventPayload::Selection(_) => EventKind::Selection,
            EventPayload::Telemetry(_) => EventKind::Telemetry,
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn lifecycle(session: Option<Uuid>, phase: SessionPhase, details: Option<String>) -> Self {
        Self::new(EventPayload::Lifecycle(LifecycleEvent {
            session,
            phase,
            details,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_payload() {
        let event = TrackerEvent::lifecycle(None, SessionPhase::Acquiring, None);
        assert_eq!(event.kind, EventKind::Lifecycle);

        let event = TrackerEvent::new(EventPayload::Selection(SelectionEvent {
            exercise: Exercise::new("pushup"),
        }));
        assert_eq!(event.kind, EventKind::Selection);
    }
}
