//! Operational helpers: logging and telemetry capture.

use std::{collections::VecDeque, fs::OpenOptions, path::Path, sync::Arc};

use futures::StreamExt;
use protofit_events::EventBus;
use protofit_types::{
    config::OpsConfig,
    events::{EventPayload, TelemetryEvent, TrackerEvent},
    ProtofitError, Result,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Logs go to `ops.log_file` when set,
/// otherwise to stdout.
pub fn init_tracing(config: &OpsConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_level.clone())
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| ops_error(format!("failed to create log filter: {err}")))?;

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(path))
                .map_err(|err| ops_error(format!("failed to open log file {path}: {err}")))?;
            fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|err| ops_error(format!("tracing init error: {err}")))?;
        }
    }
    Ok(())
}

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// In-memory record of the most recent bus events and of every session summary.
#[derive(Clone)]
pub struct TelemetryStore {
    capacity: usize,
    events: Arc<Mutex<VecDeque<TrackerEvent>>>,
    sessions: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` events; the oldest are dropped first.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Arc::new(Mutex::new(VecDeque::with_capacity(
                capacity.min(DEFAULT_EVENT_CAPACITY),
            ))),
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record_event(&self, event: TrackerEvent) -> Result<()> {
        if let EventPayload::Telemetry(summary) = &event.payload {
            info!(
                "Session {} summary: dispatched={} ok={} failed={} stale={} frames={}",
                summary.session,
                summary.ticks.dispatched,
                summary.ticks.succeeded,
                summary.ticks.failed,
                summary.ticks.stale_discarded,
                summary.frames_rendered
            );
            self.sessions.lock().await.push(summary.clone());
        }
        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    /// Record every event the bus carries until the bus goes away.
    pub fn attach<B: EventBus + ?Sized>(&self, bus: &B) -> JoinHandle<()> {
        let mut stream = bus.subscribe();
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let _ = store.record_event(event).await;
            }
        })
    }

    pub async fn snapshot_events(&self) -> Vec<TrackerEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    pub async fn session_summaries(&self) -> Vec<TelemetryEvent> {
        self.sessions.lock().await.clone()
    }
}

pub fn ops_error(message: impl Into<String>) -> ProtofitError {
    ProtofitError::Ops(message.into())
}
