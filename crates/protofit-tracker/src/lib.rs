//! Capture-and-poll loop: webcam session, render loop, and analysis polling.

mod selector;
mod session;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use chrono::Utc;
use protofit_analysis::AnalysisService;
use protofit_camera::CameraSource;
use protofit_events::EventBus;
use protofit_types::{
    analysis::{AnalysisRequest, AnalysisResult},
    config::{InFlightPolicy, ProtofitConfig, TrackerConfig},
    display::{
        camera_alert_text, reps_text, DisplayState, BACKEND_ERROR_MESSAGE, TRACKING_MESSAGE,
    },
    events::{
        AnalysisEvent, AnalysisOutcome, EventPayload, SelectionEvent, SessionPhase,
        TelemetryEvent, TrackerEvent,
    },
    exercise::Exercise,
    telemetry::{LatencySample, TickMetrics},
    vision::ImageFrame,
    ProtofitError, Result,
};
use protofit_vision::{encode_jpeg, FrameArchive, Surface};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, interval_at, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use selector::ExerciseSelector;
pub use session::{CaptureSession, TrackerState};

/// Knobs the tracker needs out of the full configuration.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub tracker: TrackerConfig,
    pub jpeg_quality: u8,
    pub capture_dir: Option<PathBuf>,
}

impl TrackerSettings {
    pub fn from_config(config: &ProtofitConfig) -> Self {
        Self {
            tracker: config.tracker.clone(),
            jpeg_quality: config.analysis.jpeg_quality,
            capture_dir: config.ops.capture_dir.as_ref().map(PathBuf::from),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            jpeg_quality: 92,
            capture_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { session: Uuid },
    AlreadyRunning,
    /// `stop` was called while camera access was still pending. The camera
    /// acquired for this call, if any, has been released again.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No session, or the sink is not producing decodable frames.
    NotReady,
    /// A previous request is still outstanding and the policy is `skip`.
    InFlight,
    Dispatched { seq: u64 },
}

struct Lifecycle {
    state: TrackerState,
    /// Bumped by every `start()` and by `stop()` during `Acquiring`; an
    /// acquisition only takes effect if its generation is still current.
    acquire_generation: u64,
    session: Option<Arc<CaptureSession>>,
    poll_timer: Option<JoinHandle<()>>,
    render_loop: Option<JoinHandle<()>>,
}

struct InFlight {
    seq: u64,
    handle: JoinHandle<()>,
}

struct Shared<C, A, B> {
    camera: C,
    analysis: A,
    bus: B,
    settings: TrackerSettings,
    archive: Option<FrameArchive>,
    selector: ExerciseSelector,
    display: watch::Sender<DisplayState>,
    lifecycle: Mutex<Lifecycle>,
    /// Held across camera acquire, back-out and release.
    camera_gate: tokio::sync::Mutex<()>,
    surface: Mutex<Surface>,
    in_flight: Mutex<Option<InFlight>>,
    tick_gate: tokio::sync::Mutex<()>,
    next_seq: AtomicU64,
    applied_seq: Mutex<u64>,
    metrics: Mutex<TickMetrics>,
}

/// Owns the capture session, the poll timer and the render loop.
///
/// Exactly one session and at most one poll timer exist per tracker.
pub struct Tracker<C, A, B>
where
    C: CameraSource + 'static,
    A: AnalysisService + 'static,
    B: EventBus + 'static,
{
    shared: Arc<Shared<C, A, B>>,
}

impl<C, A, B> Tracker<C, A, B>
where
    C: CameraSource + 'static,
    A: AnalysisService + 'static,
    B: EventBus + 'static,
{
    pub fn new(settings: TrackerSettings, camera: C, analysis: A, bus: B) -> Result<Self> {
        let selector = ExerciseSelector::new(
            settings.tracker.exercises.clone(),
            settings.tracker.initial_selection(),
        )?;
        let (display, _) = watch::channel(DisplayState::new(selector.current()));
        let archive = settings.capture_dir.clone().map(FrameArchive::new);
        Ok(Self {
            shared: Arc::new(Shared {
                camera,
                analysis,
                bus,
                settings,
                archive,
                selector,
                display,
                lifecycle: Mutex::new(Lifecycle {
                    state: TrackerState::Idle,
                    acquire_generation: 0,
                    session: None,
                    poll_timer: None,
                    render_loop: None,
                }),
                camera_gate: tokio::sync::Mutex::new(()),
                surface: Mutex::new(Surface::new()),
                in_flight: Mutex::new(None),
                tick_gate: tokio::sync::Mutex::new(()),
                next_seq: AtomicU64::new(0),
                applied_seq: Mutex::new(0),
                metrics: Mutex::new(TickMetrics::default()),
            }),
        })
    }

    /// Request the camera and, once granted, start rendering and polling.
    pub async fn start(&self) -> Result<StartOutcome> {
        self.shared.start().await
    }

    /// Cancel the poll timer, end the render loop and release the camera.
    /// Returns `false` when there was nothing to stop.
    pub async fn stop(&self) -> Result<bool> {
        self.shared.stop().await
    }

    /// One poll-timer firing. Normally driven by the timer itself.
    pub async fn tick(&self) -> Result<TickOutcome> {
        Shared::tick(&self.shared).await
    }

    /// Wait for the outstanding analysis request, if any, to complete.
    pub async fn settle(&self) {
        let pending = lock(&self.shared.in_flight).take();
        if let Some(pending) = pending {
            debug!("Waiting for analysis request {}", pending.seq);
            let _ = pending.handle.await;
        }
    }

    pub fn state(&self) -> TrackerState {
        lock(&self.shared.lifecycle).state
    }

    pub fn session(&self) -> Option<Arc<CaptureSession>> {
        lock(&self.shared.lifecycle).session.clone()
    }

    pub fn has_poll_timer(&self) -> bool {
        lock(&self.shared.lifecycle).poll_timer.is_some()
    }

    pub fn display(&self) -> DisplayState {
        self.shared.display.borrow().clone()
    }

    pub fn watch_display(&self) -> watch::Receiver<DisplayState> {
        self.shared.display.subscribe()
    }

    /// Copy of whatever the render loop drew last.
    pub fn surface_snapshot(&self) -> Option<ImageFrame> {
        lock(&self.shared.surface).contents().cloned()
    }

    pub fn metrics(&self) -> TickMetrics {
        lock(&self.shared.metrics).clone()
    }

    pub fn selector(&self) -> &ExerciseSelector {
        &self.shared.selector
    }

    pub async fn select_exercise(&self, exercise: &Exercise) -> Result<Exercise> {
        let selected = self.shared.selector.select(exercise)?;
        self.shared.selection_changed(selected).await
    }

    pub async fn select_next(&self) -> Result<Exercise> {
        let selected = self.shared.selector.next();
        self.shared.selection_changed(selected).await
    }

    pub async fn select_previous(&self) -> Result<Exercise> {
        let selected = self.shared.selector.previous();
        self.shared.selection_changed(selected).await
    }

    pub async fn select_index(&self, index: usize) -> Result<Exercise> {
        let selected = self.shared.selector.select_index(index)?;
        self.shared.selection_changed(selected).await
    }

    /// Clear a blocking alert once the user has acknowledged it.
    pub fn dismiss_alert(&self) {
        self.shared.display.send_modify(|display| display.alert = None);
    }
}

impl<C, A, B> Drop for Tracker<C, A, B>
where
    C: CameraSource + 'static,
    A: AnalysisService + 'static,
    B: EventBus + 'static,
{
    fn drop(&mut self) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        if let Some(timer) = lifecycle.poll_timer.take() {
            timer.abort();
        }
        if let Some(render) = lifecycle.render_loop.take() {
            render.abort();
        }
        if let Some(session) = lifecycle.session.take() {
            session.deactivate();
        }
        if let Some(pending) = lock(&self.shared.in_flight).take() {
            pending.handle.abort();
        }
    }
}

impl<C, A, B> Shared<C, A, B>
where
    C: CameraSource + 'static,
    A: AnalysisService + 'static,
    B: EventBus + 'static,
{
    async fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        let generation = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != TrackerState::Idle {
                debug!("start() ignored while {:?}", lifecycle.state);
                return Ok(StartOutcome::AlreadyRunning);
            }
            lifecycle.state = TrackerState::Acquiring;
            lifecycle.acquire_generation += 1;
            lifecycle.acquire_generation
        };
        self.display.send_modify(|display| {
            display.start_enabled = false;
            display.alert = None;
            display.status = "Requesting camera...".into();
        });
        self.publish(TrackerEvent::lifecycle(None, SessionPhase::Acquiring, None))
            .await;

        // A cancelled acquisition still holds the gate until it has released.
        let camera_guard = self.camera_gate.lock().await;
        if !self.is_current(generation) {
            debug!("Acquisition {} cancelled before it began", generation);
            return Ok(StartOutcome::Cancelled);
        }

        if let Err(err) = self.camera.acquire().await {
            let current = {
                let mut lifecycle = lock(&self.lifecycle);
                let current = lifecycle.acquire_generation == generation;
                if current {
                    lifecycle.state = TrackerState::Idle;
                }
                current
            };
            if !current {
                debug!("Acquisition {} failed after being cancelled: {}", generation, err);
                return Ok(StartOutcome::Cancelled);
            }
            let detail = match &err {
                ProtofitError::Camera(message) => message.clone(),
                other => other.to_string(),
            };
            warn!("Camera acquisition failed: {}", detail);
            self.display.send_modify(|display| {
                display.alert = Some(camera_alert_text(&detail));
                display.start_enabled = true;
                display.status = "Camera unavailable".into();
            });
            self.publish(TrackerEvent::lifecycle(
                None,
                SessionPhase::Denied,
                Some(detail),
            ))
            .await;
            return Err(err);
        }

        let session = Arc::new(CaptureSession::begin());
        let cancelled = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.acquire_generation == generation {
                lifecycle.state = TrackerState::Active;
                lifecycle.session = Some(Arc::clone(&session));
                lifecycle.render_loop = Some(tokio::spawn(
                    Arc::clone(self).render_loop(Arc::clone(&session)),
                ));
                if lifecycle.poll_timer.is_none() {
                    lifecycle.poll_timer = Some(tokio::spawn(Arc::clone(self).poll_loop()));
                }
                false
            } else {
                true
            }
        };
        if cancelled {
            // Nobody else can have acquired the camera while the gate is held.
            info!("Capture cancelled while the camera was being acquired");
            self.camera.release().await?;
            return Ok(StartOutcome::Cancelled);
        }
        drop(camera_guard);

        self.display.send_modify(|display| {
            display.feedback = TRACKING_MESSAGE.into();
            display.status = "Tracking".into();
            display.start_enabled = false;
        });
        info!(
            "Capture session {} active, polling every {}ms",
            session.id(),
            self.settings.tracker.poll_interval_ms
        );
        self.publish(TrackerEvent::lifecycle(
            Some(session.id()),
            SessionPhase::Active,
            None,
        ))
        .await;
        Ok(StartOutcome::Started {
            session: session.id(),
        })
    }

    async fn stop(self: &Arc<Self>) -> Result<bool> {
        let phase = {
            let mut lifecycle = lock(&self.lifecycle);
            let phase = lifecycle.state;
            if phase == TrackerState::Acquiring {
                // The pending start() sees a stale generation and backs out.
                lifecycle.state = TrackerState::Idle;
                lifecycle.acquire_generation += 1;
            }
            phase
        };
        match phase {
            TrackerState::Idle => return Ok(false),
            TrackerState::Acquiring => {
                info!("Camera acquisition cancelled");
                self.display.send_modify(|display| {
                    display.start_enabled = true;
                    display.status = "Stopped".into();
                });
                self.publish(TrackerEvent::lifecycle(None, SessionPhase::Stopped, None))
                    .await;
                return Ok(true);
            }
            TrackerState::Active => {}
        }

        let _camera_guard = self.camera_gate.lock().await;
        let (session, timer, render) = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != TrackerState::Active {
                return Ok(false);
            }
            lifecycle.state = TrackerState::Idle;
            (
                lifecycle.session.take(),
                lifecycle.poll_timer.take(),
                lifecycle.render_loop.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(session) = &session {
            session.deactivate();
        }
        if let Some(render) = render {
            render.abort();
        }
        if let Some(pending) = lock(&self.in_flight).take() {
            debug!("Aborting outstanding analysis request {}", pending.seq);
            pending.handle.abort();
        }
        lock(&self.surface).clear();

        let frames_rendered = self.display.borrow().frames_rendered;
        self.display.send_modify(|display| {
            display.start_enabled = true;
            display.status = "Stopped".into();
            display.surface = None;
        });

        let released = self.camera.release().await;
        if let Some(session) = session {
            info!("Capture session {} stopped", session.id());
            self.publish(TrackerEvent::lifecycle(
                Some(session.id()),
                SessionPhase::Stopped,
                None,
            ))
            .await;
            let ticks = lock(&self.metrics).clone();
            self.publish(TrackerEvent::new(EventPayload::Telemetry(TelemetryEvent {
                session: session.id(),
                ticks,
                frames_rendered,
            })))
            .await;
        }
        released.map(|_| true)
    }

    async fn tick(self: &Arc<Self>) -> Result<TickOutcome> {
        let _gate = self.tick_gate.lock().await;

        let session = lock(&self.lifecycle)
            .session
            .clone()
            .filter(|session| session.is_active());
        let Some(session) = session else {
            lock(&self.metrics).skipped_not_ready += 1;
            return Ok(TickOutcome::NotReady);
        };
        if !self.camera.is_ready() {
            lock(&self.metrics).skipped_not_ready += 1;
            return Ok(TickOutcome::NotReady);
        }

        {
            let mut slot = lock(&self.in_flight);
            let busy = slot
                .as_ref()
                .map(|pending| !pending.handle.is_finished())
                .unwrap_or(false);
            if busy {
                match self.settings.tracker.in_flight {
                    InFlightPolicy::Skip => {
                        lock(&self.metrics).skipped_in_flight += 1;
                        return Ok(TickOutcome::InFlight);
                    }
                    InFlightPolicy::Replace => {
                        if let Some(pending) = slot.take() {
                            debug!("Replacing outstanding analysis request {}", pending.seq);
                            pending.handle.abort();
                        }
                        lock(&self.metrics).replaced += 1;
                    }
                }
            }
        }

        let exercise = self.selector.current();
        let frame = match self.camera.capture_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("Skipping tick, no decodable frame: {}", err);
                lock(&self.metrics).skipped_not_ready += 1;
                return Ok(TickOutcome::NotReady);
            }
        };

        let (width, height) = lock(&self.surface)
            .dimensions()
            .unwrap_or_else(|| frame.dimensions());
        let quality = self.settings.jpeg_quality;
        let encode_started = Instant::now();
        let encoded =
            tokio::task::spawn_blocking(move || encode_jpeg(&frame, width, height, quality))
                .await
                .map_err(|err| tracker_error(format!("frame encoding task failed: {err}")))??;
        let encode_ms = encode_started.elapsed().as_millis() as u64;

        let request = AnalysisRequest {
            image: encoded.base64.clone(),
            exercise,
        };
        // stop() may have run while the frame was captured and encoded.
        let seq = {
            let lifecycle = lock(&self.lifecycle);
            let still_current = lifecycle
                .session
                .as_ref()
                .map(|current| Arc::ptr_eq(current, &session) && current.is_active())
                .unwrap_or(false);
            if !still_current {
                drop(lifecycle);
                debug!("Session {} ended before dispatch, dropping frame", session.id());
                lock(&self.metrics).skipped_not_ready += 1;
                return Ok(TickOutcome::NotReady);
            }
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            lock(&self.metrics).dispatched += 1;
            let handle = tokio::spawn(Arc::clone(self).complete(seq, request, encode_ms));
            *lock(&self.in_flight) = Some(InFlight { seq, handle });
            seq
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.persist(seq, &encoded) {
                warn!("Failed to archive frame {}: {}", seq, err);
            }
        }
        Ok(TickOutcome::Dispatched { seq })
    }

    async fn complete(self: Arc<Self>, seq: u64, request: AnalysisRequest, encode_ms: u64) {
        let started = Instant::now();
        let result = self.analysis.analyze(&request).await;
        let round_trip_ms = started.elapsed().as_millis() as u64;
        let outcome = self.apply_result(seq, result);

        if !matches!(outcome, AnalysisOutcome::Stale) {
            lock(&self.metrics).last_latency = Some(LatencySample {
                seq,
                encode_ms,
                round_trip_ms,
                captured_at: Utc::now(),
            });
        }
        self.publish(TrackerEvent::new(EventPayload::Analysis(AnalysisEvent {
            seq,
            exercise: request.exercise,
            outcome,
            round_trip_ms,
        })))
        .await;
    }

    /// Write a completed request to the display unless a newer one already did.
    fn apply_result(&self, seq: u64, result: Result<AnalysisResult>) -> AnalysisOutcome {
        let mut applied = lock(&self.applied_seq);
        if seq <= *applied {
            debug!("Discarding stale analysis response {} (have {})", seq, *applied);
            lock(&self.metrics).stale_discarded += 1;
            return AnalysisOutcome::Stale;
        }
        *applied = seq;

        match result {
            Ok(result) => {
                self.display.send_modify(|display| {
                    display.reps = reps_text(result.reps);
                    display.feedback = result.feedback.clone();
                });
                lock(&self.metrics).succeeded += 1;
                AnalysisOutcome::Success {
                    reps: result.reps,
                    feedback: result.feedback,
                }
            }
            Err(err) => {
                warn!("Analysis request {} failed: {}", seq, err);
                self.display.send_modify(|display| {
                    display.feedback = BACKEND_ERROR_MESSAGE.into();
                });
                lock(&self.metrics).failed += 1;
                AnalysisOutcome::Failure {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.settings.tracker.poll_interval_ms);
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            match Self::tick(&self).await {
                Ok(outcome) => debug!("Poll tick: {:?}", outcome),
                Err(err) => warn!("Poll tick failed: {}", err),
            }
        }
    }

    async fn render_loop(self: Arc<Self>, session: Arc<CaptureSession>) {
        let hz = f64::from(self.settings.tracker.refresh_hz.max(1));
        let mut refresh = interval(Duration::from_secs_f64(1.0 / hz));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while session.is_active() {
            refresh.tick().await;
            if !session.is_active() {
                break;
            }

            if session.dimensions().is_none() {
                let Some((width, height)) = self.camera.dimensions() else {
                    continue;
                };
                lock(&self.surface).resize(width, height);
                session.set_dimensions(width, height);
                self.display
                    .send_modify(|display| display.surface = Some((width, height)));
                info!("Surface sized to {}x{}", width, height);
                self.publish(TrackerEvent::lifecycle(
                    Some(session.id()),
                    SessionPhase::SurfaceReady,
                    Some(format!("{width}x{height}")),
                ))
                .await;
            }

            if !self.camera.is_ready() {
                continue;
            }
            let frame = match self.camera.capture_frame().await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("Render skipped: {}", err);
                    continue;
                }
            };
            let drawn = {
                let mut surface = lock(&self.surface);
                surface.draw(&frame).map(|_| surface.frames_drawn())
            };
            match drawn {
                Ok(frames) => self
                    .display
                    .send_modify(|display| display.frames_rendered = frames),
                Err(err) => debug!("Render failed: {}", err),
            }
        }
        debug!("Render loop for session {} finished", session.id());
    }

    async fn selection_changed(&self, exercise: Exercise) -> Result<Exercise> {
        info!("Exercise selected: {}", exercise);
        let shown = exercise.clone();
        self.display
            .send_modify(|display| display.exercise = shown);
        self.publish(TrackerEvent::new(EventPayload::Selection(SelectionEvent {
            exercise: exercise.clone(),
        })))
        .await;
        Ok(exercise)
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.lifecycle).acquire_generation == generation
    }

    async fn publish(&self, event: TrackerEvent) {
        if let Err(err) = self.bus.publish(event).await {
            warn!("Failed to publish tracker event: {}", err);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn tracker_error(message: impl Into<String>) -> ProtofitError {
    ProtofitError::Tracker(message.into())
}

#[cfg(test)]
mod tests;
