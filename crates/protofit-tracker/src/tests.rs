use std::collections::VecDeque;

use async_trait::async_trait;
use protofit_camera::MockCamera;
use protofit_events::LocalBus;
use tokio::{
    sync::Semaphore,
    time::{sleep, timeout},
};

use super::*;

enum Reply {
    Ok(u32, &'static str),
    Status(u16, &'static str),
    Unreachable,
}

/// Analysis double that replays canned replies and records every request.
struct ScriptedAnalysis {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<AnalysisRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAnalysis {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Every call blocks until the returned semaphore gets a permit.
    fn gated(replies: Vec<Reply>) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut analysis = Self::new(replies);
        analysis.gate = Some(Arc::clone(&gate));
        (analysis, gate)
    }

    fn requests(&self) -> Vec<AnalysisRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        lock(&self.requests).push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .expect("gate semaphore open")
                .forget();
        }
        let reply = lock(&self.replies).pop_front();
        match reply.unwrap_or(Reply::Ok(0, "")) {
            Reply::Ok(reps, feedback) => Ok(AnalysisResult {
                reps,
                feedback: feedback.into(),
            }),
            Reply::Status(status, body) => Err(ProtofitError::AnalysisStatus {
                status,
                body: body.into(),
            }),
            Reply::Unreachable => Err(ProtofitError::Analysis(
                "request to http://localhost:5000/analyze failed: connection refused".into(),
            )),
        }
    }

    async fn health(&self) -> Result<String> {
        Ok("ProtoFit backend running.".into())
    }
}

type TestTracker = Tracker<Arc<MockCamera>, Arc<ScriptedAnalysis>, LocalBus>;

fn settings() -> TrackerSettings {
    let mut settings = TrackerSettings::default();
    // Keep the timer out of the way; tests drive ticks by hand.
    settings.tracker.poll_interval_ms = 60_000;
    settings
}

fn tracker_with(
    settings: TrackerSettings,
    camera: MockCamera,
    analysis: ScriptedAnalysis,
) -> (TestTracker, Arc<MockCamera>, Arc<ScriptedAnalysis>) {
    let camera = Arc::new(camera);
    let analysis = Arc::new(analysis);
    let tracker = Tracker::new(
        settings,
        Arc::clone(&camera),
        Arc::clone(&analysis),
        LocalBus::new(64),
    )
    .expect("tracker");
    (tracker, camera, analysis)
}

fn small_camera() -> MockCamera {
    MockCamera::with_resolution(32, 24)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn start_disables_further_starts() {
    let (tracker, camera, _) = tracker_with(settings(), small_camera(), ScriptedAnalysis::new(vec![]));
    assert!(tracker.display().start_enabled);

    let outcome = tracker.start().await.expect("start");
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(tracker.state(), TrackerState::Active);
    assert!(tracker.has_poll_timer());

    let display = tracker.display();
    assert!(!display.start_enabled);
    assert_eq!(display.feedback, "Tracking...");

    assert_eq!(tracker.start().await.expect("second start"), StartOutcome::AlreadyRunning);
    assert_eq!(camera.metrics().acquisitions, 1);
}

#[tokio::test]
async fn denied_camera_alerts_without_timer() {
    let camera = small_camera().denying("NotAllowedError: Permission denied");
    let (tracker, _, analysis) = tracker_with(settings(), camera, ScriptedAnalysis::new(vec![]));

    let err = tracker.start().await.expect_err("denied");
    assert!(matches!(err, ProtofitError::Camera(_)));

    let display = tracker.display();
    assert_eq!(
        display.alert.as_deref(),
        Some("Could not access webcam: NotAllowedError: Permission denied")
    );
    assert!(display.start_enabled);
    assert!(!tracker.has_poll_timer());
    assert_eq!(tracker.state(), TrackerState::Idle);
    assert!(tracker.session().is_none());

    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::NotReady);
    assert!(analysis.requests().is_empty());

    tracker.dismiss_alert();
    assert!(tracker.display().alert.is_none());
}

#[tokio::test]
async fn ticks_without_ready_sink_send_nothing() {
    let (tracker, camera, analysis) = tracker_with(
        settings(),
        small_camera().manual_ready(),
        ScriptedAnalysis::new(vec![]),
    );

    assert_eq!(tracker.tick().await.expect("tick before start"), TickOutcome::NotReady);

    tracker.start().await.expect("start");
    for _ in 0..3 {
        assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::NotReady);
    }
    assert!(analysis.requests().is_empty());
    assert_eq!(tracker.metrics().skipped_not_ready, 4);

    camera.set_ready(true);
    assert!(matches!(
        tracker.tick().await.expect("tick"),
        TickOutcome::Dispatched { .. }
    ));
    tracker.settle().await;
    assert_eq!(analysis.requests().len(), 1);
}

#[tokio::test]
async fn successful_response_updates_both_fields() {
    let (tracker, _, analysis) = tracker_with(
        settings(),
        small_camera(),
        ScriptedAnalysis::new(vec![Reply::Ok(7, "Good form")]),
    );
    tracker.start().await.expect("start");

    assert_eq!(
        tracker.tick().await.expect("tick"),
        TickOutcome::Dispatched { seq: 1 }
    );
    tracker.settle().await;

    let display = tracker.display();
    assert_eq!(display.reps, "Reps: 7");
    assert_eq!(display.feedback, "Good form");
    assert_eq!(tracker.metrics().succeeded, 1);

    let requests = analysis.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].image.is_empty());
    assert!(!requests[0].image.starts_with("data:"));
}

#[tokio::test]
async fn server_error_shows_generic_message() {
    let (tracker, _, _) = tracker_with(
        settings(),
        small_camera(),
        ScriptedAnalysis::new(vec![Reply::Ok(2, "Squat low!"), Reply::Status(500, "internal error")]),
    );
    tracker.start().await.expect("start");

    tracker.tick().await.expect("first tick");
    tracker.settle().await;
    tracker.tick().await.expect("second tick");
    tracker.settle().await;

    let display = tracker.display();
    assert_eq!(display.feedback, "Error connecting to backend.");
    assert_eq!(display.reps, "Reps: 2");
    assert_eq!(tracker.metrics().failed, 1);
}

#[tokio::test]
async fn unreachable_service_shows_generic_message() {
    let (tracker, _, _) = tracker_with(
        settings(),
        small_camera(),
        ScriptedAnalysis::new(vec![Reply::Unreachable, Reply::Ok(1, "Full curl!")]),
    );
    tracker.start().await.expect("start");

    tracker.tick().await.expect("tick");
    tracker.settle().await;
    assert_eq!(tracker.display().feedback, "Error connecting to backend.");

    // Failures are not fatal; the next tick goes out as usual.
    tracker.tick().await.expect("tick after failure");
    tracker.settle().await;
    assert_eq!(tracker.display().feedback, "Full curl!");
}

#[tokio::test]
async fn exercise_is_read_when_the_tick_fires() {
    let (tracker, _, analysis) =
        tracker_with(settings(), small_camera(), ScriptedAnalysis::new(vec![]));
    assert_eq!(tracker.selector().current().as_str(), "squat");
    tracker.start().await.expect("start");

    tracker
        .select_exercise(&Exercise::new("pushup"))
        .await
        .expect("select pushup");
    tracker.tick().await.expect("tick");
    tracker.settle().await;

    tracker.select_next().await.expect("select next");
    tracker.tick().await.expect("tick");
    tracker.settle().await;

    let sent: Vec<String> = analysis
        .requests()
        .iter()
        .map(|request| request.exercise.to_string())
        .collect();
    assert_eq!(sent, vec!["pushup", "bicep_curl"]);
    assert_eq!(tracker.display().exercise.as_str(), "bicep_curl");
    assert!(tracker
        .select_exercise(&Exercise::new("deadlift"))
        .await
        .is_err());
}

#[tokio::test]
async fn skip_policy_holds_one_request_at_a_time() {
    let (analysis, gate) = ScriptedAnalysis::gated(vec![Reply::Ok(1, "first"), Reply::Ok(2, "second")]);
    let (tracker, _, analysis) = tracker_with(settings(), small_camera(), analysis);
    tracker.start().await.expect("start");

    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::Dispatched { seq: 1 });
    wait_until(|| analysis.requests().len() == 1).await;
    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::InFlight);
    assert_eq!(tracker.metrics().skipped_in_flight, 1);

    gate.add_permits(1);
    tracker.settle().await;
    assert_eq!(tracker.display().feedback, "first");

    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::Dispatched { seq: 2 });
    gate.add_permits(1);
    tracker.settle().await;
    assert_eq!(tracker.display().reps, "Reps: 2");
    assert_eq!(analysis.requests().len(), 2);
}

#[tokio::test]
async fn replace_policy_cancels_the_outstanding_request() {
    let mut settings = settings();
    settings.tracker.in_flight = InFlightPolicy::Replace;
    let (analysis, gate) = ScriptedAnalysis::gated(vec![Reply::Ok(9, "newest")]);
    let (tracker, _, analysis) = tracker_with(settings, small_camera(), analysis);
    tracker.start().await.expect("start");

    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::Dispatched { seq: 1 });
    wait_until(|| analysis.requests().len() == 1).await;
    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::Dispatched { seq: 2 });
    wait_until(|| analysis.requests().len() == 2).await;

    gate.add_permits(1);
    tracker.settle().await;

    let display = tracker.display();
    assert_eq!(display.reps, "Reps: 9");
    assert_eq!(display.feedback, "newest");
    let metrics = tracker.metrics();
    assert_eq!(metrics.replaced, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[tokio::test]
async fn stale_responses_never_overwrite_newer_ones() {
    let (tracker, _, _) = tracker_with(settings(), small_camera(), ScriptedAnalysis::new(vec![]));

    let newer = tracker.shared.apply_result(
        5,
        Ok(AnalysisResult {
            reps: 4,
            feedback: "Good depth!".into(),
        }),
    );
    assert!(matches!(newer, AnalysisOutcome::Success { reps: 4, .. }));

    let older = tracker.shared.apply_result(
        3,
        Err(ProtofitError::Analysis("timed out".into())),
    );
    assert_eq!(older, AnalysisOutcome::Stale);

    let display = tracker.display();
    assert_eq!(display.reps, "Reps: 4");
    assert_eq!(display.feedback, "Good depth!");
    assert_eq!(tracker.metrics().stale_discarded, 1);
}

#[tokio::test]
async fn stop_releases_camera_and_allows_restart() {
    let (tracker, camera, _) =
        tracker_with(settings(), small_camera(), ScriptedAnalysis::new(vec![]));
    assert!(!tracker.stop().await.expect("stop while idle"));

    tracker.start().await.expect("start");
    let first_session = tracker.session().expect("session");
    assert!(tracker.stop().await.expect("stop"));

    assert_eq!(tracker.state(), TrackerState::Idle);
    assert!(!tracker.has_poll_timer());
    assert!(!first_session.is_active());
    assert!(!camera.is_streaming());
    assert_eq!(camera.metrics().releases, 1);
    let display = tracker.display();
    assert!(display.start_enabled);
    assert_eq!(display.status, "Stopped");
    assert_eq!(tracker.tick().await.expect("tick"), TickOutcome::NotReady);

    tracker.start().await.expect("restart");
    let second_session = tracker.session().expect("second session");
    assert_ne!(first_session.id(), second_session.id());
    assert!(tracker.has_poll_timer());
    assert_eq!(camera.metrics().acquisitions, 2);
}

#[tokio::test]
async fn restart_after_cancelled_acquire_owns_the_camera() {
    let camera = small_camera().acquire_delay(Duration::from_millis(100));
    let (tracker, camera, _) = tracker_with(settings(), camera, ScriptedAnalysis::new(vec![]));
    let tracker = Arc::new(tracker);

    let first = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        async move { tracker.start().await }
    });
    wait_until(|| tracker.state() == TrackerState::Acquiring).await;
    assert!(tracker.stop().await.expect("stop while acquiring"));
    assert_eq!(tracker.state(), TrackerState::Idle);
    assert!(tracker.display().start_enabled);

    let second = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        async move { tracker.start().await }
    });
    let first = first.await.expect("first start joined").expect("first start");
    let second = second.await.expect("second start joined").expect("second start");
    assert_eq!(first, StartOutcome::Cancelled);
    assert!(matches!(second, StartOutcome::Started { .. }));

    assert_eq!(tracker.state(), TrackerState::Active);
    assert!(tracker.has_poll_timer());
    assert!(camera.is_streaming());
    assert!(camera.is_ready());
    let display = tracker.display();
    assert!(!display.start_enabled);
    assert_eq!(display.status, "Tracking");

    assert!(matches!(
        tracker.tick().await.expect("tick"),
        TickOutcome::Dispatched { .. }
    ));
    tracker.settle().await;
    assert_eq!(
        tracker.start().await.expect("start while active"),
        StartOutcome::AlreadyRunning
    );
}

#[tokio::test]
async fn tick_racing_stop_sends_nothing() {
    let camera = small_camera().frame_delay(Duration::from_millis(150));
    let (tracker, _, analysis) = tracker_with(settings(), camera, ScriptedAnalysis::new(vec![]));
    let tracker = Arc::new(tracker);
    tracker.start().await.expect("start");

    let tick = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        async move { tracker.tick().await }
    });
    sleep(Duration::from_millis(30)).await;
    assert!(tracker.stop().await.expect("stop"));

    let outcome = tick.await.expect("tick joined").expect("tick");
    assert_eq!(outcome, TickOutcome::NotReady);
    tracker.settle().await;
    assert!(analysis.requests().is_empty());
    assert_eq!(tracker.metrics().dispatched, 0);
    assert_eq!(tracker.display().status, "Stopped");
}

#[tokio::test]
async fn poll_timer_submits_frames_on_its_own() {
    let mut settings = settings();
    settings.tracker.poll_interval_ms = 20;
    let (tracker, _, analysis) =
        tracker_with(settings, small_camera(), ScriptedAnalysis::new(vec![]));
    tracker.start().await.expect("start");

    wait_until(|| analysis.requests().len() >= 3).await;
    assert!(tracker.metrics().dispatched >= 3);
    tracker.stop().await.expect("stop");
}

#[tokio::test]
async fn render_loop_sizes_and_fills_the_surface() {
    let (tracker, _, _) = tracker_with(settings(), small_camera(), ScriptedAnalysis::new(vec![]));
    let mut display = tracker.watch_display();
    tracker.start().await.expect("start");

    timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = display.borrow_and_update();
                if current.surface == Some((32, 24)) && current.frames_rendered >= 2 {
                    break;
                }
            }
            display.changed().await.expect("display sender alive");
        }
    })
    .await
    .expect("surface rendered");

    let snapshot = tracker.surface_snapshot().expect("surface contents");
    assert_eq!(snapshot.dimensions(), (32, 24));
    assert_eq!(
        tracker.session().and_then(|session| session.dimensions()),
        Some((32, 24))
    );
}

#[tokio::test]
async fn archive_keeps_dispatched_frames() {
    let dir = std::env::temp_dir().join(format!("protofit-tracker-archive-{}", std::process::id()));
    let mut settings = settings();
    settings.capture_dir = Some(dir.clone());
    let (tracker, _, _) = tracker_with(settings, small_camera(), ScriptedAnalysis::new(vec![]));
    tracker.start().await.expect("start");

    tracker.tick().await.expect("tick");
    tracker.settle().await;

    let files = std::fs::read_dir(&dir).expect("archive dir").count();
    assert_eq!(files, 1);
    std::fs::remove_dir_all(&dir).expect("cleanup");
}
