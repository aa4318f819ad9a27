mod ui;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{anyhow, Result};
use clap::Parser;
use futures::{stream::BoxStream, StreamExt};
use protofit_analysis::{AnalysisService, HttpAnalysisClient};
use protofit_camera::{open_camera, CameraSource};
use protofit_events::{EventBus, LocalBus};
use protofit_ops::{init_tracing, TelemetryStore};
use protofit_tracker::{Tracker, TrackerSettings};
use protofit_types::{
    config::ProtofitConfig, display::DisplayState, events::TrackerEvent, exercise::Exercise,
    ProtofitError,
};
use protofit_vision::thumbnail;
use tokio::{
    sync::mpsc::unbounded_channel,
    time::{interval, Duration},
};
use tracing::{debug, info, warn};

use ui::{UiCommand, UiMessage};

type AppTracker = Tracker<Arc<dyn CameraSource>, HttpAnalysisClient, LocalBus>;

const PREVIEW_PERIOD: Duration = Duration::from_millis(100);
const PREVIEW_SIZE: (u32, u32) = (64, 48);

#[derive(Parser, Debug)]
#[command(name = "protofit", about = "Webcam exercise tracker client")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "PROTOFIT_CONFIG", default_value = "configs/dev.toml")]
    config: PathBuf,
    /// Override `analysis.endpoint`.
    #[arg(long)]
    endpoint: Option<String>,
    /// Exercise selected at startup.
    #[arg(long)]
    exercise: Option<String>,
    /// Start tracking immediately and log results instead of drawing the TUI.
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config);
    if let Some(endpoint) = args.endpoint {
        config.analysis.endpoint = endpoint;
    }
    if let Some(exercise) = args.exercise {
        config.tracker.default_exercise = Some(Exercise::new(exercise));
    }
    // The TUI owns the terminal, so logs go to a file unless configured otherwise.
    if !args.headless && config.ops.log_file.is_none() {
        config.ops.log_file = Some("protofit.log".into());
    }
    config.validate()?;
    init_tracing(&config.ops)?;

    let camera = open_camera(&config.camera)?;
    let analysis = HttpAnalysisClient::new(&config.analysis)?;
    if config.analysis.health_check {
        if let Err(err) = analysis.health().await {
            warn!("Analysis service not reachable yet: {}", err);
        }
    }

    let bus = LocalBus::default();
    let telemetry = TelemetryStore::with_capacity(config.ops.telemetry_events);
    let telemetry_task = telemetry.attach(&bus);
    let ui_events = bus.subscribe();

    let tracker = Arc::new(Tracker::new(
        TrackerSettings::from_config(&config),
        camera,
        analysis,
        bus,
    )?);
    info!(
        "Tracker ready: endpoint={} poll={}ms exercises={:?}",
        config.analysis.endpoint,
        config.tracker.poll_interval_ms,
        config
            .tracker
            .exercises
            .iter()
            .map(Exercise::as_str)
            .collect::<Vec<_>>()
    );

    let outcome = if args.headless {
        run_headless(&tracker).await
    } else {
        let summary = format!(
            "{} every {}ms",
            config.analysis.endpoint, config.tracker.poll_interval_ms
        );
        run_interactive(
            Arc::clone(&tracker),
            ui_events,
            config.tracker.exercises.clone(),
            summary,
        )
        .await
    };

    if let Err(err) = tracker.stop().await {
        warn!("Failed to stop tracker cleanly: {}", err);
    }
    // Let the store pick up the final session summary.
    tokio::time::sleep(Duration::from_millis(50)).await;
    telemetry_task.abort();
    for summary in telemetry.session_summaries().await {
        info!(
            "Session {}: {} requests, {} ok, {} failed, {} frames rendered",
            summary.session,
            summary.ticks.dispatched,
            summary.ticks.succeeded,
            summary.ticks.failed,
            summary.frames_rendered
        );
    }
    outcome
}

async fn run_headless(tracker: &AppTracker) -> Result<()> {
    let mut display = tracker.watch_display();
    if let Err(err) = tracker.start().await {
        let message = start_failure_message(&tracker.display(), &err);
        eprintln!("{message}");
        return Err(anyhow!(message));
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last = display.borrow().clone();
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, stopping");
                break;
            }
            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = display.borrow_and_update().clone();
                if current.reps != last.reps || current.feedback != last.feedback {
                    info!("[{}] {} | {}", current.exercise, current.reps, current.feedback);
                }
                last = current;
            }
        }
    }
    Ok(())
}

async fn run_interactive(
    tracker: Arc<AppTracker>,
    mut events: BoxStream<'static, TrackerEvent>,
    exercises: Vec<Exercise>,
    summary: String,
) -> Result<()> {
    let (ui_tx, ui_rx) = std::sync::mpsc::channel();
    let (cmd_tx, mut cmd_rx) = unbounded_channel();
    let ui_thread = thread::spawn(move || ui::run(ui_rx, cmd_tx, exercises, summary));

    let mut display = tracker.watch_display();
    let _ = ui_tx.send(UiMessage::Display(display.borrow().clone()));
    let mut preview = interval(PREVIEW_PERIOD);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(UiCommand::Quit) | None => break,
                Some(command) => handle_command(&tracker, command).await,
            },
            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = display.borrow_and_update().clone();
                if ui_tx.send(UiMessage::Display(current)).is_err() {
                    break;
                }
            }
            Some(event) = events.next() => {
                if ui_tx.send(UiMessage::Event(event)).is_err() {
                    break;
                }
            }
            _ = preview.tick() => {
                let Some(frame) = tracker.surface_snapshot() else {
                    continue;
                };
                match thumbnail(&frame, PREVIEW_SIZE.0, PREVIEW_SIZE.1) {
                    Ok(small) => {
                        if ui_tx.send(UiMessage::Preview(small)).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!("Preview skipped: {}", err),
                }
            }
        }
    }

    let _ = ui_tx.send(UiMessage::Shutdown);
    drop(ui_tx);
    match ui_thread.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("UI thread panicked")),
    }
}

async fn handle_command(tracker: &Arc<AppTracker>, command: UiCommand) {
    let result = match command {
        UiCommand::Start => {
            // acquire() may wait on the camera for a while.
            let tracker = Arc::clone(tracker);
            tokio::spawn(async move {
                match tracker.start().await {
                    Ok(outcome) => debug!("start: {:?}", outcome),
                    Err(err) => warn!("start failed: {}", err),
                }
            });
            Ok(())
        }
        UiCommand::Stop => tracker.stop().await.map(|_| ()),
        UiCommand::Next => tracker.select_next().await.map(|_| ()),
        UiCommand::Previous => tracker.select_previous().await.map(|_| ()),
        UiCommand::Select(index) => tracker.select_index(index).await.map(|_| ()),
        UiCommand::DismissAlert => {
            tracker.dismiss_alert();
            Ok(())
        }
        UiCommand::Quit => Ok(()),
    };
    if let Err(err) = result {
        warn!("{:?} failed: {}", command, err);
    }
}

/// The alert the tracker raised for a failed start, or the bare error.
fn start_failure_message(display: &DisplayState, err: &ProtofitError) -> String {
    display.alert.clone().unwrap_or_else(|| err.to_string())
}

fn load_config(path: &Path) -> ProtofitConfig {
    match ProtofitConfig::from_file(path) {
        Ok(cfg) => {
            if let Err(err) = cfg.validate() {
                eprintln!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                );
                ProtofitConfig::default()
            } else {
                cfg
            }
        }
        Err(err) => {
            eprintln!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            );
            ProtofitConfig::default()
        }
    }
}
