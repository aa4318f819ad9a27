use std::{
    collections::VecDeque,
    sync::mpsc::{Receiver, TryRecvError},
    time::Duration,
};

use anyhow::Result;
use crossterm::{
    event::{self, Event as CEvent, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use protofit_types::{
    display::DisplayState,
    events::{AnalysisOutcome, EventPayload, TrackerEvent},
    exercise::Exercise,
    vision::ImageFrame,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::sync::mpsc::UnboundedSender;

const MAX_LOG_ENTRIES: usize = 120;

pub enum UiMessage {
    Display(DisplayState),
    Event(TrackerEvent),
    Preview(ImageFrame),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    Start,
    Stop,
    Next,
    Previous,
    Select(usize),
    DismissAlert,
    Quit,
}

struct View {
    display: Option<DisplayState>,
    preview: Option<ImageFrame>,
    logs: VecDeque<String>,
}

pub fn run(
    receiver: Receiver<UiMessage>,
    commands: UnboundedSender<UiCommand>,
    exercises: Vec<Exercise>,
    summary: String,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;

    let res = run_loop(&mut terminal, receiver, &commands, &exercises, summary.as_str());

    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    let _ = commands.send(UiCommand::Quit);
    res
}

fn run_loop<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    receiver: Receiver<UiMessage>,
    commands: &UnboundedSender<UiCommand>,
    exercises: &[Exercise],
    summary: &str,
) -> Result<()> {
    let mut view = View {
        display: None,
        preview: None,
        logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
    };

    loop {
        let mut should_close = false;
        loop {
            match receiver.try_recv() {
                Ok(UiMessage::Display(display)) => {
                    if display.surface.is_none() {
                        view.preview = None;
                    }
                    view.display = Some(display);
                }
                Ok(UiMessage::Event(event)) => {
                    if view.logs.len() == MAX_LOG_ENTRIES {
                        view.logs.pop_front();
                    }
                    view.logs.push_back(format_event(&event));
                }
                Ok(UiMessage::Preview(frame)) => view.preview = Some(frame),
                Ok(UiMessage::Shutdown) => should_close = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    should_close = true;
                    break;
                }
            }
        }
        if should_close {
            break;
        }

        terminal.draw(|f| draw(f, &view, exercises, summary))?;

        if event::poll(Duration::from_millis(50))? {
            if let CEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let alert_open = view
                    .display
                    .as_ref()
                    .map(|display| display.alert.is_some())
                    .unwrap_or(false);
                let command = match key.code {
                    KeyCode::Enter | KeyCode::Esc if alert_open => Some(UiCommand::DismissAlert),
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('s') => Some(UiCommand::Start),
                    KeyCode::Char('x') => Some(UiCommand::Stop),
                    KeyCode::Left => Some(UiCommand::Previous),
                    KeyCode::Right => Some(UiCommand::Next),
                    KeyCode::Char(c) => c
                        .to_digit(10)
                        .filter(|digit| *digit >= 1)
                        .map(|digit| UiCommand::Select(digit as usize - 1)),
                    _ => None,
                };
                if let Some(command) = command {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn draw(f: &mut Frame, view: &View, exercises: &[Exercise], summary: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Min(0)].as_ref())
        .split(f.size());

    let idle = DisplayState::new(exercises.first().cloned().unwrap_or_else(|| Exercise::new("")));
    let display = view.display.as_ref().unwrap_or(&idle);

    let choices: Vec<Span> = exercises
        .iter()
        .enumerate()
        .flat_map(|(index, exercise)| {
            let style = if *exercise == display.exercise {
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Cyan)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            [
                Span::styled(format!("{} {}", index + 1, exercise.display_name()), style),
                Span::raw("  "),
            ]
        })
        .collect();

    let start_hint = if display.start_enabled {
        Span::styled("s start", Style::default().fg(Color::Green))
    } else {
        Span::styled("s start", Style::default().fg(Color::DarkGray))
    };

    let header = Paragraph::new(vec![
        Line::from(vec![
            Span::styled(
                "ProtoFit",
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw("  "),
            Span::raw(display.status.clone()),
            Span::raw("  "),
            Span::styled(summary.to_string(), Style::default().fg(Color::Magenta)),
        ]),
        Line::from(vec![
            Span::styled(
                display.reps.clone(),
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw("  "),
            Span::raw(display.feedback.clone()),
        ]),
        Line::from(choices),
        Line::from(vec![
            start_hint,
            Span::raw("  x stop  \u{2190}/\u{2192} exercise  q quit"),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Session"));
    f.render_widget(header, chunks[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)].as_ref())
        .split(chunks[1]);

    let preview_title = match display.surface {
        Some((width, height)) => format!("Camera {width}x{height} ({} frames)", display.frames_rendered),
        None => "Camera".to_string(),
    };
    let preview = Paragraph::new(preview_lines(view.preview.as_ref()))
        .block(Block::default().borders(Borders::ALL).title(preview_title));
    f.render_widget(preview, body[0]);

    let items: Vec<ListItem> = view
        .logs
        .iter()
        .rev()
        .map(|entry| ListItem::new(entry.clone()))
        .collect();
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Events"));
    f.render_widget(list, body[1]);

    if let Some(alert) = &display.alert {
        let area = centered(f.size(), 60, 7);
        let popup = Paragraph::new(vec![
            Line::from(alert.clone()),
            Line::from(""),
            Line::from(Span::styled(
                "Enter to dismiss",
                Style::default().fg(Color::DarkGray),
            )),
        ])
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Alert")
                .border_style(Style::default().fg(Color::Red)),
        );
        f.render_widget(Clear, area);
        f.render_widget(popup, area);
    }
}

/// Two pixel rows per terminal row using the upper half block.
fn preview_lines(frame: Option<&ImageFrame>) -> Vec<Line<'static>> {
    let Some(frame) = frame else {
        return vec![Line::from("no camera")];
    };
    let (width, height) = frame.dimensions();
    (0..height)
        .step_by(2)
        .map(|y| {
            let spans: Vec<Span> = (0..width)
                .map(|x| {
                    let top = frame.pixel(x, y).unwrap_or([0, 0, 0, 255]);
                    let bottom = frame.pixel(x, y + 1).unwrap_or([0, 0, 0, 255]);
                    Span::styled(
                        "\u{2580}",
                        Style::default()
                            .fg(Color::Rgb(top[0], top[1], top[2]))
                            .bg(Color::Rgb(bottom[0], bottom[1], bottom[2])),
                    )
                })
                .collect();
            Line::from(spans)
        })
        .collect()
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn format_event(event: &TrackerEvent) -> String {
    let timestamp = event.timestamp.format("%H:%M:%S");
    match &event.payload {
        EventPayload::Lifecycle(lifecycle) => format!(
            "[{}] {:?} {}",
            timestamp,
            lifecycle.phase,
            lifecycle.details.clone().unwrap_or_default()
        ),
        EventPayload::Analysis(analysis) => match &analysis.outcome {
            AnalysisOutcome::Success { reps, feedback } => format!(
                "[{}] #{} {} reps={} \"{}\" {}ms",
                timestamp, analysis.seq, analysis.exercise, reps, feedback, analysis.round_trip_ms
            ),
            AnalysisOutcome::Failure { reason } => {
                format!("[{}] #{} failed: {}", timestamp, analysis.seq, reason)
            }
            AnalysisOutcome::Stale => format!("[{}] #{} stale, dropped", timestamp, analysis.seq),
        },
        EventPayload::Selection(selection) => {
            format!("[{}] exercise -> {}", timestamp, selection.exercise)
        }
        EventPayload::Telemetry(summary) => format!(
            "[{}] session summary: {} sent, {} ok, {} failed",
            timestamp, summary.ticks.dispatched, summary.ticks.succeeded, summary.ticks.failed
        ),
    }
}
