//! Real-time monitor for the gyro shaker.
//!
//! Usage:
//!   cargo run --bin tui               # scan forever until the sensor is found, then play
//!   cargo run --bin tui -- --simulate # use the built-in sensor simulator (no hardware needed)
//!
//! All flags of the `gyro-shaker` binary are accepted.
//!
//! Keys
//! ----
//!   +  / =   raise friction level
//!   -        lower friction level
//!   o        toggle only-roll (mute friction)
//!   z        zero the accumulated orientation
//!   q / Esc  quit

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Sparkline},
    Frame, Terminal,
};

use gyro_shaker::cli::Args;
use gyro_shaker::drive::DriveState;
use gyro_shaker::session::Session;
use gyro_shaker::synth::SynthParams;
use gyro_shaker::types::LinkState;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Render period (~30 FPS).
const FRAME: Duration = Duration::from_millis(33);

/// Energy history kept for the sparkline, one point per frame (~8 s).
const HISTORY_LEN: usize = 240;

/// Sparkline resolution: energy 1.0 maps to this bar height.
const HISTORY_SCALE: f32 = 1000.0;

/// Step applied to the friction level by `+` / `-`.
const LEVEL_STEP: f32 = 0.05;

/// Braille spinner frames cycled at ~100 ms intervals to indicate background activity.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

// ── App state ─────────────────────────────────────────────────────────────────

struct App {
    energy_hist: VecDeque<u64>,
    /// Orientation accumulated from per-frame deltas, degrees in (−180, 180].
    angles: [f32; 3],
    last_frame: Instant,
    rate_window: (Instant, u64),
    pkt_rate: f64,
    /// Last parameter change that did not fit in the channel, retried each frame.
    pending_params: Option<SynthParams>,
}

impl App {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            energy_hist: VecDeque::with_capacity(HISTORY_LEN),
            angles: [0.0; 3],
            last_frame: now,
            rate_window: (now, 0),
            pkt_rate: 0.0,
            pending_params: None,
        }
    }

    /// Consume one frame of drive output: energy history, orientation
    /// delta, and the payload rate.
    fn update(&mut self, drive: &DriveState) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        if self.energy_hist.len() == HISTORY_LEN {
            self.energy_hist.pop_front();
        }
        self.energy_hist
            .push_back((drive.energy() * HISTORY_SCALE) as u64);

        for (angle, delta) in self.angles.iter_mut().zip(drive.orientation_delta(dt)) {
            *angle = wrap_degrees(*angle + delta);
        }

        let (since, count) = self.rate_window;
        let elapsed = now.duration_since(since).as_secs_f64();
        if elapsed >= 1.0 {
            let total = drive.payload_count();
            self.pkt_rate = (total - count) as f64 / elapsed;
            self.rate_window = (now, total);
        }
    }
}

fn wrap_degrees(a: f32) -> f32 {
    let w = (a + 180.0).rem_euclid(360.0) - 180.0;
    if w == -180.0 {
        180.0
    } else {
        w
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App, session: &Session) {
    let area = frame.area();
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(4),
    ])
    .split(area);

    draw_header(frame, root[0], app, session);
    draw_body(frame, root[1], app, session);
    draw_footer(frame, root[2], session);
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

/// Status bar: title, link state, payload rate, and the live synth settings.
fn draw_header(frame: &mut Frame, area: Rect, app: &App, session: &Session) {
    let state = session.drive().link_state();
    let (label, color) = match state {
        LinkState::Connected => (format!("● {}", session.device_name()), Color::Green),
        LinkState::Idle => (
            format!("{} Scanning for {}…", spinner_str(), session.device_name()),
            Color::Yellow,
        ),
        other => (format!("{} {}…", spinner_str(), capitalise(&other.to_string())), Color::Yellow),
    };

    let synth = &session.config().synth;
    let level = format!("Level {:.2}", synth.level);
    let mode = if synth.only_roll { "Roll only" } else { "Friction + roll" };
    let rate = format!("{:.1} pkt/s", app.pkt_rate);
    let audio = match session.audio() {
        Some(out) => format!(
            "{} · {} Hz · {} ch",
            out.device_name(),
            out.sample_rate(),
            out.channels()
        ),
        None => "no audio".to_owned(),
    };

    let line = Line::from(vec![
        Span::styled(
            " GYRO SHAKER ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        sep(),
        Span::styled(rate, Style::default().fg(Color::White)),
        sep(),
        Span::styled(
            level,
            Style::default()
                .fg(Color::LightBlue)
                .add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(mode, Style::default().fg(Color::White)),
        sep(),
        Span::styled(audio, Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
    ]);

    frame.render_widget(
        Paragraph::new(line).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

fn draw_body(frame: &mut Frame, area: Rect, app: &App, session: &Session) {
    let cols = Layout::horizontal([Constraint::Percentage(65), Constraint::Percentage(35)]).split(area);
    let left = Layout::vertical([Constraint::Length(3), Constraint::Min(0)]).split(cols[0]);

    let drive = session.drive();
    let energy = drive.energy().clamp(0.0, 1.0);
    let gauge_color = if energy > 0.6 {
        Color::Red
    } else if energy > 0.2 {
        Color::Yellow
    } else {
        Color::Green
    };
    frame.render_widget(
        Gauge::default()
            .block(Block::default().borders(Borders::ALL).title(" Energy "))
            .gauge_style(Style::default().fg(gauge_color))
            .ratio(f64::from(energy))
            .label(format!("{energy:.3}")),
        left[0],
    );

    let history: Vec<u64> = app.energy_hist.iter().copied().collect();
    frame.render_widget(
        Sparkline::default()
            .block(Block::default().borders(Borders::ALL).title(" Energy history "))
            .style(Style::default().fg(Color::Cyan))
            .max(HISTORY_SCALE as u64)
            .data(&history),
        left[1],
    );

    draw_orientation(frame, cols[1], app, drive);
}

/// Accumulated orientation, raw gyro vector, and link counters.
fn draw_orientation(frame: &mut Frame, area: Rect, app: &App, drive: &DriveState) {
    let g = drive.orientation();
    let dim = Style::default().fg(Color::DarkGray);
    let axis = |name: &'static str, angle: f32, raw: f32, color: Color| {
        Line::from(vec![
            Span::styled(format!(" {name} "), dim),
            Span::styled(
                format!("{angle:+7.1}°"),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  raw {raw:+9.0}"), dim),
        ])
    };
    let counter = |name: &'static str, value: u64| {
        Line::from(vec![
            Span::styled(format!(" {name:<11}"), dim),
            Span::styled(value.to_string(), Style::default().fg(Color::White)),
        ])
    };

    let lines = vec![
        axis("x", app.angles[0], g.x, Color::Cyan),
        axis("y", app.angles[1], g.y, Color::Yellow),
        axis("z", app.angles[2], g.z, Color::Magenta),
        Line::raw(""),
        counter("payloads", drive.payload_count()),
        counter("rejected", drive.rejected_count()),
        counter("reconnects", drive.reconnect_count()),
    ];

    frame.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Orientation ")),
        area,
    );
}

fn draw_footer(frame: &mut Frame, area: Rect, session: &Session) {
    let keys = Line::from(vec![
        Span::raw(" "),
        key("[+]"),
        Span::raw("Level↑  "),
        key("[-]"),
        Span::raw("Level↓  "),
        key("[o]"),
        Span::raw(if session.config().synth.only_roll {
            "Friction on  "
        } else {
            "Roll only  "
        }),
        key("[z]"),
        Span::raw("Zero orientation  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);

    let hint = match session.drive().link_state() {
        LinkState::Idle => {
            let base = if cfg!(target_os = "macos") {
                " Sensor not found yet. On macOS grant Bluetooth access: System Settings → Privacy & Security → Bluetooth."
            } else {
                " Sensor not found yet. Make sure it is powered on and in range."
            };
            Line::from(Span::styled(base, Style::default().fg(Color::Yellow)))
        }
        _ => Line::from(Span::styled(
            " Logs: gyro-shaker-tui.log",
            Style::default().fg(Color::DarkGray),
        )),
    };

    frame.render_widget(
        Paragraph::new(vec![keys, hint]).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

// ── Input ─────────────────────────────────────────────────────────────────────

fn adjust_params(app: &mut App, session: &mut Session, f: impl FnOnce(&mut SynthParams)) {
    let mut params = app.pending_params.unwrap_or(session.config().synth);
    f(&mut params);
    app.pending_params = (!session.set_synth_params(params)).then_some(params);
}

// ── main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: gyro-shaker tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    // ── Logging ─────────────────────────────────────────────────────────────
    // Write logs to a file so they never interfere with the TUI display.
    //   RUST_LOG=gyro_shaker=debug cargo run --bin tui
    {
        use std::fs::File;
        if let Ok(file) = File::create("gyro-shaker-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    let args = Args::parse();
    let mut session = Session::from_args(&args)?;
    let mut app = App::new();

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    // ── Main loop ─────────────────────────────────────────────────────────────
    let result = (|| -> Result<()> {
        loop {
            if let Some(params) = app.pending_params {
                if session.set_synth_params(params) {
                    app.pending_params = None;
                }
            }

            app.update(session.drive());
            terminal.draw(|f| draw(f, &app, &session))?;

            if !event::poll(FRAME)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };

            // In raw mode Ctrl+C arrives as a key event.
            let ctrl_c =
                key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                _ if ctrl_c => return Ok(()),
                KeyCode::Char('+') | KeyCode::Char('=') => {
                    adjust_params(&mut app, &mut session, |p| p.level += LEVEL_STEP);
                }
                KeyCode::Char('-') => {
                    adjust_params(&mut app, &mut session, |p| p.level -= LEVEL_STEP);
                }
                KeyCode::Char('o') => {
                    adjust_params(&mut app, &mut session, |p| p.only_roll = !p.only_roll);
                }
                KeyCode::Char('z') => app.angles = [0.0; 3],
                _ => {}
            }
        }
    })();

    // ── Teardown ──────────────────────────────────────────────────────────────
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    session.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_keeps_angles_in_half_open_range() {
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-190.0), 170.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(45.0), 45.0);
    }

    #[test]
    fn capitalise_first_letter() {
        assert_eq!(capitalise("subscribing"), "Subscribing");
        assert_eq!(capitalise(""), "");
    }
}
