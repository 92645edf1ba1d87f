//! TUI dashboard for Fluxmon flow meter monitoring and debugging
//!
//! Run with: cargo run --example meter_dashboard
//!
//! This example provides a terminal interface for:
//! - Discovering nearby Fluxmon meters
//! - Watching both totalizer banks and the live flow rates
//! - Resetting either totalizer bank
//! - Debugging session and connectivity issues
//!
//! ## Keyboard Controls
//!
//! | Key | Action |
//! |-----|--------|
//! | `Up/Down` | Navigate meter list |
//! | `Enter` | Connect/disconnect selected meter |
//! | `A` | Reset bank A totalizer |
//! | `B` | Reset bank B totalizer |
//! | `S` | Start/stop scanning |
//! | `U` | Toggle liters/gallons |
//! | `?` | Show help |
//! | `Q/Esc` | Quit |

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fluxmon_ble::{
    format_reading, liters_to_gallons, lpm_to_lph, Advertisement, BleTransport, Meter, Result,
    Session, SessionEvent, TelemetrySnapshot,
};
use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
};
use std::io::{self, stdout, Stdout};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Volume unit preference
#[derive(Clone, Copy, PartialEq, Eq)]
enum VolumeUnit {
    Liters,
    Gallons,
}

impl VolumeUnit {
    fn format(&self, liters: f32) -> String {
        match self {
            VolumeUnit::Liters => format!("{} L", format_reading(liters)),
            VolumeUnit::Gallons => format!("{} gal", format_reading(liters_to_gallons(liters.into()) as f32)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            VolumeUnit::Liters => "L",
            VolumeUnit::Gallons => "gal",
        }
    }
}

/// Log severity level
#[derive(Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn style(&self) -> Style {
        match self {
            LogLevel::Debug => Style::default().fg(Color::DarkGray),
            LogLevel::Info => Style::default().fg(Color::Cyan),
            LogLevel::Warn => Style::default().fg(Color::Yellow),
            LogLevel::Error => Style::default().fg(Color::Red),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Event log entry
struct LogEntry {
    timestamp: Instant,
    level: LogLevel,
    message: String,
}

/// Main application state
struct App {
    session: Session<BleTransport>,
    events: broadcast::Receiver<SessionEvent>,
    snapshots: broadcast::Receiver<TelemetrySnapshot>,
    results: Vec<Advertisement>,
    selected_index: usize,
    snapshot: Option<TelemetrySnapshot>,
    volume_unit: VolumeUnit,
    event_log: Vec<LogEntry>,
    max_log_entries: usize,
    show_help: bool,
    start_time: Instant,
}

impl App {
    async fn new() -> Result<Self> {
        let transport = BleTransport::new().await?;
        let session = Session::new(transport);
        let events = session.subscribe_events();
        let snapshots = session.subscribe_snapshots();

        Ok(Self {
            session,
            events,
            snapshots,
            results: Vec::new(),
            selected_index: 0,
            snapshot: None,
            volume_unit: VolumeUnit::Liters,
            event_log: Vec::new(),
            max_log_entries: 100,
            show_help: false,
            start_time: Instant::now(),
        })
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.event_log.push(LogEntry {
            timestamp: Instant::now(),
            level,
            message: message.into(),
        });

        // Trim old entries
        if self.event_log.len() > self.max_log_entries {
            self.event_log.remove(0);
        }
    }

    fn selected_result(&self) -> Option<&Advertisement> {
        self.results.get(self.selected_index)
    }

    fn select_prev(&mut self) {
        if self.selected_index > 0 {
            self.selected_index -= 1;
        }
    }

    fn select_next(&mut self) {
        if self.selected_index + 1 < self.results.len() {
            self.selected_index += 1;
        }
    }

    /// Pull everything the session has published since the last frame.
    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply_event(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.log(
                        LogLevel::Warn,
                        format!("Event stream lagged by {} messages", missed),
                    );
                }
                Err(_) => break,
            }
        }
        loop {
            match self.snapshots.try_recv() {
                Ok(snapshot) => self.snapshot = Some(snapshot),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    fn apply_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                self.log(LogLevel::Info, format!("Session state: {}", state));
            }
            SessionEvent::ScanResults(results) => {
                self.results = results;
                if self.selected_index >= self.results.len() {
                    self.selected_index = self.results.len().saturating_sub(1);
                }
            }
            SessionEvent::Status(message) => self.log(LogLevel::Info, message),
            SessionEvent::Alert(error) => self.log(LogLevel::Error, error.to_string()),
        }
    }

    async fn toggle_scanning(&mut self) {
        if self.session.state().is_scanning() {
            self.session.stop_scan().await;
        } else if let Err(error) = self.session.start_scan().await {
            self.log(LogLevel::Error, format!("Scan failed: {}", error));
        }
    }

    async fn toggle_connection(&mut self) {
        if self.session.is_connected() {
            self.session.disconnect().await;
            return;
        }
        let target = match self.selected_result() {
            Some(advertisement) => advertisement.identity.clone(),
            None => {
                self.log(LogLevel::Warn, "No meter selected");
                return;
            }
        };
        self.log(LogLevel::Info, format!("Connecting to {}", target.name));
        if let Err(error) = self.session.connect(&target).await {
            self.log(LogLevel::Error, format!("Connect failed: {}", error));
        }
    }

    async fn reset_totalizer(&mut self, meter: Meter) {
        if let Err(error) = self.session.reset_volume(meter).await {
            self.log(LogLevel::Error, format!("Reset failed: {}", error));
        }
    }

    fn toggle_unit(&mut self) {
        self.volume_unit = match self.volume_unit {
            VolumeUnit::Liters => VolumeUnit::Gallons,
            VolumeUnit::Gallons => VolumeUnit::Liters,
        };
    }

    async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}

/// Main terminal type alias
type Terminal = ratatui::Terminal<CrosstermBackend<Stdout>>;

fn setup_terminal() -> io::Result<Terminal> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()
}

fn render_ui(frame: &mut Frame, app: &App) {
    let size = frame.area();

    // Main layout: header, content, event log, status bar
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(16),   // Content
            Constraint::Length(9), // Event log
            Constraint::Length(1), // Status bar
        ])
        .split(size);

    render_header(frame, main_chunks[0], app);
    render_content(frame, main_chunks[1], app);
    render_event_log(frame, main_chunks[2], app);
    render_status_bar(frame, main_chunks[3], app);

    // Render help overlay
    if app.show_help {
        render_help_overlay(frame, size);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let elapsed = app.start_time.elapsed();
    let title = format!(
        " FLUXMON METER DASHBOARD | State: {} | Uptime: {:02}:{:02}:{:02} ",
        app.session.state(),
        elapsed.as_secs() / 3600,
        (elapsed.as_secs() % 3600) / 60,
        elapsed.as_secs() % 60
    );

    let header = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(Title::from(title).alignment(Alignment::Center))
        .title(
            Title::from(" [?] Help  [Q] Quit ")
                .alignment(Alignment::Right)
                .position(block::Position::Top),
        );

    frame.render_widget(header, area);
}

fn render_content(frame: &mut Frame, area: Rect, app: &App) {
    // Split into left (meter list + readings) and right (details + actions)
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(8), Constraint::Min(10)])
        .split(content_chunks[0]);

    render_meter_list(frame, left_chunks[0], app);
    render_readings(frame, left_chunks[1], app);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(6)])
        .split(content_chunks[1]);

    render_meter_details(frame, right_chunks[0], app);
    render_actions(frame, right_chunks[1]);
}

fn render_meter_list(frame: &mut Frame, area: Rect, app: &App) {
    let connected_id = app.session.peripheral().map(|identity| identity.id);

    let items: Vec<ListItem> = app
        .results
        .iter()
        .enumerate()
        .map(|(i, advertisement)| {
            let connected = connected_id.as_deref() == Some(advertisement.identity.id.as_str());
            let icon = if connected { "●" } else { "○" };
            let status = if connected { "Connected" } else { "Advertising" };
            let rssi = match advertisement.rssi {
                Some(rssi) => format!("{} dBm", rssi),
                None => "-- dBm".to_string(),
            };

            let style = if i == app.selected_index {
                Style::default().bg(Color::DarkGray).fg(Color::White)
            } else if connected {
                Style::default().fg(Color::Green)
            } else {
                Style::default()
            };

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", icon), style),
                Span::styled(
                    format!("{} [{}] ", advertisement.identity.name, rssi),
                    style,
                ),
                Span::styled(status, style),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Discovered Meters ")
                .title(
                    Title::from(if app.session.state().is_scanning() {
                        " [Scanning] "
                    } else {
                        " [Stopped] "
                    })
                    .alignment(Alignment::Right),
                ),
        )
        .highlight_style(Style::default().add_modifier(Modifier::BOLD));

    frame.render_widget(list, area);
}

fn render_readings(frame: &mut Frame, area: Rect, app: &App) {
    let mut rows = vec![];

    if let Some(snapshot) = &app.snapshot {
        rows.push(Row::new(vec![
            Cell::from("─── Bank A ───").style(Style::default().fg(Color::Yellow)),
            Cell::from(""),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Volume:"),
            Cell::from(app.volume_unit.format(snapshot.liters_a)),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Flow:"),
            Cell::from(format!(
                "{} L/min ({} L/h)",
                format_reading(snapshot.flow_a),
                format_reading(lpm_to_lph(snapshot.flow_a.into()) as f32)
            )),
        ]));

        rows.push(Row::new(vec![
            Cell::from("─── Bank B ───").style(Style::default().fg(Color::Yellow)),
            Cell::from(""),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Volume:"),
            Cell::from(app.volume_unit.format(snapshot.liters_b)),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Flow:"),
            Cell::from(format!(
                "{} L/min ({} L/h)",
                format_reading(snapshot.flow_b),
                format_reading(lpm_to_lph(snapshot.flow_b.into()) as f32)
            )),
        ]));

        rows.push(Row::new(vec![
            Cell::from("─── Supply ───").style(Style::default().fg(Color::Yellow)),
            Cell::from(""),
        ]));
        let vcc_style = if snapshot.supply_voltage < 3.0 {
            Style::default().fg(Color::Red)
        } else {
            Style::default()
        };
        rows.push(Row::new(vec![
            Cell::from("Voltage:"),
            Cell::from(format!("{} V", format_reading(snapshot.supply_voltage))).style(vcc_style),
        ]));
    } else {
        rows.push(Row::new(vec![Cell::from("No data yet"), Cell::from("")]));
    }

    let table = Table::new(rows, [Constraint::Length(16), Constraint::Min(24)]).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Live Readings "),
    );

    frame.render_widget(table, area);
}

fn render_meter_details(frame: &mut Frame, area: Rect, app: &App) {
    fn or_dash(value: &str) -> &str {
        if value.is_empty() {
            "--"
        } else {
            value
        }
    }

    let info = app.session.static_info();
    let (generation, updated) = match &app.snapshot {
        Some(snapshot) => (
            snapshot.generation.to_string(),
            snapshot.captured_at.format("%H:%M:%S").to_string(),
        ),
        None => ("--".to_string(), "--".to_string()),
    };

    let lines = vec![
        Line::from(format!("Serial:     {}", or_dash(&info.serial_number))),
        Line::from(format!("Lot:        {}", or_dash(&info.lot_code))),
        Line::from(format!("Expiry:     {}", or_dash(&info.expiry))),
        Line::from(format!("State:      {}", app.session.state())),
        Line::from(format!("Generation: {}", generation)),
        Line::from(format!("Updated:    {}", updated)),
    ];

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Meter Details "),
    );

    frame.render_widget(paragraph, area);
}

fn render_actions(frame: &mut Frame, area: Rect) {
    let lines = vec![
        Line::from("[Enter] Connect / disconnect"),
        Line::from("[S]     Start / stop scanning"),
        Line::from("[A]     Reset bank A totalizer"),
        Line::from("[B]     Reset bank B totalizer"),
        Line::from("[U]     Toggle liters/gallons"),
        Line::from("[Q]     Quit"),
    ];

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Actions "));

    frame.render_widget(paragraph, area);
}

fn render_event_log(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| {
            let elapsed = entry.timestamp.elapsed();
            let mins = elapsed.as_secs() / 60;
            let secs = elapsed.as_secs() % 60;

            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:02}:{:02} ", mins, secs),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("[{}] ", entry.level.label()), entry.level.style()),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(" Event Log "));

    frame.render_widget(list, area);
}

fn render_status_bar(frame: &mut Frame, area: Rect, app: &App) {
    let status = format!(
        " Meters: {} | State: {} | Unit: {} | Press ? for help ",
        app.results.len(),
        app.session.state(),
        app.volume_unit.label()
    );

    let paragraph =
        Paragraph::new(status).style(Style::default().bg(Color::DarkGray).fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_help_overlay(frame: &mut Frame, area: Rect) {
    let help_area = centered_rect(60, 70, area);

    frame.render_widget(Clear, help_area);

    let content = vec![
        Line::from(""),
        Line::from(Span::styled(
            "Fluxmon Meter Dashboard",
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("Navigation:"),
        Line::from("  ↑/↓        Navigate meter list"),
        Line::from("  Enter      Connect/disconnect selected meter"),
        Line::from(""),
        Line::from(Span::styled("Totalizers:", Style::default().fg(Color::Cyan))),
        Line::from("  A          Reset bank A totalizer to zero"),
        Line::from("  B          Reset bank B totalizer to zero"),
        Line::from("  U          Toggle liters/gallons"),
        Line::from(""),
        Line::from("Scanning:"),
        Line::from("  S          Start/stop BLE scanning"),
        Line::from(""),
        Line::from("Application:"),
        Line::from("  ?          Toggle this help screen"),
        Line::from("  Q/Esc      Quit application"),
        Line::from(""),
        Line::from(Span::styled(
            "Press any key to close",
            Style::default().fg(Color::DarkGray),
        )),
    ];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Help ")
        .style(Style::default().bg(Color::Black));

    let paragraph = Paragraph::new(content).block(block);

    frame.render_widget(paragraph, help_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

async fn run_app(terminal: &mut Terminal, mut app: App) -> io::Result<()> {
    // Start scanning right away
    if let Err(error) = app.session.start_scan().await {
        app.log(LogLevel::Error, format!("Scan failed: {}", error));
    }

    loop {
        // Fold published events into the app state
        app.drain_events();

        // Draw UI
        terminal.draw(|frame| render_ui(frame, &app))?;

        // Handle input with timeout for updates
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    // Handle help overlay
                    if app.show_help {
                        app.show_help = false;
                        continue;
                    }

                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            break;
                        }
                        KeyCode::Char('?') => {
                            app.show_help = true;
                        }
                        KeyCode::Up => {
                            app.select_prev();
                        }
                        KeyCode::Down => {
                            app.select_next();
                        }
                        KeyCode::Enter => {
                            app.toggle_connection().await;
                        }
                        KeyCode::Char('s') | KeyCode::Char('S') => {
                            app.toggle_scanning().await;
                        }
                        KeyCode::Char('u') | KeyCode::Char('U') => {
                            app.toggle_unit();
                        }
                        KeyCode::Char('a') | KeyCode::Char('A') => {
                            app.reset_totalizer(Meter::A).await;
                        }
                        KeyCode::Char('b') | KeyCode::Char('B') => {
                            app.reset_totalizer(Meter::B).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    app.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // No fmt subscriber here; stdout belongs to the TUI.
    let app = App::new().await?;

    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, app).await;
    let _ = restore_terminal(&mut terminal);

    result?;
    Ok(())
}
