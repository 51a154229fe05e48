use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::control::api;
use crate::{ClientStatus, EndpointStatus};

const TICK_RATE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct AppState {
    status: Option<EndpointStatus>,
    selected: usize,
    message: Option<String>,
    last_update: Option<Instant>,
}

/// Run the ratatui-based endpoint console.
pub fn run() -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    std::thread::spawn(move || {
        loop {
            let status = api::get_status();
            if status_tx.send(status).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();

    loop {
        terminal.draw(|frame| draw(frame, &app))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            app.status = status;
            app.last_update = Some(Instant::now());
            let client_len = app.status.as_ref().map(|s| s.clients.len()).unwrap_or(0);
            if client_len > 0 {
                app.selected = app.selected.min(client_len - 1);
            } else {
                app.selected = 0;
            }
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, key) {
                    break;
                }
            }
        }
    }

    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(app: &mut AppState, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Up => {
            if app.selected > 0 {
                app.selected -= 1;
            }
        }
        KeyCode::Down => {
            if let Some(status) = &app.status {
                if app.selected + 1 < status.clients.len() {
                    app.selected += 1;
                }
            }
        }
        KeyCode::Char('r') => {
            if let Some(client) = current_client(app) {
                let new_state = !client.running;
                if api::set_running(client.id, new_state) {
                    app.message = Some(format!(
                        "Client {} {}",
                        client.id,
                        if new_state { "running" } else { "paused" }
                    ));
                }
            }
        }
        KeyCode::Char('e') => {
            if let Some(status) = &app.status {
                let new_state = !status.mixing_enabled;
                if api::set_mixing_enabled(new_state) {
                    app.message = Some(format!(
                        "Mixing {}",
                        if new_state { "enabled" } else { "disabled" }
                    ));
                }
            }
        }
        _ => {}
    }
    false
}

fn current_client(app: &AppState) -> Option<ClientStatus> {
    app.status.as_ref()?.clients.get(app.selected).cloned()
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_clients(frame, chunks[1], app);
    draw_footer(frame, chunks[2], app);
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("Shared Playout Console")
        .borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        let stats = format!(
            "Rate: {} Hz    Burst: {} frames    Buffer: {} frames    Written: {}    Mixing: {}    Device: {}    Tuning: {}",
            status.sample_rate,
            status.frames_per_burst,
            status.buffer_size_frames,
            status.frames_written,
            if status.mixing_enabled { "on" } else { "off" },
            if status.device_active { "active" } else { "inactive" },
            if status.latency_tuning_enabled { "auto" } else { "fixed" },
        );
        Paragraph::new(stats)
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "No active endpoint",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn draw_clients(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Clients").borders(Borders::ALL);

    if let Some(status) = &app.status {
        let header = Row::new(vec![
            Cell::from(""),
            Cell::from("Id"),
            Cell::from("State"),
            Cell::from("XRuns"),
            Cell::from("Offset (frames)"),
            Cell::from("Transferred"),
            Cell::from("Buffer %"),
        ])
        .style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        );

        let rows = status.clients.iter().enumerate().map(|(idx, client)| {
            let indicator = if idx == app.selected { ">" } else { "" };
            let state = if client.disconnected {
                "disconnected"
            } else if client.running {
                "running"
            } else {
                "paused"
            };
            let mut row = Row::new(vec![
                Cell::from(indicator.to_string()),
                Cell::from(format!("{}", client.id)),
                Cell::from(state.to_string()),
                Cell::from(format!("{}", client.xrun_count)),
                Cell::from(format!("{}", client.timestamp_offset)),
                Cell::from(format!("{}", client.frames_transferred)),
                Cell::from(format!("{:.1}", client.buffer_fill * 100.0)),
            ]);
            if idx == app.selected {
                row = row.style(Style::default().fg(Color::Yellow));
            }
            row
        });

        let table = Table::new(
            rows,
            [
                Constraint::Length(2),
                Constraint::Length(6),
                Constraint::Length(14),
                Constraint::Length(8),
                Constraint::Length(16),
                Constraint::Length(14),
                Constraint::Length(10),
            ],
        )
        .header(header)
        .block(block)
        .column_spacing(2);

        frame.render_widget(table, area);
    } else {
        frame.render_widget(Paragraph::new("").block(block), area);
    }
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  r: Toggle running  •  e: Toggle mixing  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
