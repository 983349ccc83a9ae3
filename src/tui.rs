#![cfg(feature = "tui")]

use crate::relay::{PanelMessage, RelayState, Session, SessionError, CHAT_RESPONSE};
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages from relay tasks, tagged with the prompt they belong to.
#[derive(Debug, Clone)]
enum StreamMsg {
    Update(u64, PanelMessage),
    Done(u64, RelayState),
}

#[derive(Debug, Default)]
struct Panel {
    input: String,
    response: String,
    status: Option<String>,
    generation: u64,
    loading: bool,
}

pub async fn run_tui(session: Arc<Session>) -> anyhow::Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<StreamMsg>();
    let mut panel = Panel::default();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = draw(&mut terminal, session.model(), &panel) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                if let Event::Key(key) = ev {
                    if handle_key(key, &mut panel, &session, &msg_tx) {
                        break Ok(());
                    }
                }
            }
            Some(msg) = msg_rx.recv() => apply(&mut panel, msg),
        }
    };

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res
}

fn apply(panel: &mut Panel, msg: StreamMsg) {
    match msg {
        StreamMsg::Update(generation, m) if generation == panel.generation => {
            if m.command == CHAT_RESPONSE {
                panel.response = m.text;
            }
        }
        StreamMsg::Done(generation, state) if generation == panel.generation => {
            panel.loading = false;
            if state == RelayState::Cancelled {
                panel.status = Some("(cancelled)".to_string());
            }
        }
        // Output from a superseded prompt.
        _ => {}
    }
}

/// Returns true when the panel should close.
fn handle_key(
    key: KeyEvent,
    panel: &mut Panel,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<StreamMsg>,
) -> bool {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char('c') => return true,
            KeyCode::Char('k') => {
                session.cancel();
                return false;
            }
            _ => {}
        }
    }

    match key.code {
        KeyCode::Esc => return true,
        KeyCode::Char(c) => panel.input.push(c),
        KeyCode::Backspace => {
            panel.input.pop();
        }
        KeyCode::Enter => submit(panel, session, tx),
        _ => {}
    }

    false
}

fn submit(panel: &mut Panel, session: &Arc<Session>, tx: &mpsc::UnboundedSender<StreamMsg>) {
    let prompt = panel.input.trim().to_string();
    if prompt.is_empty() {
        return;
    }

    let generation = panel.generation + 1;
    let update_tx = tx.clone();
    let sink = move |m: PanelMessage| {
        let _ = update_tx.send(StreamMsg::Update(generation, m));
    };

    match session.start(&prompt, sink) {
        Ok(relay) => {
            panel.generation = generation;
            panel.input.clear();
            panel.response.clear();
            panel.status = None;
            panel.loading = true;

            let done_tx = tx.clone();
            tokio::spawn(async move {
                let outcome = relay.await;
                let _ = done_tx.send(StreamMsg::Done(generation, outcome.state()));
            });
        }
        Err(SessionError::Busy) => {
            panel.status = Some("(streaming in progress; wait for completion or press Ctrl+K)".to_string());
        }
        Err(SessionError::EmptyPrompt) => {}
    }
}

fn draw(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    model: &str,
    panel: &Panel,
) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Length(1), Constraint::Min(1)])
            .split(f.area());

        let input_w = Paragraph::new(panel.input.as_str()).block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("DeepCode Chat — model: {model}")),
        );

        let status = if panel.loading {
            "Generating response...".to_string()
        } else if let Some(s) = &panel.status {
            s.clone()
        } else {
            "Enter: ask  Ctrl+K: cancel  Esc: quit".to_string()
        };
        let status_w = Paragraph::new(status).style(Style::default().add_modifier(Modifier::DIM));

        let response_w = Paragraph::new(panel.response.as_str())
            .block(Block::default().borders(Borders::ALL).title("response"))
            .wrap(Wrap { trim: false });

        f.render_widget(input_w, chunks[0]);
        f.render_widget(status_w, chunks[1]);
        f.render_widget(response_w, chunks[2]);

        let x = chunks[0].x + 1 + panel.input.chars().count() as u16;
        let y = chunks[0].y + 1;
        f.set_cursor_position((x.min(chunks[0].x + chunks[0].width.saturating_sub(2)), y));
    })?;
    Ok(())
}
