mod help;
mod state;

use crate::api::HttpBackend;
use crate::cli::Cli;
use crate::model::{Author, Screen, WorkflowEvent};
use crate::orchestrator::{run_controller, WorkflowCommand, SEARCH_MIN_CHARS};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Terminal,
};
use state::{apply_event, UiState, FIELD_LABELS, FORM_FIELDS};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let cfg = crate::cli::build_config(&args);
    let backend = Arc::new(HttpBackend::new(&cfg).context("building HTTP client")?);

    // Unbounded channels avoid backpressure between the UI thread and the
    // controller.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WorkflowCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the
    // Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(event_rx, cmd_tx));

    let res = run_controller(backend, cfg, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut event_rx: UnboundedReceiver<WorkflowEvent>,
    cmd_tx: UnboundedSender<WorkflowCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut ui = Ui {
        state: UiState::default(),
        cmd_tx,
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut ui.state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &ui.state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if !ui.handle_key(k.modifiers, k.code) {
                    break Ok(());
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

struct Ui {
    state: UiState,
    cmd_tx: UnboundedSender<WorkflowCommand>,
}

impl Ui {
    fn send(&self, cmd: WorkflowCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Returns false when the loop should exit.
    fn handle_key(&mut self, modifiers: KeyModifiers, code: KeyCode) -> bool {
        if modifiers == KeyModifiers::CONTROL && code == KeyCode::Char('c') {
            self.send(WorkflowCommand::Quit);
            return false;
        }
        if code == KeyCode::F(1) {
            self.state.show_help = !self.state.show_help;
            return true;
        }
        if self.state.show_help {
            if matches!(code, KeyCode::Esc | KeyCode::Char('q')) {
                self.state.show_help = false;
            }
            return true;
        }

        match self.state.screen {
            Screen::Landing => self.key_landing(code),
            Screen::Discovering => self.key_discovering(code),
            Screen::Ingesting => self.key_ingesting(modifiers, code),
            Screen::Conversing => self.key_conversing(modifiers, code),
        }
    }

    fn key_landing(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.send(WorkflowCommand::Quit);
                return false;
            }
            KeyCode::Enter => self.send(WorkflowCommand::Begin),
            _ => {}
        }
        true
    }

    fn key_discovering(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::Esc => self.send(WorkflowCommand::Reset),
            KeyCode::Char(c) => {
                self.state.query_input.push(c);
                self.send(WorkflowCommand::QueryChanged(self.state.query_input.clone()));
            }
            KeyCode::Backspace => {
                self.state.query_input.pop();
                self.send(WorkflowCommand::QueryChanged(self.state.query_input.clone()));
            }
            KeyCode::Up => {
                self.state.result_cursor = self.state.result_cursor.saturating_sub(1);
            }
            KeyCode::Down => {
                if self.state.result_cursor + 1 < self.state.results.len() {
                    self.state.result_cursor += 1;
                }
            }
            KeyCode::Enter => {
                if let Some(institution) = self.state.results.get(self.state.result_cursor) {
                    self.send(WorkflowCommand::SelectInstitution(institution.clone()));
                } else if self.state.offers_contribution() {
                    self.send(WorkflowCommand::ContributeHandbook);
                }
            }
            _ => {}
        }
        true
    }

    fn key_ingesting(&mut self, modifiers: KeyModifiers, code: KeyCode) -> bool {
        if self.state.job_running() {
            // Form is locked while the job is tracked; only backing out works.
            if code == KeyCode::Esc {
                self.send(WorkflowCommand::CancelIngestion);
            }
            return true;
        }
        match code {
            KeyCode::Esc => self.send(WorkflowCommand::CancelIngestion),
            KeyCode::Tab | KeyCode::Down => self.state.form.focus_next(),
            KeyCode::BackTab | KeyCode::Up => self.state.form.focus_prev(),
            KeyCode::Char(c) if !modifiers.contains(KeyModifiers::CONTROL) => {
                self.state.form.type_char(c);
            }
            KeyCode::Backspace => self.state.form.backspace(),
            KeyCode::Enter => {
                self.send(WorkflowCommand::SubmitIngestion(
                    self.state.form.to_ingestion_form(),
                ));
            }
            _ => {}
        }
        true
    }

    fn key_conversing(&mut self, modifiers: KeyModifiers, code: KeyCode) -> bool {
        match (modifiers, code) {
            (KeyModifiers::CONTROL, KeyCode::Char('s')) => self.save_transcript(),
            (_, KeyCode::Esc) => self.send(WorkflowCommand::ChangeInstitution),
            (_, KeyCode::Char(c)) => self.state.chat_input.push(c),
            (_, KeyCode::Backspace) => {
                self.state.chat_input.pop();
            }
            (_, KeyCode::Enter) => {
                let text = self.state.chat_input.trim().to_string();
                if !text.is_empty() && !self.state.pending {
                    self.state.chat_input.clear();
                    self.send(WorkflowCommand::SendMessage(text));
                }
            }
            (_, KeyCode::PageUp) => {
                self.state.scroll_back = self.state.scroll_back.saturating_add(5);
            }
            (_, KeyCode::PageDown) => {
                self.state.scroll_back = self.state.scroll_back.saturating_sub(5);
            }
            _ => {}
        }
        true
    }

    fn save_transcript(&mut self) {
        let Some(institution) = self.state.selected.clone() else {
            return;
        };
        match crate::storage::save_transcript(&institution, &self.state.messages) {
            Ok(path) => self.state.info = format!("Saved: {}", path.display()),
            Err(e) => self.state.info = format!("Save failed: {e:#}"),
        }
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(area);

    let title = match state.screen {
        Screen::Landing => "handbook-chat",
        Screen::Discovering => "handbook-chat - find your institution",
        Screen::Ingesting => "handbook-chat - contribute a handbook",
        Screen::Conversing => "handbook-chat - conversation",
    };
    let header = Paragraph::new(Line::from(Span::styled(
        title,
        Style::default().add_modifier(Modifier::BOLD),
    )))
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(header, chunks[0]);

    match state.screen {
        Screen::Landing => draw_landing(chunks[1], f),
        Screen::Discovering => draw_discovering(chunks[1], f, state),
        Screen::Ingesting => draw_ingesting(chunks[1], f, state),
        Screen::Conversing => draw_conversing(chunks[1], f, state),
    }

    draw_status(chunks[2], f, state);

    if state.show_help {
        help::draw(f, area);
    }
}

fn draw_landing(area: Rect, f: &mut ratatui::Frame) {
    let lines = vec![
        Line::from(""),
        Line::from("Ask your institution's student handbook anything:"),
        Line::from("academic policies, student conduct, housing rules, and more."),
        Line::from(""),
        Line::from(vec![
            Span::raw("Press "),
            Span::styled("Enter", Style::default().fg(Color::Yellow)),
            Span::raw(" to get started, "),
            Span::styled("q", Style::default().fg(Color::Yellow)),
            Span::raw(" to quit."),
        ]),
    ];
    let p = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL))
        .alignment(ratatui::layout::Alignment::Center);
    f.render_widget(p, area);
}

fn draw_discovering(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let input = Paragraph::new(state.query_input.as_str()).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Institution name"),
    );
    f.render_widget(input, rows[0]);

    if !state.results.is_empty() {
        let items: Vec<ListItem> = state
            .results
            .iter()
            .map(|inst| {
                let abbrev = inst
                    .abbreviation
                    .as_deref()
                    .map(|a| format!(" ({a})"))
                    .unwrap_or_default();
                ListItem::new(format!("{}{abbrev}", inst.display_name))
            })
            .collect();
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title("Results"))
            .highlight_style(
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("> ");
        let mut list_state = ListState::default();
        list_state.select(Some(state.result_cursor));
        f.render_stateful_widget(list, rows[1], &mut list_state);
        return;
    }

    let hint = if state.searching {
        Line::from("Searching...")
    } else if state.offers_contribution() {
        let mut spans = vec![];
        if state.search_failed {
            spans.push(Span::styled(
                "Search failed; treating as no results. ",
                Style::default().fg(Color::Red),
            ));
        }
        spans.push(Span::raw("No institutions matched. Press "));
        spans.push(Span::styled("Enter", Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(" to contribute this handbook."));
        Line::from(spans)
    } else if state.query_input.trim().chars().count() <= SEARCH_MIN_CHARS {
        Line::from(format!(
            "Type more than {SEARCH_MIN_CHARS} characters to search."
        ))
    } else {
        Line::from("")
    };
    let p = Paragraph::new(hint).block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(p, rows[1]);
}

fn draw_ingesting(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(FORM_FIELDS as u16 + 2), Constraint::Length(5)].as_ref())
        .split(area);

    let mut lines = Vec::with_capacity(FORM_FIELDS);
    for (i, label) in FIELD_LABELS.iter().enumerate() {
        let focused = i == state.form.focus && !state.job_running();
        let marker = if focused { "> " } else { "  " };
        let style = if focused {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(format!("{marker}{label:<20}"), style),
            Span::raw(state.form.fields[i].clone()),
        ]));
    }
    let form = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("New handbook"),
    );
    f.render_widget(form, rows[0]);

    if let Some(err) = state.job_error.as_deref() {
        let p = Paragraph::new(err)
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Upload failed"));
        f.render_widget(p, rows[1]);
    } else if let Some(percent) = state.job_percent {
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(state.job_message.clone()),
            )
            .gauge_style(Style::default().fg(Color::Green))
            .percent(u16::from(percent));
        f.render_widget(gauge, rows[1]);
    } else {
        let p = Paragraph::new("Enter submits; Esc returns to search.")
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(p, rows[1]);
    }
}

fn draw_conversing(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(area);

    let mut lines: Vec<Line> = Vec::new();
    for msg in &state.messages {
        let (who, style) = match msg.author {
            Author::User => ("You", Style::default().fg(Color::Cyan)),
            Author::Assistant if msg.is_error => ("Assistant", Style::default().fg(Color::Red)),
            Author::Assistant => ("Assistant", Style::default().fg(Color::Green)),
        };
        lines.push(Line::from(Span::styled(
            format!("{who}:"),
            style.add_modifier(Modifier::BOLD),
        )));
        for text_line in msg.text.lines() {
            lines.push(Line::from(text_line.to_string()));
        }
        for ev in &msg.evidence {
            lines.push(Line::from(Span::styled(
                format!("  source: {} ({}) similarity {:.2}", ev.title, ev.category, ev.similarity),
                Style::default().fg(Color::Gray),
            )));
        }
        lines.push(Line::from(""));
    }
    if state.pending {
        lines.push(Line::from(Span::styled(
            "Assistant is thinking...",
            Style::default().fg(Color::Gray),
        )));
    }

    let inner_height = rows[0].height.saturating_sub(2);
    let bottom = (lines.len() as u16).saturating_sub(inner_height);
    let offset = bottom.saturating_sub(state.scroll_back);
    let title = state
        .selected
        .as_ref()
        .map(|i| i.display_name.clone())
        .unwrap_or_default();
    let transcript = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((offset, 0))
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(transcript, rows[0]);

    let input_title = if state.pending {
        "Your question (waiting for the assistant...)"
    } else {
        "Your question"
    };
    let input = Paragraph::new(state.chat_input.as_str())
        .block(Block::default().borders(Borders::ALL).title(input_title));
    f.render_widget(input, rows[1]);
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let keys = match state.screen {
        Screen::Landing => "Enter start | q quit",
        Screen::Discovering => "type to search | Up/Down pick | Enter select | Esc back | F1 help",
        Screen::Ingesting => "Tab next field | Enter submit | Esc back | F1 help",
        Screen::Conversing => "Enter send | Ctrl+S save | Esc change institution | F1 help",
    };
    let mut spans = vec![Span::styled(keys, Style::default().fg(Color::Gray))];
    if !state.info.is_empty() {
        spans.push(Span::raw("   "));
        spans.push(Span::styled(
            state.info.clone(),
            Style::default().fg(Color::Yellow),
        ));
    }
    let p = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}
