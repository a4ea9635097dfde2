use crate::api::{ApiError, HttpBackend};
use crate::model::{Author, IngestionForm, Institution, Message, Screen, WorkflowConfig, WorkflowEvent};
use crate::orchestrator::{run_controller, WorkflowCommand, SEARCH_MIN_CHARS};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Spawn a blocking reader forwarding stdin lines to the async loop.
fn spawn_input_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.trim_end().to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "handbook-chat",
    version,
    about = "Chat with student handbooks: find an institution or contribute its handbook"
)]
pub struct Cli {
    /// Base URL of the handbook service
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub base_url: String,

    /// Run the plain-text prompt loop instead of the TUI
    #[arg(long)]
    pub text: bool,

    /// Quiet period after the last keystroke before a search is issued
    #[arg(long, default_value = "300ms")]
    pub search_debounce: humantime::Duration,

    /// Interval between processing-status polls
    #[arg(long, default_value = "2s")]
    pub poll_interval: humantime::Duration,

    /// Longer interval used after a failed status poll
    #[arg(long, default_value = "5s")]
    pub poll_backoff: humantime::Duration,

    /// How long the 100% state stays on screen before the conversation opens
    #[arg(long, default_value = "1s")]
    pub completion_settle: humantime::Duration,

    /// Override the generated conversation session id
    #[arg(long)]
    pub session_id: Option<String>,
}

pub async fn run(args: Cli) -> Result<()> {
    if !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    run_text(args).await
}

/// Generate a random session id correlating this run's chat requests.
fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("cli-{}", u64::from_le_bytes(b))
}

/// Build a `WorkflowConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> WorkflowConfig {
    WorkflowConfig {
        base_url: args.base_url.clone(),
        session_id: args.session_id.clone().unwrap_or_else(gen_session_id),
        search_debounce: Duration::from(args.search_debounce),
        poll_interval: Duration::from(args.poll_interval),
        poll_backoff: Duration::from(args.poll_backoff),
        completion_settle: Duration::from(args.completion_settle),
        user_agent: format!("handbook-chat/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// A one-line upload spec: `path | institution | title | year [| abbreviation]`.
/// An empty title falls back to the file stem.
fn parse_upload_line(rest: &str) -> Result<IngestionForm, ApiError> {
    let parts: Vec<&str> = rest.split('|').map(str::trim).collect();
    if parts.len() < 4 || parts.len() > 5 {
        return Err(ApiError::validation(
            "Usage: /upload <file.pdf> | <institution name> | <title> | <academic year> [| abbreviation]",
        ));
    }
    let file_path = PathBuf::from(parts[0]);
    let handbook_title = if parts[2].is_empty() {
        title_from_file(&file_path)
    } else {
        parts[2].to_string()
    };
    Ok(IngestionForm {
        institution_name: parts[1].to_string(),
        abbreviation: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
        handbook_title,
        academic_year: parts[3].to_string(),
        file_path,
    })
}

/// Default handbook title derived from the file name, as a convenience.
pub(crate) fn title_from_file(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default()
}

/// Mirror of the workflow kept by the text front-end: just enough to route
/// input lines and render events.
struct TextUi {
    screen: Screen,
    results: Vec<Institution>,
    selected: Option<Institution>,
    messages: Vec<Message>,
    out: mpsc::UnboundedSender<OutputLine>,
    cmd_tx: mpsc::UnboundedSender<WorkflowCommand>,
}

impl TextUi {
    fn stdout(&self, s: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stdout(s.into()));
    }

    fn stderr(&self, s: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(s.into()));
    }

    fn send(&self, cmd: WorkflowCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Returns false when the loop should stop.
    fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        match line.split_once(char::is_whitespace).unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => return false,
            ("/select", n) => match n.trim().parse::<usize>() {
                Ok(n) if n >= 1 && n <= self.results.len() => {
                    self.send(WorkflowCommand::SelectInstitution(
                        self.results[n - 1].clone(),
                    ));
                }
                _ => self.stderr(format!(
                    "Pick a number between 1 and {}.",
                    self.results.len()
                )),
            },
            ("/add", _) => self.send(WorkflowCommand::ContributeHandbook),
            ("/upload", rest) => match parse_upload_line(rest) {
                Ok(form) => self.send(WorkflowCommand::SubmitIngestion(form)),
                Err(usage) => self.stderr(usage.user_message()),
            },
            ("/back", _) => match self.screen {
                Screen::Ingesting => self.send(WorkflowCommand::CancelIngestion),
                Screen::Conversing => self.send(WorkflowCommand::ChangeInstitution),
                _ => {}
            },
            ("/save", rest) => self.save_transcript(rest.trim()),
            (cmd, _) if cmd.starts_with('/') => {
                self.stderr(format!("Unknown command {cmd}. Commands: /select N, /add, /upload, /back, /save [path], /quit"));
            }
            _ => match self.screen {
                Screen::Discovering => {
                    self.send(WorkflowCommand::QueryChanged(line.to_string()));
                    if line.trim().chars().count() <= SEARCH_MIN_CHARS {
                        self.stderr(format!(
                            "Type more than {SEARCH_MIN_CHARS} characters to search."
                        ));
                    }
                }
                Screen::Conversing => self.send(WorkflowCommand::SendMessage(line.to_string())),
                _ => {}
            },
        }
        true
    }

    /// `/save` writes to the default transcripts directory; `/save <path>`
    /// exports to the given file instead.
    fn save_transcript(&self, target: &str) {
        let Some(institution) = self.selected.as_ref() else {
            self.stderr("Nothing to save yet.");
            return;
        };
        let saved = if target.is_empty() {
            crate::storage::save_transcript(institution, &self.messages)
        } else {
            crate::storage::save_transcript_to(
                std::path::Path::new(target),
                institution,
                &self.messages,
            )
        };
        match saved {
            Ok(path) => self.stderr(format!("Saved: {}", path.display())),
            Err(e) => self.stderr(format!("Could not save transcript: {e:#}")),
        }
    }

    fn handle_event(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::ScreenChanged(screen) => {
                self.screen = screen;
                match screen {
                    Screen::Landing => {}
                    Screen::Discovering => {
                        self.stdout("Type an institution name to search. /quit to exit.");
                    }
                    Screen::Ingesting => {
                        self.stdout(
                            "Contribute a handbook:\n  /upload <file.pdf> | <institution name> | <title> | <academic year> [| abbreviation]\n  /back to return to search",
                        );
                    }
                    Screen::Conversing => {}
                }
            }
            WorkflowEvent::SearchStarted { query } => {
                self.stderr(format!("Searching for \"{query}\"..."));
            }
            WorkflowEvent::SearchResults {
                query,
                institutions,
                failed,
            } => {
                self.results = institutions;
                if failed {
                    self.stderr("Search failed; treating as no results.");
                }
                if self.results.is_empty() {
                    self.stdout(format!(
                        "No institutions matched \"{query}\". Type /add to contribute a handbook."
                    ));
                } else {
                    for (i, inst) in self.results.iter().enumerate() {
                        let abbrev = inst
                            .abbreviation
                            .as_deref()
                            .map(|a| format!(" ({a})"))
                            .unwrap_or_default();
                        self.stdout(format!("  {}. {}{abbrev}", i + 1, inst.display_name));
                    }
                    self.stdout("Type /select N to choose one, or keep typing to refine.");
                }
            }
            WorkflowEvent::SearchReset => {
                self.results.clear();
            }
            WorkflowEvent::InstitutionSelected(institution) => {
                self.messages.clear();
                self.stderr(format!("-- {} --", institution.display_name));
                self.selected = Some(institution);
            }
            WorkflowEvent::MessageAppended(msg) => {
                self.render_message(&msg);
                self.messages.push(msg);
            }
            WorkflowEvent::PendingChanged(pending) => {
                if pending {
                    self.stderr("...");
                }
            }
            WorkflowEvent::JobSubmitted { job_id } => {
                self.stderr(format!("Processing started (job {job_id})."));
            }
            WorkflowEvent::JobProgress { percent, message } => {
                self.stderr(format!("[{percent:>3}%] {message}"));
            }
            WorkflowEvent::JobFailed { message } => {
                self.stderr(format!("Upload failed: {message}"));
            }
            WorkflowEvent::ValidationFailed(message) => {
                self.stderr(message);
            }
            WorkflowEvent::Info(message) => {
                self.stderr(message);
            }
        }
    }

    fn render_message(&self, msg: &Message) {
        let who = match msg.author {
            Author::User => "You",
            Author::Assistant => "Assistant",
        };
        self.stdout(format!("{who}: {}", msg.text));
        for ev in &msg.evidence {
            self.stdout(format!(
                "    source: {} ({}) similarity {:.2}",
                ev.title, ev.category, ev.similarity
            ));
        }
    }
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let backend = Arc::new(HttpBackend::new(&cfg).context("building HTTP client")?);

    let (out_tx, out_handle) = spawn_output_writer();
    let mut line_rx = spawn_input_reader();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WorkflowCommand>();

    let controller = tokio::spawn(run_controller(backend, cfg, event_tx, cmd_rx));

    let mut ui = TextUi {
        screen: Screen::Landing,
        results: Vec::new(),
        selected: None,
        messages: Vec::new(),
        out: out_tx.clone(),
        cmd_tx: cmd_tx.clone(),
    };
    ui.stdout("handbook-chat - find your institution's student handbook and ask it questions.");
    ui.send(WorkflowCommand::Begin);

    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) if ui.handle_line(&line) => {}
                _ => break,
            },
            event = event_rx.recv() => match event {
                Some(event) => ui.handle_event(event),
                None => break,
            },
        }
    }

    let _ = cmd_tx.send(WorkflowCommand::Quit);
    controller.await.context("controller task failed")??;

    drop(out_tx);
    drop(ui);
    let _ = out_handle.await;
    Ok(())
}
