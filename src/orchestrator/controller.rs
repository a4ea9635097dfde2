//! Workflow lifecycle controller.
//!
//! Owns the [`Session`] and sequences the user through discovery, ingestion,
//! and conversation. UI layers send [`WorkflowCommand`]s; every asynchronous
//! operation (quiet-period timer, catalog search, two-step submission, chat
//! request, job poller) runs as a spawned task that reports back on an
//! internal channel, tagged with the epoch or job identity it belongs to, so
//! completions for superseded work are discarded in one place.

use crate::api::{ApiError, ApiResult, Backend};
use crate::model::{
    IngestionForm, Institution, Screen, SubmittedJob, WorkflowConfig, WorkflowEvent,
};
use crate::orchestrator::poller::{poll_job, JobUpdate, PollerParams};
use crate::orchestrator::session::{SearchDirective, Session};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers to drive the workflow.
#[derive(Debug, Clone)]
pub(crate) enum WorkflowCommand {
    Begin,
    QueryChanged(String),
    SelectInstitution(Institution),
    ContributeHandbook,
    SubmitIngestion(IngestionForm),
    CancelIngestion,
    SendMessage(String),
    ChangeInstitution,
    Reset,
    Quit,
}

/// Completions reported by spawned tasks.
enum AsyncInput {
    DebounceFired {
        epoch: u64,
    },
    SearchDone {
        epoch: u64,
        outcome: ApiResult<Vec<Institution>>,
    },
    SubmissionDone {
        seq: u64,
        outcome: Result<SubmittedJob, SubmissionError>,
    },
    ChatDone {
        seq: u64,
        outcome: ApiResult<crate::model::AssistantReply>,
    },
}

/// Which step of the two-call submission failed. Registration is not rolled
/// back or retried when the upload fails.
enum SubmissionError {
    ReadFile(String),
    Register(ApiError),
    Upload(ApiError),
}

impl SubmissionError {
    fn user_message(&self) -> String {
        match self {
            Self::ReadFile(msg) => msg.clone(),
            Self::Register(e) => {
                format!("Could not register the institution: {}", e.user_message())
            }
            Self::Upload(e) => format!(
                "Handbook upload failed: {}. The institution record was already \
                 created and will not be re-registered automatically.",
                e.user_message()
            ),
        }
    }
}

struct Controller<B: Backend + 'static> {
    backend: Arc<B>,
    cfg: WorkflowConfig,
    session: Session,
    event_tx: UnboundedSender<WorkflowEvent>,
    async_tx: UnboundedSender<AsyncInput>,
    job_tx: UnboundedSender<(String, JobUpdate)>,
    poller: Option<tokio::task::JoinHandle<()>>,
}

/// Run the workflow controller until the UI disconnects or sends `Quit`.
pub(crate) async fn run_controller<B: Backend + 'static>(
    backend: Arc<B>,
    cfg: WorkflowConfig,
    event_tx: UnboundedSender<WorkflowEvent>,
    mut cmd_rx: UnboundedReceiver<WorkflowCommand>,
) -> Result<()> {
    let (async_tx, mut async_rx) = mpsc::unbounded_channel();
    let (job_tx, mut job_rx) = mpsc::unbounded_channel();
    let mut ctl = Controller {
        backend,
        cfg,
        session: Session::new(),
        event_tx,
        async_tx,
        job_tx,
        poller: None,
    };

    loop {
        tokio::select! {
            // Commands first: queued user input is applied before async
            // completions, so stale work is recognized as stale.
            biased;
            cmd = cmd_rx.recv() => match cmd {
                Some(WorkflowCommand::Quit) | None => break,
                Some(cmd) => ctl.handle_command(cmd),
            },
            Some(input) = async_rx.recv() => ctl.handle_async(input),
            Some((job_id, update)) = job_rx.recv() => ctl.handle_job_update(job_id, update),
        }
    }

    ctl.abort_poller();
    Ok(())
}

impl<B: Backend + 'static> Controller<B> {
    fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_tx.send(event);
    }

    fn handle_command(&mut self, cmd: WorkflowCommand) {
        match cmd {
            WorkflowCommand::Begin => {
                if self.session.begin() {
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Discovering));
                }
            }
            WorkflowCommand::QueryChanged(q) => match self.session.query_changed(&q) {
                SearchDirective::Schedule { epoch } => {
                    let tx = self.async_tx.clone();
                    let quiet = self.cfg.search_debounce;
                    tokio::spawn(async move {
                        tokio::time::sleep(quiet).await;
                        let _ = tx.send(AsyncInput::DebounceFired { epoch });
                    });
                }
                SearchDirective::Clear => self.emit(WorkflowEvent::SearchReset),
                SearchDirective::Ignore => {}
            },
            WorkflowCommand::SelectInstitution(institution) => {
                if let Some(welcome) = self.session.select_institution(institution.clone()) {
                    self.emit(WorkflowEvent::InstitutionSelected(institution));
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Conversing));
                    self.emit(WorkflowEvent::MessageAppended(welcome));
                }
            }
            WorkflowCommand::ContributeHandbook => {
                if self.session.choose_contribute() {
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Ingesting));
                }
            }
            WorkflowCommand::SubmitIngestion(form) => self.submit_ingestion(form),
            WorkflowCommand::CancelIngestion => {
                if self.session.cancel_ingestion() {
                    self.abort_poller();
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Discovering));
                    self.emit(WorkflowEvent::SearchReset);
                }
            }
            WorkflowCommand::SendMessage(text) => self.send_message(text),
            WorkflowCommand::ChangeInstitution => {
                if self.session.change_institution() {
                    self.emit(WorkflowEvent::PendingChanged(false));
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Discovering));
                    self.emit(WorkflowEvent::SearchReset);
                }
            }
            WorkflowCommand::Reset => {
                self.session.reset();
                self.abort_poller();
                self.emit(WorkflowEvent::PendingChanged(false));
                self.emit(WorkflowEvent::SearchReset);
                self.emit(WorkflowEvent::ScreenChanged(Screen::Landing));
            }
            // Handled by the run loop.
            WorkflowCommand::Quit => {}
        }
    }

    fn handle_async(&mut self, input: AsyncInput) {
        match input {
            AsyncInput::DebounceFired { epoch } => {
                let Some(query) = self.session.query_for_epoch(epoch) else {
                    tracing::debug!(epoch, "quiet-period timer superseded");
                    return;
                };
                self.emit(WorkflowEvent::SearchStarted {
                    query: query.clone(),
                });
                let backend = self.backend.clone();
                let tx = self.async_tx.clone();
                tokio::spawn(async move {
                    let outcome = backend.search_institutions(&query).await;
                    let _ = tx.send(AsyncInput::SearchDone { epoch, outcome });
                });
            }
            AsyncInput::SearchDone { epoch, outcome } => {
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "catalog search failed");
                }
                if let Some((institutions, failed)) =
                    self.session.apply_search_outcome(epoch, outcome)
                {
                    self.emit(WorkflowEvent::SearchResults {
                        query: self.session.search.query.clone(),
                        institutions,
                        failed,
                    });
                }
            }
            AsyncInput::SubmissionDone { seq, outcome } => match outcome {
                Ok(job) => {
                    let job_id = job.job_id.clone();
                    if !self.session.job_submitted(seq, job) {
                        tracing::debug!(job = %job_id, "discarding completion of a superseded submission");
                        return;
                    }
                    self.emit(WorkflowEvent::JobSubmitted {
                        job_id: job_id.clone(),
                    });
                    self.emit(WorkflowEvent::JobProgress {
                        percent: 0,
                        message: "Upload accepted. Processing started.".into(),
                    });
                    self.spawn_poller(job_id);
                }
                Err(err) => {
                    if self.session.submission_failed(seq) {
                        self.emit(WorkflowEvent::JobFailed {
                            message: err.user_message(),
                        });
                    } else {
                        tracing::debug!("discarding failure of a superseded submission");
                    }
                }
            },
            AsyncInput::ChatDone { seq, outcome } => {
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "conversation request failed");
                }
                if let Some(reply) = self.session.apply_reply(seq, outcome) {
                    self.emit(WorkflowEvent::MessageAppended(reply));
                    self.emit(WorkflowEvent::PendingChanged(false));
                }
            }
        }
    }

    fn handle_job_update(&mut self, job_id: String, update: JobUpdate) {
        if !self.session.job_is_active(&job_id) {
            tracing::debug!(job = %job_id, "dropping update for inactive job");
            return;
        }
        match update {
            JobUpdate::Progress { percent, message } => {
                self.emit(WorkflowEvent::JobProgress { percent, message });
            }
            JobUpdate::Completed { result } => {
                if let Some(welcome) = self.session.complete_job(&job_id, result) {
                    self.poller = None;
                    tracing::info!(
                        job = %job_id,
                        handbook = self.session.handbook_id.as_deref().unwrap_or(""),
                        "ingestion complete"
                    );
                    if let Some(institution) = self.session.selected.clone() {
                        self.emit(WorkflowEvent::InstitutionSelected(institution));
                    }
                    self.emit(WorkflowEvent::ScreenChanged(Screen::Conversing));
                    self.emit(WorkflowEvent::MessageAppended(welcome));
                }
            }
            JobUpdate::Failed { message } => {
                if self.session.fail_job(&job_id) {
                    self.poller = None;
                    self.emit(WorkflowEvent::JobFailed { message });
                }
            }
        }
    }

    fn submit_ingestion(&mut self, form: IngestionForm) {
        let Some(seq) = self.session.begin_submission() else {
            return;
        };
        if let Err(msg) = form.validate() {
            self.session.submission_failed(seq);
            self.emit(WorkflowEvent::ValidationFailed(msg));
            return;
        }
        self.emit(WorkflowEvent::Info("Preparing upload...".into()));
        let backend = self.backend.clone();
        let tx = self.async_tx.clone();
        tokio::spawn(async move {
            let outcome = submit(backend, form).await;
            let _ = tx.send(AsyncInput::SubmissionDone { seq, outcome });
        });
    }

    fn send_message(&mut self, text: String) {
        let Some(institution) = self.session.selected.clone() else {
            return;
        };
        let Some((seq, user_msg)) = self.session.send_user_message(&text) else {
            return;
        };
        let trimmed = user_msg.text.clone();
        self.emit(WorkflowEvent::MessageAppended(user_msg));
        self.emit(WorkflowEvent::PendingChanged(true));
        let backend = self.backend.clone();
        let tx = self.async_tx.clone();
        let session_id = self.cfg.session_id.clone();
        tokio::spawn(async move {
            let outcome = backend
                .send_message(&trimmed, &institution.id, &session_id)
                .await;
            let _ = tx.send(AsyncInput::ChatDone { seq, outcome });
        });
    }

    fn spawn_poller(&mut self, job_id: String) {
        self.abort_poller();
        self.poller = Some(tokio::spawn(poll_job(PollerParams {
            backend: self.backend.clone(),
            job_id,
            poll_interval: self.cfg.poll_interval,
            poll_backoff: self.cfg.poll_backoff,
            completion_settle: self.cfg.completion_settle,
            update_tx: self.job_tx.clone(),
        })));
    }

    fn abort_poller(&mut self) {
        // Dropping a JoinHandle does not cancel the task; abort explicitly so
        // a superseded job stops scheduling polls.
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
    }
}

/// The two sequential submission calls, preceded by reading the file so an
/// unreadable file cannot leave an orphaned registration behind.
async fn submit<B: Backend + ?Sized>(
    backend: Arc<B>,
    form: IngestionForm,
) -> Result<SubmittedJob, SubmissionError> {
    let bytes = tokio::fs::read(&form.file_path).await.map_err(|e| {
        SubmissionError::ReadFile(format!("Could not read {}: {e}", form.file_path.display()))
    })?;
    let file_name = form
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "handbook.pdf".to_string());

    let abbreviation = form.abbreviation.trim();
    let abbreviation = (!abbreviation.is_empty()).then_some(abbreviation);
    let institution = backend
        .register_institution(form.institution_name.trim(), abbreviation)
        .await
        .map_err(SubmissionError::Register)?;

    let job_id = backend
        .submit_handbook(
            &institution.id,
            &file_name,
            bytes,
            form.handbook_title.trim(),
            form.academic_year.trim(),
        )
        .await
        .map_err(SubmissionError::Upload)?;

    Ok(SubmittedJob {
        job_id,
        institution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssistantReply, Author};
    use crate::orchestrator::session::CHAT_FALLBACK_TEXT;
    use crate::orchestrator::testing::{completed_snapshot, processing_snapshot, MockBackend};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config() -> WorkflowConfig {
        WorkflowConfig {
            base_url: "http://backend.invalid".into(),
            session_id: "test-session".into(),
            search_debounce: Duration::from_millis(300),
            poll_interval: Duration::from_secs(2),
            poll_backoff: Duration::from_secs(5),
            completion_settle: Duration::from_secs(1),
            user_agent: "handbook-chat-test".into(),
        }
    }

    fn ashesi() -> Institution {
        Institution {
            id: "ashesi".into(),
            display_name: "Ashesi University".into(),
            abbreviation: Some("Ashesi".into()),
        }
    }

    fn new_college() -> Institution {
        Institution {
            id: "newcol".into(),
            display_name: "Some New College".into(),
            abbreviation: None,
        }
    }

    fn reply(text: &str) -> AssistantReply {
        AssistantReply {
            text: text.into(),
            evidence: Vec::new(),
            confidence: Some(0.9),
        }
    }

    struct Harness {
        backend: Arc<MockBackend>,
        cmd_tx: mpsc::UnboundedSender<WorkflowCommand>,
        event_rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    }

    impl Harness {
        fn start(backend: Arc<MockBackend>) -> Self {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let b = backend.clone();
            tokio::spawn(run_controller(b, test_config(), event_tx, cmd_rx));
            Self {
                backend,
                cmd_tx,
                event_rx,
            }
        }

        fn send(&self, cmd: WorkflowCommand) {
            self.cmd_tx.send(cmd).unwrap();
        }

        async fn next_event(&mut self) -> WorkflowEvent {
            tokio::time::timeout(Duration::from_secs(120), self.event_rx.recv())
                .await
                .expect("timed out waiting for a workflow event")
                .expect("controller stopped")
        }

        /// Collect events until one matches; returns everything seen,
        /// including the match.
        async fn wait_for(
            &mut self,
            pred: impl Fn(&WorkflowEvent) -> bool,
        ) -> Vec<WorkflowEvent> {
            let mut seen = Vec::new();
            loop {
                let ev = self.next_event().await;
                let done = pred(&ev);
                seen.push(ev);
                if done {
                    return seen;
                }
            }
        }

        /// Drive the workflow to the conversation screen for Ashesi.
        async fn enter_conversation(&mut self) {
            self.backend.script_search(Ok(vec![ashesi()]));
            self.send(WorkflowCommand::Begin);
            self.send(WorkflowCommand::QueryChanged("Ashesi".into()));
            self.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
                .await;
            self.send(WorkflowCommand::SelectInstitution(ashesi()));
            self.wait_for(|e| matches!(e, WorkflowEvent::MessageAppended(_)))
                .await;
        }
    }

    fn write_pdf(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("handbook.pdf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"%PDF-1.4")
            .unwrap();
        path
    }

    fn ingestion_form(path: PathBuf) -> IngestionForm {
        IngestionForm {
            institution_name: "Some New College".into(),
            abbreviation: String::new(),
            handbook_title: "Student Handbook".into(),
            academic_year: "2024-2025".into(),
            file_path: path,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_keystrokes_issue_one_search_with_the_final_query() {
        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(vec![ashesi()]));

        h.send(WorkflowCommand::Begin);
        for q in ["A", "As", "Ash", "Ashe", "Ashes", "Ashesi"] {
            h.send(WorkflowCommand::QueryChanged(q.into()));
        }

        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;

        assert_eq!(
            *h.backend.search_calls.lock().unwrap(),
            vec!["Ashesi".to_string()]
        );
        match events.last().unwrap() {
            WorkflowEvent::SearchResults {
                query,
                institutions,
                failed,
            } => {
                assert_eq!(query, "Ashesi");
                assert_eq!(institutions.len(), 1);
                assert!(!failed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn short_queries_issue_no_request() {
        let mut h = Harness::start(MockBackend::new());
        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Ash".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchReset)).await;

        // Give any stray timer ample virtual time to fire.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.backend.search_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_a_result_seeds_one_welcome_message() {
        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(vec![ashesi()]));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Ashesi".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;

        h.send(WorkflowCommand::SelectInstitution(ashesi()));
        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::MessageAppended(_)))
            .await;

        let conversing = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing)))
            .count();
        assert_eq!(conversing, 1);
        match events.last().unwrap() {
            WorkflowEvent::MessageAppended(msg) => {
                assert_eq!(msg.author, Author::Assistant);
                assert!(msg.text.contains("Ashesi University"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_offer_the_contribution_path() {
        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Zzzzz Nonexistent College".into()));
        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        match events.last().unwrap() {
            WorkflowEvent::SearchResults {
                institutions,
                failed,
                ..
            } => {
                assert!(institutions.is_empty());
                assert!(!failed);
            }
            other => panic!("unexpected event {other:?}"),
        }

        h.send(WorkflowCommand::ContributeHandbook);
        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Ingesting)))
            .await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::InstitutionSelected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_gate_serializes_conversation_requests() {
        let mut h = Harness::start(MockBackend::new());
        h.enter_conversation().await;
        h.backend.script_chat(Ok(reply("See the housing policy.")));
        h.backend.script_chat(Ok(reply("Quiet hours start at 10pm.")));

        // The second send arrives while the first is still pending and must
        // be rejected without a request.
        h.send(WorkflowCommand::SendMessage("What about housing?".into()));
        h.send(WorkflowCommand::SendMessage("ignored while pending".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::PendingChanged(false)))
            .await;
        assert_eq!(h.backend.chat_calls.lock().unwrap().len(), 1);

        // The gate is released, so the next send goes through.
        h.send(WorkflowCommand::SendMessage("And quiet hours?".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::PendingChanged(false)))
            .await;
        assert_eq!(h.backend.chat_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_conversation_request_appends_fallback_and_clears_pending() {
        let mut h = Harness::start(MockBackend::new());
        h.enter_conversation().await;
        h.backend.script_chat(Err(ApiError::Remote {
            status: 500,
            message: "model overloaded".into(),
        }));

        h.send(WorkflowCommand::SendMessage("What about housing?".into()));
        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::PendingChanged(false)))
            .await;

        let assistant: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::MessageAppended(m) if m.author == Author::Assistant => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(assistant.len(), 1);
        assert!(assistant[0].is_error);
        assert_eq!(assistant[0].text, CHAT_FALLBACK_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn ingestion_completes_into_exactly_one_conversation_transition() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_submit(Ok("job-7".into()));
        h.backend
            .script_status(Ok(processing_snapshot(30, "Extracting text")));
        h.backend
            .script_status(Ok(processing_snapshot(80, "Embedding sections")));
        h.backend
            .script_status(Ok(completed_snapshot("newcol", "newcol_2024_hb")));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);
        h.wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Ingesting)))
            .await;

        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf)));
        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::MessageAppended(_)))
            .await;

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::JobProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 30, 80, 100]);

        let conversing = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing)))
            .count();
        assert_eq!(conversing, 1);

        match events.last().unwrap() {
            WorkflowEvent::MessageAppended(msg) => {
                assert!(msg.text.contains("Some New College"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::InstitutionSelected(i) if i.id == "newcol"
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::JobFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_do_not_fail_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_submit(Ok("job-7".into()));
        for _ in 0..3 {
            h.backend
                .script_status(Err(ApiError::transport("connection reset")));
        }
        h.backend
            .script_status(Ok(completed_snapshot("newcol", "newcol_2024_hb")));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);
        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf)));

        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing)))
            .await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::JobFailed { .. })));
        assert_eq!(h.backend.status_calls.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_never_reaches_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);

        let mut form = ingestion_form(pdf);
        form.handbook_title.clear();
        h.send(WorkflowCommand::SubmitIngestion(form));
        h.wait_for(|e| matches!(e, WorkflowEvent::ValidationFailed(_)))
            .await;

        assert!(h.backend.register_calls.lock().unwrap().is_empty());
        assert!(h.backend.submit_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failure_after_registration_is_surfaced_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_submit(Err(ApiError::Remote {
            status: 500,
            message: "storage unavailable".into(),
        }));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);
        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf)));

        let events = h
            .wait_for(|e| matches!(e, WorkflowEvent::JobFailed { .. }))
            .await;
        match events.last().unwrap() {
            WorkflowEvent::JobFailed { message } => {
                assert!(message.contains("storage unavailable"));
                assert!(message.contains("not be re-registered"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Registration happened once and was not retried.
        assert_eq!(h.backend.register_calls.lock().unwrap().len(), 1);
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing))));
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_ingestion_stops_polling_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_submit(Ok("job-7".into()));
        for p in [10, 20, 30, 40, 50] {
            h.backend
                .script_status(Ok(processing_snapshot(p, "Extracting text")));
        }
        h.backend
            .script_status(Ok(completed_snapshot("newcol", "newcol_2024_hb")));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);
        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf)));
        h.wait_for(|e| matches!(e, WorkflowEvent::JobProgress { percent: 10, .. }))
            .await;

        h.send(WorkflowCommand::CancelIngestion);
        h.wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Discovering)))
            .await;
        let polls_at_cancel = h.backend.status_calls.lock().unwrap().len();

        // The poller is aborted: no further polls, no late transition.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.backend.status_calls.lock().unwrap().len(), polls_at_cancel);
        while let Ok(ev) = h.event_rx.try_recv() {
            assert!(!matches!(ev, WorkflowEvent::ScreenChanged(Screen::Conversing)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_submission_cannot_become_the_active_job() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir);

        let mut h = Harness::start(MockBackend::new());
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_search(Ok(Vec::new()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_register(Ok(new_college()));
        h.backend.script_submit(Ok("job-a".into()));
        h.backend.script_submit(Ok("job-b".into()));
        h.backend
            .script_status(Ok(completed_snapshot("newcol", "newcol_2024_hb")));

        h.send(WorkflowCommand::Begin);
        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
            .await;
        h.send(WorkflowCommand::ContributeHandbook);

        // Cancel is queued right behind the submit, so it is handled while
        // the first submission's remote calls are still in flight.
        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf.clone())));
        h.send(WorkflowCommand::CancelIngestion);
        let mut events = h
            .wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Discovering)))
            .await;

        // Let the canceled submission finish against the backend and its
        // completion be discarded before starting over.
        while h.backend.submit_calls.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.send(WorkflowCommand::QueryChanged("Some New College".into()));
        events.extend(
            h.wait_for(|e| matches!(e, WorkflowEvent::SearchResults { .. }))
                .await,
        );
        h.send(WorkflowCommand::ContributeHandbook);
        h.send(WorkflowCommand::SubmitIngestion(ingestion_form(pdf)));
        events.extend(
            h.wait_for(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing)))
                .await,
        );

        // Only the second submission's job is adopted and polled; the
        // canceled one neither surfaces nor spawns a poller.
        for ev in &events {
            if let WorkflowEvent::JobSubmitted { job_id } = ev {
                assert_eq!(job_id, "job-b");
            }
        }
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::JobFailed { .. })));
        let conversing = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::ScreenChanged(Screen::Conversing)))
            .count();
        assert_eq!(conversing, 1);
        assert!(h
            .backend
            .status_calls
            .lock()
            .unwrap()
            .iter()
            .all(|job| job == "job-b"));
    }
}
