//! UI-side projection of the workflow, updated from [`WorkflowEvent`]s.
//!
//! Owned by the UI thread only; no cross-thread mutation.

use crate::model::{Institution, Message, Screen, WorkflowEvent};
use std::path::Path;

pub(crate) const FORM_FIELDS: usize = 5;
pub(crate) const FIELD_NAME: usize = 0;
pub(crate) const FIELD_ABBREVIATION: usize = 1;
pub(crate) const FIELD_TITLE: usize = 2;
pub(crate) const FIELD_YEAR: usize = 3;
pub(crate) const FIELD_FILE: usize = 4;

pub(crate) const FIELD_LABELS: [&str; FORM_FIELDS] = [
    "Institution name *",
    "Abbreviation",
    "Handbook title *",
    "Academic year *",
    "PDF file path *",
];

/// The ingestion form as edited on screen.
#[derive(Debug, Default)]
pub(crate) struct FormState {
    pub fields: [String; FORM_FIELDS],
    pub focus: usize,
    /// Once the user edits the title by hand, stop deriving it from the file.
    title_edited: bool,
}

impl FormState {
    pub fn focus_next(&mut self) {
        self.focus = (self.focus + 1) % FORM_FIELDS;
    }

    pub fn focus_prev(&mut self) {
        self.focus = (self.focus + FORM_FIELDS - 1) % FORM_FIELDS;
    }

    pub fn type_char(&mut self, c: char) {
        self.fields[self.focus].push(c);
        self.after_edit();
    }

    pub fn backspace(&mut self) {
        self.fields[self.focus].pop();
        self.after_edit();
    }

    fn after_edit(&mut self) {
        match self.focus {
            FIELD_TITLE => self.title_edited = true,
            FIELD_FILE if !self.title_edited => {
                self.fields[FIELD_TITLE] =
                    crate::cli::title_from_file(Path::new(&self.fields[FIELD_FILE]));
            }
            _ => {}
        }
    }

    pub fn to_ingestion_form(&self) -> crate::model::IngestionForm {
        crate::model::IngestionForm {
            institution_name: self.fields[FIELD_NAME].clone(),
            abbreviation: self.fields[FIELD_ABBREVIATION].clone(),
            handbook_title: self.fields[FIELD_TITLE].clone(),
            academic_year: self.fields[FIELD_YEAR].clone(),
            file_path: self.fields[FIELD_FILE].clone().into(),
        }
    }
}

pub(crate) struct UiState {
    pub screen: Screen,
    pub show_help: bool,
    pub info: String,

    // Discovery
    pub query_input: String,
    pub results: Vec<Institution>,
    pub result_cursor: usize,
    pub searching: bool,
    pub searched: bool,
    pub search_failed: bool,

    // Ingestion
    pub form: FormState,
    pub job_id: Option<String>,
    pub job_percent: Option<u8>,
    pub job_message: String,
    pub job_error: Option<String>,

    // Conversation
    pub selected: Option<Institution>,
    pub messages: Vec<Message>,
    pub pending: bool,
    pub chat_input: String,
    /// Lines scrolled up from the bottom of the transcript.
    pub scroll_back: u16,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            screen: Screen::Landing,
            show_help: false,
            info: String::new(),
            query_input: String::new(),
            results: Vec::new(),
            result_cursor: 0,
            searching: false,
            searched: false,
            search_failed: false,
            form: FormState::default(),
            job_id: None,
            job_percent: None,
            job_message: String::new(),
            job_error: None,
            selected: None,
            messages: Vec::new(),
            pending: false,
            chat_input: String::new(),
            scroll_back: 0,
        }
    }
}

impl UiState {
    /// The job is submitted and not yet terminal; form edits are locked.
    pub fn job_running(&self) -> bool {
        self.job_id.is_some() && self.job_error.is_none()
    }

    /// True after a completed search with zero results.
    pub fn offers_contribution(&self) -> bool {
        self.screen == Screen::Discovering && self.searched && self.results.is_empty()
    }
}

pub(crate) fn apply_event(state: &mut UiState, event: WorkflowEvent) {
    match event {
        WorkflowEvent::ScreenChanged(screen) => {
            state.screen = screen;
            state.show_help = false;
            state.info.clear();
            match screen {
                Screen::Landing => *state = UiState::default(),
                Screen::Discovering => {
                    state.query_input.clear();
                    state.results.clear();
                    state.result_cursor = 0;
                    state.searching = false;
                    state.searched = false;
                    state.search_failed = false;
                    state.job_id = None;
                    state.job_percent = None;
                    state.job_message.clear();
                    state.job_error = None;
                }
                Screen::Ingesting => {
                    state.form = FormState::default();
                    // Seed the institution name from the query that found
                    // nothing.
                    state.form.fields[FIELD_NAME] = state.query_input.trim().to_string();
                    state.job_id = None;
                    state.job_percent = None;
                    state.job_message.clear();
                    state.job_error = None;
                }
                Screen::Conversing => {
                    state.chat_input.clear();
                    state.scroll_back = 0;
                }
            }
        }
        WorkflowEvent::SearchStarted { .. } => {
            state.searching = true;
            state.search_failed = false;
        }
        WorkflowEvent::SearchResults {
            institutions,
            failed,
            ..
        } => {
            state.searching = false;
            state.searched = true;
            state.search_failed = failed;
            state.results = institutions;
            if state.result_cursor >= state.results.len() {
                state.result_cursor = 0;
            }
        }
        WorkflowEvent::SearchReset => {
            state.searching = false;
            state.searched = false;
            state.search_failed = false;
            state.results.clear();
            state.result_cursor = 0;
        }
        WorkflowEvent::InstitutionSelected(institution) => {
            state.messages.clear();
            state.selected = Some(institution);
        }
        WorkflowEvent::MessageAppended(msg) => {
            state.messages.push(msg);
            state.scroll_back = 0;
        }
        WorkflowEvent::PendingChanged(pending) => {
            state.pending = pending;
        }
        WorkflowEvent::JobSubmitted { job_id } => {
            state.job_id = Some(job_id);
            state.job_error = None;
            state.job_percent = Some(0);
        }
        WorkflowEvent::JobProgress { percent, message } => {
            state.job_percent = Some(percent);
            state.job_message = message;
        }
        WorkflowEvent::JobFailed { message } => {
            state.job_error = Some(message);
            state.job_id = None;
            state.job_percent = None;
        }
        WorkflowEvent::ValidationFailed(message) => {
            state.info = message;
        }
        WorkflowEvent::Info(message) => {
            state.info = message;
        }
    }
}
