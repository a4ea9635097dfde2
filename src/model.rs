use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub base_url: String,
    /// Correlates chat requests belonging to one client visit.
    pub session_id: String,
    #[serde(with = "humantime_serde")]
    pub search_debounce: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub completion_settle: Duration,
    pub user_agent: String,
}

/// Screens of the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Screen {
    Landing,
    Discovering,
    Ingesting,
    Conversing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub id: String,
    pub display_name: String,
    pub abbreviation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Author {
    User,
    Assistant,
}

/// A supporting handbook excerpt attached to an assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub title: String,
    pub category: String,
    /// Similarity of the excerpt to the question, in [0, 1].
    pub similarity: f64,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub author: Author,
    pub text: String,
    pub created_at: String,
    pub is_error: bool,
    pub evidence: Vec<Evidence>,
    pub confidence: Option<f64>,
}

impl Message {
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            author: Author::User,
            text: text.into(),
            created_at: now_rfc3339(),
            is_error: false,
            evidence: Vec::new(),
            confidence: None,
        }
    }

    pub fn assistant(
        id: u64,
        text: impl Into<String>,
        evidence: Vec<Evidence>,
        confidence: Option<f64>,
    ) -> Self {
        Self {
            id,
            author: Author::Assistant,
            text: text.into(),
            created_at: now_rfc3339(),
            is_error: false,
            evidence,
            confidence,
        }
    }

    pub fn assistant_error(id: u64, text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(id, text, Vec::new(), None)
        }
    }
}

/// Current UTC time rendered as RFC3339, the format used on messages and
/// transcript filenames.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

/// Identifiers produced by a completed ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub institution_id: String,
    pub handbook_id: String,
}

/// An assistant reply as returned by the conversation endpoint.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub text: String,
    pub evidence: Vec<Evidence>,
    pub confidence: Option<f64>,
}

/// Outcome of the two-step submission: the registered institution plus the
/// job handle tracking its handbook.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: String,
    pub institution: Institution,
}

/// User-entered fields for contributing a new handbook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionForm {
    pub institution_name: String,
    pub abbreviation: String,
    pub handbook_title: String,
    pub academic_year: String,
    pub file_path: PathBuf,
}

impl IngestionForm {
    /// Local validation; a failure here never reaches the network.
    pub fn validate(&self) -> Result<(), String> {
        if self.institution_name.trim().is_empty()
            || self.handbook_title.trim().is_empty()
            || self.academic_year.trim().is_empty()
            || self.file_path.as_os_str().is_empty()
        {
            return Err("Please fill in all required fields and select a PDF file.".into());
        }
        let is_pdf = self
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            return Err("Please upload a PDF file only.".into());
        }
        if !self.file_path.is_file() {
            return Err(format!("File not found: {}", self.file_path.display()));
        }
        Ok(())
    }
}

/// Events emitted by the controller and consumed by presentation layers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    ScreenChanged(Screen),
    SearchStarted {
        query: String,
    },
    /// A search finished; `failed` marks a degraded (transport/remote error)
    /// completion that is shown as "no results".
    SearchResults {
        query: String,
        institutions: Vec<Institution>,
        failed: bool,
    },
    /// Query dropped below the threshold or the screen was left; any result
    /// list shown so far is stale.
    SearchReset,
    InstitutionSelected(Institution),
    MessageAppended(Message),
    PendingChanged(bool),
    JobSubmitted {
        job_id: String,
    },
    JobProgress {
        percent: u8,
        message: String,
    },
    JobFailed {
        message: String,
    },
    ValidationFailed(String),
    Info(String),
}
