//! HTTP client for the handbook service.
//!
//! All remote operations go through the [`Backend`] trait so the workflow
//! controller can be driven by a scripted backend in tests. [`HttpBackend`]
//! is the production implementation over reqwest.

use crate::model::{
    AssistantReply, Evidence, Institution, JobResult, JobStatus, WorkflowConfig,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type ApiResult<T> = Result<T, ApiError>;

/// Client-side error taxonomy. `Transport` is the only retryable class;
/// the poller keys its backoff on it.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid local input; never reaches the network.
    #[error("{0}")]
    Validation(String),

    /// Connection-level failure (DNS, connect, timeout, broken transfer).
    #[error("network error: {0}")]
    Transport(String),

    /// The server answered with an error status.
    #[error("server error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// The server reported the ingestion job itself as failed. Terminal,
    /// unlike `Transport` during polling.
    #[error("ingestion failed: {0}")]
    JobFailure(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport(e.to_string())
    }
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// One observation of an ingestion job's status.
#[derive(Debug, Clone)]
pub struct JobStatusSnapshot {
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    pub result: Option<JobResult>,
}

/// Remote operations consumed by the workflow controller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Search the institution catalog. An empty list is a valid result.
    async fn search_institutions(&self, query: &str) -> ApiResult<Vec<Institution>>;

    /// Register a new institution, returning its catalog entry.
    async fn register_institution(
        &self,
        display_name: &str,
        abbreviation: Option<&str>,
    ) -> ApiResult<Institution>;

    /// Submit a handbook for ingestion; returns the tracking job id.
    async fn submit_handbook(
        &self,
        institution_id: &str,
        file_name: &str,
        file_bytes: Vec<u8>,
        title: &str,
        academic_year: &str,
    ) -> ApiResult<String>;

    /// Poll a job's status. Safe to call repeatedly.
    async fn get_job_status(&self, job_id: &str) -> ApiResult<JobStatusSnapshot>;

    /// Send one user utterance; returns exactly one assistant reply.
    async fn send_message(
        &self,
        text: &str,
        institution_id: &str,
        session_id: &str,
    ) -> ApiResult<AssistantReply>;
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(cfg: &WorkflowConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }
}

/// Map a non-success response to `ApiError::Remote`, extracting the server's
/// `detail` message when the body carries one.
async fn check(resp: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.detail)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(ApiError::Remote {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Backend for HttpBackend {
    async fn search_institutions(&self, query: &str) -> ApiResult<Vec<Institution>> {
        tracing::debug!(query, "searching catalog");
        let resp = self
            .http
            .post(self.url("search-schools"))
            .json(&SearchRequest { query })
            .send()
            .await?;
        let body: SearchResponse = check(resp).await?.json().await?;
        Ok(body.schools.into_iter().map(Institution::from).collect())
    }

    async fn register_institution(
        &self,
        display_name: &str,
        abbreviation: Option<&str>,
    ) -> ApiResult<Institution> {
        tracing::debug!(display_name, "registering institution");
        let resp = self
            .http
            .post(self.url("add-school"))
            .json(&AddSchoolRequest {
                school_name: display_name,
                school_abbreviation: abbreviation.unwrap_or(""),
            })
            .send()
            .await?;
        let body: SchoolDto = check(resp).await?.json().await?;
        Ok(Institution::from(body))
    }

    async fn submit_handbook(
        &self,
        institution_id: &str,
        file_name: &str,
        file_bytes: Vec<u8>,
        title: &str,
        academic_year: &str,
    ) -> ApiResult<String> {
        tracing::debug!(institution_id, file_name, "submitting handbook");
        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("school_id", institution_id.to_string())
            .text("handbook_title", title.to_string())
            .text("academic_year", academic_year.to_string());
        let resp = self
            .http
            .post(self.url("process-handbook"))
            .multipart(form)
            .send()
            .await?;
        let body: SubmitResponse = check(resp).await?.json().await?;
        Ok(body.job_id)
    }

    async fn get_job_status(&self, job_id: &str) -> ApiResult<JobStatusSnapshot> {
        let resp = self
            .http
            .get(self.url(&format!("processing-status/{job_id}")))
            .send()
            .await?;
        let body: StatusResponse = check(resp).await?.json().await?;
        Ok(body.into_snapshot())
    }

    async fn send_message(
        &self,
        text: &str,
        institution_id: &str,
        session_id: &str,
    ) -> ApiResult<AssistantReply> {
        tracing::debug!(institution_id, "sending chat message");
        let resp = self
            .http
            .post(self.url("chat"))
            .json(&ChatRequest {
                message: text,
                school_id: institution_id,
                session_id,
            })
            .send()
            .await?;
        let body: ChatResponse = check(resp).await?.json().await?;
        Ok(AssistantReply {
            text: body.response,
            evidence: body.sources.into_iter().map(Evidence::from).collect(),
            confidence: body.confidence,
        })
    }
}

// Wire DTOs. Field names follow the service's JSON contract.

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    schools: Vec<SchoolDto>,
}

#[derive(Deserialize)]
struct SchoolDto {
    school_id: String,
    school_name: String,
    #[serde(default)]
    school_abbreviation: Option<String>,
}

impl From<SchoolDto> for Institution {
    fn from(dto: SchoolDto) -> Self {
        Self {
            id: dto.school_id,
            display_name: dto.school_name,
            abbreviation: dto.school_abbreviation.filter(|a| !a.is_empty()),
        }
    }
}

#[derive(Serialize)]
struct AddSchoolRequest<'a> {
    school_name: &'a str,
    school_abbreviation: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: JobStatus,
    /// The service reports a float and uses -1 for errored jobs.
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Option<StatusResultDto>,
}

#[derive(Deserialize)]
struct StatusResultDto {
    handbook_id: String,
    #[serde(default)]
    school_id: Option<String>,
}

impl StatusResponse {
    fn into_snapshot(self) -> JobStatusSnapshot {
        JobStatusSnapshot {
            status: self.status,
            progress_percent: self.progress.clamp(0.0, 100.0).round() as u8,
            message: self.message,
            result: self.result.map(|r| {
                // The service keys handbook ids as "<school>_<year>_<ts>";
                // fall back to that prefix when school_id is omitted.
                let institution_id = r.school_id.unwrap_or_else(|| {
                    r.handbook_id
                        .split('_')
                        .next()
                        .unwrap_or_default()
                        .to_string()
                });
                JobResult {
                    institution_id,
                    handbook_id: r.handbook_id,
                }
            }),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    school_id: &'a str,
    session_id: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    response: String,
    #[serde(default)]
    sources: Vec<SourceDto>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct SourceDto {
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    similarity: f64,
    #[serde(default)]
    excerpt: String,
}

impl From<SourceDto> for Evidence {
    fn from(dto: SourceDto) -> Self {
        Self {
            title: dto.title,
            category: dto.category,
            similarity: dto.similarity,
            excerpt: dto.excerpt,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<String>,
}
