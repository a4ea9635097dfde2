//! Scripted backend used by controller and poller tests.

use crate::api::{ApiError, ApiResult, Backend, JobStatusSnapshot};
use crate::model::{AssistantReply, Institution, JobResult, JobStatus};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory [`Backend`] whose responses are scripted per operation, in
/// call order. Every call is recorded so tests can assert exactly which
/// requests were issued. An exhausted script answers with a remote error,
/// which fails the test loudly instead of hanging it.
#[derive(Default)]
pub(crate) struct MockBackend {
    pub search_calls: Mutex<Vec<String>>,
    pub search_script: Mutex<VecDeque<ApiResult<Vec<Institution>>>>,
    pub register_calls: Mutex<Vec<String>>,
    pub register_script: Mutex<VecDeque<ApiResult<Institution>>>,
    pub submit_calls: Mutex<Vec<String>>,
    pub submit_script: Mutex<VecDeque<ApiResult<String>>>,
    pub status_calls: Mutex<Vec<String>>,
    pub status_script: Mutex<VecDeque<ApiResult<JobStatusSnapshot>>>,
    pub chat_calls: Mutex<Vec<(String, String, String)>>,
    pub chat_script: Mutex<VecDeque<ApiResult<AssistantReply>>>,
}

fn exhausted<T>() -> ApiResult<T> {
    Err(ApiError::Remote {
        status: 599,
        message: "mock script exhausted".into(),
    })
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script_search(&self, r: ApiResult<Vec<Institution>>) {
        self.search_script.lock().unwrap().push_back(r);
    }

    pub(crate) fn script_register(&self, r: ApiResult<Institution>) {
        self.register_script.lock().unwrap().push_back(r);
    }

    pub(crate) fn script_submit(&self, r: ApiResult<String>) {
        self.submit_script.lock().unwrap().push_back(r);
    }

    pub(crate) fn script_status(&self, r: ApiResult<JobStatusSnapshot>) {
        self.status_script.lock().unwrap().push_back(r);
    }

    pub(crate) fn script_chat(&self, r: ApiResult<AssistantReply>) {
        self.chat_script.lock().unwrap().push_back(r);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn search_institutions(&self, query: &str) -> ApiResult<Vec<Institution>> {
        self.search_calls.lock().unwrap().push(query.to_string());
        self.search_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(exhausted)
    }

    async fn register_institution(
        &self,
        display_name: &str,
        _abbreviation: Option<&str>,
    ) -> ApiResult<Institution> {
        self.register_calls
            .lock()
            .unwrap()
            .push(display_name.to_string());
        self.register_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(exhausted)
    }

    async fn submit_handbook(
        &self,
        institution_id: &str,
        _file_name: &str,
        _file_bytes: Vec<u8>,
        _title: &str,
        _academic_year: &str,
    ) -> ApiResult<String> {
        self.submit_calls
            .lock()
            .unwrap()
            .push(institution_id.to_string());
        self.submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(exhausted)
    }

    async fn get_job_status(&self, job_id: &str) -> ApiResult<JobStatusSnapshot> {
        self.status_calls.lock().unwrap().push(job_id.to_string());
        self.status_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(exhausted)
    }

    async fn send_message(
        &self,
        text: &str,
        institution_id: &str,
        session_id: &str,
    ) -> ApiResult<AssistantReply> {
        self.chat_calls.lock().unwrap().push((
            text.to_string(),
            institution_id.to_string(),
            session_id.to_string(),
        ));
        self.chat_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(exhausted)
    }
}

pub(crate) fn processing_snapshot(percent: u8, message: &str) -> JobStatusSnapshot {
    JobStatusSnapshot {
        status: JobStatus::Processing,
        progress_percent: percent,
        message: message.to_string(),
        result: None,
    }
}

pub(crate) fn completed_snapshot(institution_id: &str, handbook_id: &str) -> JobStatusSnapshot {
    JobStatusSnapshot {
        status: JobStatus::Completed,
        progress_percent: 100,
        message: "Handbook processed successfully".to_string(),
        result: Some(JobResult {
            institution_id: institution_id.to_string(),
            handbook_id: handbook_id.to_string(),
        }),
    }
}
