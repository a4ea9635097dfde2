//! The session aggregate and its state-machine transitions.
//!
//! Every transition is a synchronous method with no I/O and no clocks, so each
//! one can be unit-tested in isolation. The controller owns the single
//! [`Session`] instance, calls these methods, and turns the returned
//! directives into spawned tasks and UI events.

use crate::api::ApiResult;
use crate::model::{
    AssistantReply, Institution, JobResult, Message, Screen, SubmittedJob,
};

/// Queries must be strictly longer than this many characters (after trimming)
/// before a catalog request is scheduled.
pub(crate) const SEARCH_MIN_CHARS: usize = 3;

/// Shown as an assistant message when a conversation request fails.
pub(crate) const CHAT_FALLBACK_TEXT: &str =
    "I'm sorry, I'm having trouble processing your request right now. Please try again.";

/// The search slot: current epoch, the query belonging to it, and the last
/// applied result list.
#[derive(Debug, Default)]
pub(crate) struct SearchState {
    /// Bumped on every keystroke and on every screen change away from
    /// discovery; timers and responses carrying an older epoch are stale.
    pub epoch: u64,
    pub query: String,
    pub results: Vec<Institution>,
    /// True once a search has completed (even a failed one), so the UI can
    /// tell "searched, found nothing" from "never searched".
    pub searched: bool,
}

#[derive(Debug)]
struct ActiveJob {
    job_id: String,
    institution: Institution,
}

/// What the controller should do after a keystroke in the search box.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SearchDirective {
    /// Start (or restart) the quiet-period timer for this epoch.
    Schedule { epoch: u64 },
    /// Query fell below the threshold; results were cleared.
    Clear,
    /// Not on the discovery screen; nothing to do.
    Ignore,
}

pub(crate) struct Session {
    pub screen: Screen,
    pub selected: Option<Institution>,
    /// Handbook produced by the most recent completed ingestion, if any.
    pub handbook_id: Option<String>,
    pub messages: Vec<Message>,
    /// Single-flight gate for conversation requests.
    pub pending: bool,
    pub search: SearchState,
    submitting: bool,
    /// Guards the submission slot the way the search epoch guards searches:
    /// stamped by `begin_submission`, bumped when the slot is invalidated, so
    /// completions of a superseded submission are discarded.
    submit_seq: u64,
    active_job: Option<ActiveJob>,
    chat_seq: u64,
    next_message_id: u64,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            screen: Screen::Landing,
            selected: None,
            handbook_id: None,
            messages: Vec::new(),
            pending: false,
            search: SearchState::default(),
            submitting: false,
            submit_seq: 0,
            active_job: None,
            chat_seq: 0,
            next_message_id: 1,
        }
    }

    fn push_message(&mut self, build: impl FnOnce(u64) -> Message) -> Message {
        let msg = build(self.next_message_id);
        self.next_message_id += 1;
        self.messages.push(msg.clone());
        msg
    }

    /// `Landing -> Discovering`.
    pub(crate) fn begin(&mut self) -> bool {
        if self.screen != Screen::Landing {
            return false;
        }
        self.screen = Screen::Discovering;
        true
    }

    /// A keystroke in the search box. Always invalidates the previous epoch.
    pub(crate) fn query_changed(&mut self, raw: &str) -> SearchDirective {
        if self.screen != Screen::Discovering {
            return SearchDirective::Ignore;
        }
        self.search.epoch += 1;
        let query = raw.trim();
        if query.chars().count() > SEARCH_MIN_CHARS {
            self.search.query = query.to_string();
            SearchDirective::Schedule {
                epoch: self.search.epoch,
            }
        } else {
            self.search.query.clear();
            self.search.results.clear();
            self.search.searched = false;
            SearchDirective::Clear
        }
    }

    /// The query to issue when a quiet-period timer fires, or None if the
    /// timer is stale.
    pub(crate) fn query_for_epoch(&self, epoch: u64) -> Option<String> {
        if self.screen == Screen::Discovering
            && epoch == self.search.epoch
            && !self.search.query.is_empty()
        {
            Some(self.search.query.clone())
        } else {
            None
        }
    }

    /// Apply a completed search. Stale responses (older epoch, or the user
    /// has left discovery) are discarded; the result list always reflects
    /// the most recently issued query. A failed search degrades to an empty,
    /// completed result.
    pub(crate) fn apply_search_outcome(
        &mut self,
        epoch: u64,
        outcome: ApiResult<Vec<Institution>>,
    ) -> Option<(Vec<Institution>, bool)> {
        if self.screen != Screen::Discovering || epoch != self.search.epoch {
            return None;
        }
        self.search.searched = true;
        match outcome {
            Ok(list) => {
                self.search.results = list.clone();
                Some((list, false))
            }
            Err(_) => {
                self.search.results.clear();
                Some((Vec::new(), true))
            }
        }
    }

    /// `Discovering -> Conversing` on picking a search result. Seeds the one
    /// locally fabricated welcome message.
    pub(crate) fn select_institution(&mut self, institution: Institution) -> Option<Message> {
        if self.screen != Screen::Discovering {
            return None;
        }
        self.search.epoch += 1;
        self.screen = Screen::Conversing;
        let text = welcome_on_select(&institution.display_name);
        self.selected = Some(institution);
        Some(self.push_message(|id| Message::assistant(id, text, Vec::new(), None)))
    }

    /// Only offered after a completed search with zero results.
    pub(crate) fn can_contribute(&self) -> bool {
        self.screen == Screen::Discovering && self.search.searched && self.search.results.is_empty()
    }

    /// `Discovering -> Ingesting`.
    pub(crate) fn choose_contribute(&mut self) -> bool {
        if !self.can_contribute() {
            return false;
        }
        self.search.epoch += 1;
        self.screen = Screen::Ingesting;
        true
    }

    /// Claim the single submission slot before issuing the two remote calls.
    /// Returns the sequence token the completion must carry.
    pub(crate) fn begin_submission(&mut self) -> Option<u64> {
        if self.screen != Screen::Ingesting || self.submitting || self.active_job.is_some() {
            return None;
        }
        self.submitting = true;
        self.submit_seq += 1;
        Some(self.submit_seq)
    }

    /// Release the slot after a failed submission. Failures carrying a stale
    /// token are ignored so they cannot release a later submission's slot.
    pub(crate) fn submission_failed(&mut self, seq: u64) -> bool {
        if seq != self.submit_seq || !self.submitting {
            return false;
        }
        self.submitting = false;
        true
    }

    /// Both submission calls succeeded; the job is now the active one.
    /// Completions carrying a stale token are refused.
    pub(crate) fn job_submitted(&mut self, seq: u64, job: SubmittedJob) -> bool {
        if seq != self.submit_seq || self.screen != Screen::Ingesting || !self.submitting {
            return false;
        }
        self.submitting = false;
        self.active_job = Some(ActiveJob {
            job_id: job.job_id,
            institution: job.institution,
        });
        true
    }

    pub(crate) fn job_is_active(&self, job_id: &str) -> bool {
        self.active_job
            .as_ref()
            .map(|j| j.job_id == job_id)
            .unwrap_or(false)
    }

    /// `Ingesting -> Conversing` when the active job completes. The job's
    /// result supplies the institution identifier; the display name comes
    /// from registration.
    pub(crate) fn complete_job(&mut self, job_id: &str, result: JobResult) -> Option<Message> {
        if self.screen != Screen::Ingesting || !self.job_is_active(job_id) {
            return None;
        }
        let job = self.active_job.take()?;
        let mut institution = job.institution;
        if !result.institution_id.is_empty() {
            institution.id = result.institution_id;
        }
        self.handbook_id = Some(result.handbook_id);
        self.screen = Screen::Conversing;
        let text = welcome_after_upload(&institution.display_name);
        self.selected = Some(institution);
        Some(self.push_message(|id| Message::assistant(id, text, Vec::new(), None)))
    }

    /// The server reported the active job as failed. Stay on the ingestion
    /// screen so the user can correct and resubmit.
    pub(crate) fn fail_job(&mut self, job_id: &str) -> bool {
        if !self.job_is_active(job_id) {
            return false;
        }
        self.active_job = None;
        self.submitting = false;
        true
    }

    /// `Ingesting -> Discovering` (user backed out). Drops the active job;
    /// the controller aborts the poller task.
    pub(crate) fn cancel_ingestion(&mut self) -> bool {
        if self.screen != Screen::Ingesting {
            return false;
        }
        self.active_job = None;
        self.submitting = false;
        self.submit_seq += 1;
        self.reset_search();
        self.screen = Screen::Discovering;
        true
    }

    /// Accept a user utterance if non-empty and no request is in flight.
    /// Returns the sequence token the reply must carry.
    pub(crate) fn send_user_message(&mut self, raw: &str) -> Option<(u64, Message)> {
        if self.screen != Screen::Conversing || self.pending {
            return None;
        }
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        self.pending = true;
        self.chat_seq += 1;
        let seq = self.chat_seq;
        let text = text.to_string();
        let msg = self.push_message(|id| Message::user(id, text));
        Some((seq, msg))
    }

    /// Apply a conversation outcome. Clears `pending` on success and failure
    /// alike; replies from a superseded exchange are dropped.
    pub(crate) fn apply_reply(
        &mut self,
        seq: u64,
        outcome: ApiResult<AssistantReply>,
    ) -> Option<Message> {
        if seq != self.chat_seq || !self.pending {
            return None;
        }
        self.pending = false;
        let msg = match outcome {
            Ok(reply) => self.push_message(|id| {
                Message::assistant(id, reply.text, reply.evidence, reply.confidence)
            }),
            Err(_) => self.push_message(|id| Message::assistant_error(id, CHAT_FALLBACK_TEXT)),
        };
        Some(msg)
    }

    /// `Conversing -> Discovering`: discards the conversation and selection.
    pub(crate) fn change_institution(&mut self) -> bool {
        if self.screen != Screen::Conversing {
            return false;
        }
        self.messages.clear();
        self.selected = None;
        self.handbook_id = None;
        self.pending = false;
        self.chat_seq += 1;
        self.next_message_id = 1;
        self.reset_search();
        self.screen = Screen::Discovering;
        true
    }

    /// Full reset to the landing screen. The epoch and sequence counters
    /// survive so outstanding timers, replies, and submissions from before
    /// the reset stay stale.
    pub(crate) fn reset(&mut self) {
        let epoch = self.search.epoch + 1;
        let chat = self.chat_seq + 1;
        let submit = self.submit_seq + 1;
        *self = Session::new();
        self.search.epoch = epoch;
        self.chat_seq = chat;
        self.submit_seq = submit;
    }

    fn reset_search(&mut self) {
        self.search.epoch += 1;
        self.search.query.clear();
        self.search.results.clear();
        self.search.searched = false;
    }
}

fn welcome_on_select(name: &str) -> String {
    format!(
        "Hello! I'm your {name} Student Handbook assistant. I can help you find \
         information about academic policies, student conduct, housing rules, and \
         more. What would you like to know?"
    )
}

fn welcome_after_upload(name: &str) -> String {
    format!(
        "Welcome! I've successfully processed your {name} handbook. I can now help \
         you find information about academic policies, student conduct, and more. \
         What would you like to know?"
    )
}
