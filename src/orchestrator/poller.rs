//! Progress polling for ingestion jobs.
//!
//! One task per submitted job. The loop distinguishes two failure kinds: a
//! server-reported job error is terminal and surfaced once, while a failed
//! status request (transport) backs off to a longer interval and keeps
//! trying, so a flaky connection is never mistaken for a failed job.

use crate::api::{ApiError, Backend};
use crate::model::{JobResult, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Consecutive transport failures tolerated before the poller gives up on
/// reaching the server (the job itself may still be running server-side).
pub(crate) const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 30;

#[derive(Debug)]
pub(crate) enum JobUpdate {
    Progress { percent: u8, message: String },
    Completed { result: JobResult },
    Failed { message: String },
}

pub(crate) struct PollerParams<B: ?Sized> {
    pub backend: Arc<B>,
    pub job_id: String,
    pub poll_interval: Duration,
    pub poll_backoff: Duration,
    pub completion_settle: Duration,
    pub update_tx: UnboundedSender<(String, JobUpdate)>,
}

/// Poll until the job reaches a terminal status. Updates are tagged with the
/// job id so the controller can discard them once the job is no longer the
/// active one.
pub(crate) async fn poll_job<B: Backend + ?Sized>(params: PollerParams<B>) {
    let PollerParams {
        backend,
        job_id,
        poll_interval,
        poll_backoff,
        completion_settle,
        update_tx,
    } = params;

    let send = |update: JobUpdate| update_tx.send((job_id.clone(), update)).is_ok();
    let mut consecutive_failures = 0u32;
    let mut max_percent = 0u8;

    loop {
        match backend.get_job_status(&job_id).await {
            Ok(snapshot) => {
                consecutive_failures = 0;
                // A server briefly reporting a lower number must not move
                // the bar backwards.
                max_percent = max_percent.max(snapshot.progress_percent);
                match snapshot.status {
                    JobStatus::Queued | JobStatus::Processing => {
                        if !send(JobUpdate::Progress {
                            percent: max_percent,
                            message: snapshot.message,
                        }) {
                            return;
                        }
                        tokio::time::sleep(poll_interval).await;
                    }
                    JobStatus::Completed => {
                        if !send(JobUpdate::Progress {
                            percent: 100,
                            message: snapshot.message,
                        }) {
                            return;
                        }
                        match snapshot.result {
                            Some(result) => {
                                // Let the 100% state land on screen before
                                // switching to the conversation.
                                tokio::time::sleep(completion_settle).await;
                                send(JobUpdate::Completed { result });
                            }
                            None => {
                                send(JobUpdate::Failed {
                                    message: "Processing finished without a result.".into(),
                                });
                            }
                        }
                        return;
                    }
                    JobStatus::Error => {
                        let err = ApiError::JobFailure(snapshot.message);
                        send(JobUpdate::Failed {
                            message: err.user_message(),
                        });
                        return;
                    }
                }
            }
            Err(e) if e.is_transport() => {
                consecutive_failures += 1;
                tracing::warn!(
                    job = %job_id,
                    consecutive_failures,
                    error = %e,
                    "status poll failed; backing off"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    send(JobUpdate::Failed {
                        message: "Lost contact with the server while tracking the job. \
                                  Check your connection and resubmit if needed."
                            .into(),
                    });
                    return;
                }
                tokio::time::sleep(poll_backoff).await;
            }
            Err(e) => {
                // The status endpoint itself rejected us (job unknown,
                // server bug); retrying cannot help.
                send(JobUpdate::Failed {
                    message: e.user_message(),
                });
                return;
            }
        }
    }
}
