//! Completion waiter: turns the shared event feed into one job's outcome.
//!
//! The feed carries events for every job on the connection. Only events whose
//! `device` (or `id`) matches one of the caller's targets are considered;
//! everything else is skipped.

use std::time::Duration;

use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::{
    error::{Error, Result},
    event_stream::EventStream,
    types::Event,
};

/// Job finished successfully.
pub const BLOCK_JOB_COMPLETED: &str = "BLOCK_JOB_COMPLETED";
/// Job was cancelled before it finished.
pub const BLOCK_JOB_CANCELLED: &str = "BLOCK_JOB_CANCELLED";
/// Job hit an I/O error.
pub const BLOCK_JOB_ERROR: &str = "BLOCK_JOB_ERROR";

/// Terminal result of waiting on a block job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// A matching completion event without an error.
    Completed,
    /// A matching error, cancellation, or failed completion event.
    Failed {
        /// Reason taken from the event payload.
        reason: String,
    },
    /// The event feed ended first. The job may still be running.
    StreamEnded,
    /// The deadline elapsed first. The job may still be running.
    TimedOut,
}

impl JobOutcome {
    /// Map this outcome onto the crate error type.
    ///
    /// `device` names the job in the error; `timeout` is the deadline that
    /// was waited on.
    pub fn into_result(self, device: &str, timeout: Duration) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed { reason } => Err(Error::JobFailed {
                device: device.to_string(),
                reason,
            }),
            Self::StreamEnded => Err(Error::JobStreamEnded {
                device: device.to_string(),
            }),
            Self::TimedOut => Err(Error::JobTimeout {
                device: device.to_string(),
                timeout,
            }),
        }
    }
}

/// The subset of block job event payloads the waiter reads.
#[derive(Debug, Default, Deserialize)]
struct JobEventData {
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    len: Option<u64>,
}

impl JobEventData {
    fn matches(&self, targets: &[&str]) -> bool {
        [self.device.as_deref(), self.id.as_deref()]
            .into_iter()
            .flatten()
            .any(|id| targets.contains(&id))
    }
}

/// Classify one event against the targets.
///
/// Returns `None` for events that do not belong to the job or do not end it.
pub(crate) fn classify(event: &Event, targets: &[&str]) -> Option<JobOutcome> {
    let name = event.name.as_str();
    if ![BLOCK_JOB_COMPLETED, BLOCK_JOB_CANCELLED, BLOCK_JOB_ERROR].contains(&name) {
        return None;
    }

    let data: JobEventData = serde_json::from_value(event.data.clone()).ok()?;
    if !data.matches(targets) {
        return None;
    }

    let outcome = match name {
        BLOCK_JOB_COMPLETED => match data.error {
            None => JobOutcome::Completed,
            Some(reason) => JobOutcome::Failed { reason },
        },
        BLOCK_JOB_ERROR => JobOutcome::Failed {
            reason: format!(
                "{} error (action: {})",
                data.operation.as_deref().unwrap_or("unknown"),
                data.action.as_deref().unwrap_or("unknown"),
            ),
        },
        _ => JobOutcome::Failed {
            reason: match (data.offset, data.len) {
                (Some(offset), Some(len)) => format!("job cancelled at {offset}/{len}"),
                _ => "job cancelled".to_string(),
            },
        },
    };

    Some(outcome)
}

/// Wait for the job identified by any of `targets` to reach a terminal state.
///
/// `events` must have been subscribed before the command that starts or
/// finishes the job was sent; events published earlier are not replayed.
///
/// On timeout the wait is abandoned. The job itself is left alone.
pub async fn wait_for_job(
    events: &mut EventStream,
    targets: &[&str],
    timeout: Duration,
) -> JobOutcome {
    match tokio::time::timeout(timeout, next_outcome(events, targets)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => JobOutcome::TimedOut,
    }
}

async fn next_outcome(events: &mut EventStream, targets: &[&str]) -> JobOutcome {
    loop {
        match events.next().await {
            Some(Ok(event)) => {
                if let Some(outcome) = classify(&event, targets) {
                    return outcome;
                }
            }
            Some(Err(_lagged)) => {
                // A dropped event may have been ours; keep waiting, the
                // deadline still bounds the call.
                #[cfg(feature = "tracing")]
                tracing::warn!(targets = ?targets, error = %_lagged, "block job waiter lagged");
            }
            None => return JobOutcome::StreamEnded,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;

    fn event(name: &str, data: serde_json::Value) -> Event {
        Event {
            name: name.to_string(),
            data,
            timestamp: None,
        }
    }

    #[test]
    fn completion_for_target_succeeds() {
        let ev = event(
            BLOCK_JOB_COMPLETED,
            json!({"type": "commit", "device": "job-1", "len": 10, "offset": 10, "speed": 0}),
        );
        assert_eq!(classify(&ev, &["job-1"]), Some(JobOutcome::Completed));
        assert_eq!(classify(&ev, &["job-2"]), None);
    }

    #[test]
    fn completion_with_error_fails_with_that_error() {
        let ev = event(
            BLOCK_JOB_COMPLETED,
            json!({"device": "node-A", "error": "No space left on device"}),
        );
        assert_eq!(
            classify(&ev, &["job-1", "node-A"]),
            Some(JobOutcome::Failed {
                reason: "No space left on device".into()
            })
        );
    }

    #[test]
    fn error_and_cancel_events_carry_payload_reason() {
        let err = event(
            BLOCK_JOB_ERROR,
            json!({"device": "drive0", "operation": "write", "action": "report"}),
        );
        assert_eq!(
            classify(&err, &["drive0"]),
            Some(JobOutcome::Failed {
                reason: "write error (action: report)".into()
            })
        );

        let cancelled = event(
            BLOCK_JOB_CANCELLED,
            json!({"device": "drive0", "offset": 3, "len": 9}),
        );
        assert_eq!(
            classify(&cancelled, &["drive0"]),
            Some(JobOutcome::Failed {
                reason: "job cancelled at 3/9".into()
            })
        );
    }

    #[test]
    fn job_id_field_is_matched_too() {
        let ev = event(BLOCK_JOB_COMPLETED, json!({"id": "job-1"}));
        assert_eq!(classify(&ev, &["job-1"]), Some(JobOutcome::Completed));
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let ready = event("BLOCK_JOB_READY", json!({"device": "drive0"}));
        assert_eq!(classify(&ready, &["drive0"]), None);

        let malformed = event(BLOCK_JOB_COMPLETED, json!("not an object"));
        assert_eq!(classify(&malformed, &["drive0"]), None);
    }

    #[tokio::test]
    async fn skips_other_jobs_until_own_event() {
        let (tx, rx) = broadcast::channel(8);
        let mut events = EventStream::new(rx);

        tx.send(event(BLOCK_JOB_ERROR, json!({"device": "other", "operation": "read", "action": "stop"})))
            .unwrap();
        tx.send(event(BLOCK_JOB_COMPLETED, json!({"device": "mine"})))
            .unwrap();

        let outcome = wait_for_job(&mut events, &["mine"], Duration::from_secs(5)).await;
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn closed_feed_is_stream_ended_not_failure() {
        let (tx, rx) = broadcast::channel(8);
        let mut events = EventStream::new(rx);
        tx.send(event(BLOCK_JOB_COMPLETED, json!({"device": "other"})))
            .unwrap();
        drop(tx);

        let outcome = wait_for_job(&mut events, &["mine"], Duration::from_secs(5)).await;
        assert_eq!(outcome, JobOutcome::StreamEnded);

        let err = outcome
            .into_result("mine", Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StreamEnded);
    }

    #[tokio::test]
    async fn silent_feed_times_out() {
        let (_tx, rx) = broadcast::channel::<Event>(8);
        let mut events = EventStream::new(rx);

        let outcome = wait_for_job(&mut events, &["mine"], Duration::from_millis(20)).await;
        assert_eq!(outcome, JobOutcome::TimedOut);
    }

    #[tokio::test]
    async fn zero_timeout_with_no_events_times_out() {
        let (_tx, rx) = broadcast::channel::<Event>(8);
        let mut events = EventStream::new(rx);

        let outcome = wait_for_job(&mut events, &["mine"], Duration::ZERO).await;
        assert_eq!(outcome, JobOutcome::TimedOut);
    }

    #[tokio::test]
    async fn lag_does_not_end_the_wait() {
        let (tx, rx) = broadcast::channel(1);
        let mut events = EventStream::new(rx);

        tx.send(event(BLOCK_JOB_COMPLETED, json!({"device": "other"})))
            .unwrap();
        tx.send(event(BLOCK_JOB_COMPLETED, json!({"device": "mine"})))
            .unwrap();

        let outcome = wait_for_job(&mut events, &["mine"], Duration::from_secs(5)).await;
        assert_eq!(outcome, JobOutcome::Completed);
    }
}
