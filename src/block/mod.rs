//! Block device and block job operations.
//!
//! [`BlockDevice`] and [`BlockJob`] are plain values owned by the caller;
//! operations borrow them and never mutate them.
//!
//! | Operation | Command | Outcome decided by |
//! |---|---|---|
//! | [`BlockDevice::commit`] | `block-commit` | job event |
//! | [`BlockDevice::mirror`] | `drive-mirror` | acknowledgment |
//! | [`BlockDevice::snapshot`] | `blockdev-snapshot-sync` | acknowledgment |
//! | [`BlockJob::cancel`] | `block-job-cancel` | acknowledgment |
//! | [`BlockJob::complete`] | `block-job-complete` | job event |
//!
//! A synchronous refusal from the server is final. A job that times out or
//! whose event stream ends is left running on the VM; see
//! [`crate::Error::is_job_state_unknown`].
//!
//! ```no_run
//! use std::time::Duration;
//! use qmp_block::{Client, Endpoint, block};
//! # async fn demo() -> qmp_block::Result<()> {
//! let client = Client::connect(Endpoint::unix("/var/run/qemu-server/100.qmp")).await?;
//!
//! for disk in block::block_devices(&client).await? {
//!     if disk.device == "drive-virtio-disk0" {
//!         disk.commit(&client, "/images/overlay.qcow2", "commit-0", Duration::from_secs(600))
//!             .await?;
//!     }
//! }
//! # Ok(()) }
//! ```

mod command;
mod wait;

pub use wait::{
    BLOCK_JOB_CANCELLED, BLOCK_JOB_COMPLETED, BLOCK_JOB_ERROR, JobOutcome, wait_for_job,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::{client::CallOptions, domain::Domain, error::Result};

use command::BlockCommand;

/// A guest-visible block device, as reported by `query-block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device identifier (e.g. `drive-virtio-disk0`).
    pub device: String,

    /// Currently inserted medium.
    #[serde(default)]
    pub inserted: Inserted,

    /// Whether the guest locked the medium.
    #[serde(default)]
    pub locked: bool,

    /// Whether the medium is removable.
    #[serde(default)]
    pub removable: bool,
}

/// The medium inserted in a [`BlockDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inserted {
    /// Node name of the active (top) image.
    #[serde(rename = "node-name", default)]
    pub node_name: String,

    /// Image file name.
    #[serde(default)]
    pub file: String,

    /// Format driver (`qcow2`, `raw`, ...).
    #[serde(rename = "drv", default)]
    pub driver: String,

    /// Backing file of the active image, if any.
    #[serde(default)]
    pub backing_file: Option<String>,

    /// Read-only.
    #[serde(default)]
    pub ro: bool,
}

/// Handle to a running block job.
///
/// Holds only the identifier the job is filed under; it is not a status cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockJob {
    /// Job identifier. QEMU reports the job id here when one was given,
    /// otherwise the device name.
    pub device: String,
}

impl BlockJob {
    /// Create a handle for the job filed under `device`.
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    /// Cancel the job.
    ///
    /// Returns once the server acknowledged the request; `timeout` bounds that
    /// acknowledgment. Cancellation itself finishes asynchronously.
    pub async fn cancel(&self, domain: &impl Domain, timeout: Duration) -> Result<()> {
        let cmd = command::cancel(self)?;
        dispatch(domain, cmd, ack_options(timeout)).await
    }

    /// Complete a job that reached its ready state (mirror, active commit).
    ///
    /// `timeout` bounds the whole call: the acknowledgment and then the
    /// job's completion event.
    pub async fn complete(&self, domain: &impl Domain, timeout: Duration) -> Result<()> {
        let cmd = command::complete(self)?;
        dispatch_and_wait(domain, cmd, &[self.device.as_str()], timeout).await
    }
}

impl BlockDevice {
    /// Commit `overlay` down into its backing chain as job `job_id`.
    ///
    /// The command addresses the inserted node name. `timeout` bounds the
    /// whole call: the acknowledgment and then the job's completion event.
    ///
    /// Events are correlated by job id first. The inserted node name is
    /// also accepted because QEMU builds that predate `job-id` report the
    /// job under the node it runs on; a different job that was given this
    /// node name as its id would be mistaken for this one.
    pub async fn commit(
        &self,
        domain: &impl Domain,
        overlay: &str,
        job_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let cmd = command::commit(self, overlay, job_id)?;
        let targets = [job_id, self.inserted.node_name.as_str()];
        dispatch_and_wait(domain, cmd, &targets, timeout).await
    }

    /// Start mirroring this device to `dest`, which must be absolute.
    ///
    /// Returns once the server acknowledged the request; `timeout` bounds that
    /// acknowledgment.
    pub async fn mirror(
        &self,
        domain: &impl Domain,
        dest: &str,
        timeout: Duration,
    ) -> Result<()> {
        let cmd = command::mirror(self, dest)?;
        dispatch(domain, cmd, ack_options(timeout)).await
    }

    /// Take a live external snapshot: `overlay` becomes the new active image
    /// under node name `node_name`.
    pub async fn snapshot(
        &self,
        domain: &impl Domain,
        overlay: &str,
        node_name: &str,
    ) -> Result<()> {
        let cmd = command::snapshot(self, overlay, node_name)?;
        dispatch(domain, cmd, CallOptions::default()).await
    }
}

/// List block devices via `query-block`.
pub async fn block_devices(domain: &impl Domain) -> Result<Vec<BlockDevice>> {
    query(domain, "query-block").await
}

/// List running block jobs via `query-block-jobs`.
pub async fn block_jobs(domain: &impl Domain) -> Result<Vec<BlockJob>> {
    query(domain, "query-block-jobs").await
}

async fn query<T: serde::de::DeserializeOwned>(
    domain: &impl Domain,
    command: &str,
) -> Result<Vec<T>> {
    let v = domain
        .execute(command, Value::Object(Default::default()), CallOptions::default())
        .await?;
    Ok(serde_json::from_value(v)?)
}

fn ack_options(timeout: Duration) -> CallOptions {
    CallOptions {
        timeout: Some(timeout),
        ..CallOptions::default()
    }
}

async fn dispatch(domain: &impl Domain, cmd: BlockCommand, options: CallOptions) -> Result<()> {
    #[cfg(feature = "tracing")]
    tracing::debug!(command = cmd.name, "dispatching block command");

    domain.execute(cmd.name, cmd.args, options).await?;
    Ok(())
}

async fn dispatch_and_wait(
    domain: &impl Domain,
    cmd: BlockCommand,
    targets: &[&str],
    timeout: Duration,
) -> Result<()> {
    // One deadline covers both the acknowledgment and the job event.
    let deadline = Instant::now().checked_add(timeout);

    // Subscribe first so an event racing the acknowledgment is not lost.
    let mut events = domain.events();

    #[cfg(feature = "tracing")]
    let command = cmd.name;

    dispatch(domain, cmd, ack_options(timeout)).await?;

    let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
    let outcome = wait_for_job(&mut events, targets, remaining).await;

    #[cfg(feature = "tracing")]
    tracing::debug!(command, targets = ?targets, outcome = ?outcome, "block job finished waiting");

    outcome.into_result(targets.first().copied().unwrap_or_default(), timeout)
}
