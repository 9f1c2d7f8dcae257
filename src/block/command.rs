//! Command encoding and client-side preconditions for block operations.
//!
//! Argument keys are fixed by QMP and must not change.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use super::{BlockDevice, BlockJob};
use crate::error::{Error, Result};

pub(crate) const BLOCK_JOB_CANCEL: &str = "block-job-cancel";
pub(crate) const BLOCK_COMMIT: &str = "block-commit";
pub(crate) const BLOCK_JOB_COMPLETE: &str = "block-job-complete";
pub(crate) const DRIVE_MIRROR: &str = "drive-mirror";
pub(crate) const BLOCKDEV_SNAPSHOT_SYNC: &str = "blockdev-snapshot-sync";

/// A validated, encoded QMP command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockCommand {
    pub(crate) name: &'static str,
    pub(crate) args: Value,
}

impl BlockCommand {
    fn new<A: Serialize>(name: &'static str, args: A) -> Result<Self> {
        Ok(Self {
            name,
            args: serde_json::to_value(args)?,
        })
    }
}

#[derive(Serialize)]
struct JobArgs<'a> {
    device: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct CommitArgs<'a> {
    device: &'a str,
    top: &'a str,
    job_id: &'a str,
}

#[derive(Serialize)]
struct MirrorArgs<'a> {
    device: &'a str,
    target: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct SnapshotArgs<'a> {
    node_name: &'a str,
    snapshot_file: &'a str,
    snapshot_node_name: &'a str,
}

fn require(operation: &'static str, field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(operation, format!("{field} must not be empty")));
    }
    Ok(())
}

pub(crate) fn cancel(job: &BlockJob) -> Result<BlockCommand> {
    require("cancel", "job device", &job.device)?;
    BlockCommand::new(BLOCK_JOB_CANCEL, JobArgs { device: &job.device })
}

pub(crate) fn complete(job: &BlockJob) -> Result<BlockCommand> {
    require("complete", "job device", &job.device)?;
    BlockCommand::new(BLOCK_JOB_COMPLETE, JobArgs { device: &job.device })
}

/// Commit addresses the active image by node name, not by device.
pub(crate) fn commit(disk: &BlockDevice, overlay: &str, job_id: &str) -> Result<BlockCommand> {
    require("commit", "inserted node name", &disk.inserted.node_name)?;
    require("commit", "overlay", overlay)?;
    require("commit", "job id", job_id)?;
    BlockCommand::new(
        BLOCK_COMMIT,
        CommitArgs {
            device: &disk.inserted.node_name,
            top: overlay,
            job_id,
        },
    )
}

pub(crate) fn mirror(disk: &BlockDevice, dest: &str) -> Result<BlockCommand> {
    require("mirror", "device", &disk.device)?;
    if !Path::new(dest).has_root() {
        return Err(Error::validation(
            "mirror",
            "destination must be an absolute path",
        ));
    }
    BlockCommand::new(
        DRIVE_MIRROR,
        MirrorArgs {
            device: &disk.device,
            target: dest,
        },
    )
}

pub(crate) fn snapshot(disk: &BlockDevice, overlay: &str, node_name: &str) -> Result<BlockCommand> {
    require("snapshot", "inserted node name", &disk.inserted.node_name)?;
    require("snapshot", "overlay", overlay)?;
    require("snapshot", "snapshot node name", node_name)?;
    BlockCommand::new(
        BLOCKDEV_SNAPSHOT_SYNC,
        SnapshotArgs {
            node_name: &disk.inserted.node_name,
            snapshot_file: overlay,
            snapshot_node_name: node_name,
        },
    )
}
