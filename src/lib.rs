//! `qmp_block` - Async QEMU/QMP block-job orchestration.
//!
//! Drives live storage operations on a running VM without pausing the guest:
//! - live commit (`block-commit`), waiting for the job's outcome
//! - drive mirror (`drive-mirror`)
//! - external snapshot (`blockdev-snapshot-sync`)
//! - job completion (`block-job-complete`), waiting for the job's outcome
//! - job cancellation (`block-job-cancel`)
//!
//! Operations that wait correlate the connection-wide event feed back to
//! their own job and report a single, classified outcome: success, job
//! failure, event stream ended, or timeout. See [`block`].
//!
//! The crate also carries the QMP client these operations run on:
//! socket connection management (Unix/TCP), handshake, id-correlated
//! `execute`, and a fan-out event stream.
//!
//! ## Quick start (Unix socket)
//!
//! ```no_run
//! use std::time::Duration;
//! use qmp_block::{BlockJob, Client, Endpoint};
//! # async fn demo() -> qmp_block::Result<()> {
//! let client = Client::connect(Endpoint::unix("/var/run/qemu-server/100.qmp")).await?;
//!
//! let job = BlockJob::new("drive-virtio-disk0");
//! match job.complete(&client, Duration::from_secs(60)).await {
//!     Ok(()) => println!("mirror pivoted"),
//!     Err(e) if e.is_job_state_unknown() => {
//!         // Still running, or not: ask the VM.
//!         let jobs = qmp_block::block::block_jobs(&client).await?;
//!         println!("running jobs: {jobs:?}");
//!     }
//!     Err(e) => return Err(e),
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod client;
mod domain;
mod event_stream;
mod transport;

pub mod block;
pub mod error;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use block::{BlockDevice, BlockJob, Inserted, JobOutcome};
pub use cancel::CancelToken;
pub use client::{CallOptions, Client, ClientBuilder, ConnectOptions, Endpoint};
pub use domain::Domain;
pub use error::{Error, ErrorKind, Result};
pub use event_stream::EventStream;
