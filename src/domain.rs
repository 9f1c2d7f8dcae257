//! The VM-side collaborator block operations run against.

use std::future::Future;

use serde_json::Value;

use crate::{
    client::{CallOptions, Client},
    error::Result,
    event_stream::EventStream,
};

/// A running VM reachable over QMP.
///
/// Implementors provide two things:
/// - `execute`: one command, one immediate answer. A QMP `error` object must
///   surface as [`crate::Error::CommandRejected`].
/// - `events`: a fresh subscription to the event feed. Every subscription
///   must see every event published after it was created, so that concurrent
///   waiters on the same connection do not starve each other. The stream ends
///   when the connection is gone.
///
/// [`Client`] is the production implementation. [`crate::mock::MockDomain`]
/// is a scripted one for tests.
pub trait Domain: Send + Sync {
    /// Execute `command` with `args` as its `arguments` object.
    fn execute(
        &self,
        command: &str,
        args: Value,
        options: CallOptions,
    ) -> impl Future<Output = Result<Value>> + Send;

    /// Subscribe to the event feed.
    fn events(&self) -> EventStream;
}

impl Domain for Client {
    fn execute(
        &self,
        command: &str,
        args: Value,
        options: CallOptions,
    ) -> impl Future<Output = Result<Value>> + Send {
        self.execute_raw(command, args, options)
    }

    fn events(&self) -> EventStream {
        Client::events(self)
    }
}
