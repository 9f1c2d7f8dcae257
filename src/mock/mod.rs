//! Test doubles for block-job orchestration.
//!
//! - [`MockDomain`]: an in-process [`Domain`] driven by a closure, for
//!   exercising block operations without a socket.
//! - [`MockServer`]: a real QMP server on TCP / Unix with scripted replies
//!   and follow-up job events.
//! - [`ReplayServer`]: replays a recorded JSONL conversation and checks the
//!   client's messages byte-for-byte (as JSON values).
//!
//! It is gated behind `cfg(test)` or the `mock` Cargo feature.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, oneshot},
};

use crate::{
    client::{CallOptions, Endpoint},
    domain::Domain,
    error::{Error, Result},
    event_stream::EventStream,
    types::{Event, Greeting, QmpInfo, QmpVersion, QmpVersionNumber},
};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Never answer. The caller's own timeout (or cancellation) ends the call.
    Stall,
}

impl MockReply {
    /// The empty `{}` return block commands answer with.
    #[must_use]
    pub fn ok() -> Self {
        Self::Return(serde_json::json!({}))
    }

    /// An error reply.
    #[must_use]
    pub fn error(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Self::Error {
            class: class.into(),
            desc: desc.into(),
        }
    }

    fn into_response(self, id: &Value) -> Option<Value> {
        match self {
            MockReply::Return(v) => Some(serde_json::json!({"return": v, "id": id})),
            MockReply::Error { class, desc } => Some(serde_json::json!({
                "error": {"class": class, "desc": desc},
                "id": id
            })),
            MockReply::Stall => None,
        }
    }
}

/// A simple mock script.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send.
    pub greeting: Greeting,

    /// Map from `execute` command name to reply.
    pub replies: HashMap<String, MockReply>,

    /// Events sent ahead of the reply to the first command.
    pub post_handshake_events: Vec<Value>,

    /// Events to send right after replying to a command.
    pub events_after: HashMap<String, Vec<Value>>,

    /// Commands after whose reply (and follow-up events) the connection closes.
    pub close_after: HashSet<String>,
}

impl MockScript {
    /// Create a default greeting matching a recent QEMU.
    #[must_use]
    pub fn default_greeting() -> Greeting {
        Greeting {
            qmp: QmpInfo {
                version: QmpVersion {
                    qemu: QmpVersionNumber {
                        major: 8,
                        minor: 2,
                        micro: 0,
                    },
                    package: "mock".to_string(),
                },
                capabilities: vec!["oob".to_string()],
            },
        }
    }

    /// Create a script with a default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Self::default_greeting(),
            replies: HashMap::new(),
            post_handshake_events: Vec::new(),
            events_after: HashMap::new(),
            close_after: HashSet::new(),
        }
    }

    /// Add a successful reply.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies.insert(command.into(), MockReply::Return(value));
        self
    }

    /// Never answer `command`; the client's own deadline has to end the call.
    #[must_use]
    pub fn reply_stall(mut self, command: impl Into<String>) -> Self {
        self.replies.insert(command.into(), MockReply::Stall);
        self
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies
            .insert(command.into(), MockReply::error(class, desc));
        self
    }

    /// Add an event sent ahead of the reply to the first command.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }

    /// Add an event to be sent after the reply to `command`.
    #[must_use]
    pub fn event_after(mut self, command: impl Into<String>, event: Value) -> Self {
        self.events_after
            .entry(command.into())
            .or_default()
            .push(event);
        self
    }

    /// Close the connection after replying to `command`.
    #[must_use]
    pub fn close_after(mut self, command: impl Into<String>) -> Self {
        self.close_after.insert(command.into());
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mock server serving one connection.
///
/// The session ends when the script or transcript is exhausted, when the
/// client disconnects, or on [`MockServer::shutdown`].
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockServer {
    /// Start a TCP mock server on 127.0.0.1 with an ephemeral port.
    pub async fn start_tcp(script: MockScript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        Ok(Self::spawn(endpoint, async move {
            if let Ok((stream, _peer)) = listener.accept().await {
                let _ = serve_script(stream, script).await;
            }
        }))
    }

    /// Start a Unix mock server at `path`, replacing any stale socket file.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<std::path::Path>, script: MockScript) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);

        let listener = tokio::net::UnixListener::bind(&path)?;
        let endpoint = Endpoint::unix(path);

        Ok(Self::spawn(endpoint, async move {
            if let Ok((stream, _addr)) = listener.accept().await {
                let _ = serve_script(stream, script).await;
            }
        }))
    }

    fn spawn<F>(endpoint: Endpoint, session: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = session => {}
                _ = shutdown_rx.recv() => {}
            }
            let _ = done_tx.send(());
        });

        Self {
            inner: Arc::new(Inner {
                endpoint,
                shutdown_tx,
                done_rx: tokio::sync::Mutex::new(Some(done_rx)),
            }),
        }
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Shut down the server and wait for the session task to finish.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(()).await;
        if let Some(done) = self.inner.done_rx.lock().await.take() {
            let _ = done.await;
        }
    }
}

async fn serve_script<S>(stream: S, script: MockScript) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    send_json(&mut w, &serde_json::to_value(&script.greeting)?).await?;

    let req = recv_json(&mut r).await?;
    let id = req.get("id").cloned().unwrap_or_else(|| Value::from(0));
    if command_name(&req) != "qmp_capabilities" {
        let err = MockReply::error("GenericError", "expected qmp_capabilities");
        if let Some(resp) = err.into_response(&id) {
            send_json(&mut w, &resp).await?;
        }
        return Ok(());
    }
    if let Some(resp) = MockReply::ok().into_response(&id) {
        send_json(&mut w, &resp).await?;
    }

    let mut post_handshake = script.post_handshake_events.iter();

    loop {
        let req = match recv_json(&mut r).await {
            Ok(v) => v,
            Err(Error::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Held back until the client is listening, i.e. has sent something.
        for ev in post_handshake.by_ref() {
            send_json(&mut w, ev).await?;
        }

        let id = req.get("id").cloned().unwrap_or_else(|| Value::from(0));
        let execute = command_name(&req);

        let reply = script
            .replies
            .get(execute)
            .cloned()
            .unwrap_or_else(|| {
                MockReply::error("CommandNotFound", format!("no mock reply for '{execute}'"))
            });
        let Some(resp) = reply.into_response(&id) else {
            // Stalled: no reply and no follow-up events for this command.
            continue;
        };
        send_json(&mut w, &resp).await?;

        for ev in script.events_after.get(execute).into_iter().flatten() {
            send_json(&mut w, ev).await?;
        }

        if script.close_after.contains(execute) {
            return Ok(());
        }
    }
}

fn command_name(req: &Value) -> &str {
    req.get("execute").and_then(Value::as_str).unwrap_or("")
}

async fn send_json<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, msg: &Value) -> Result<()> {
    w.write_all(msg.to_string().as_bytes()).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}

async fn recv_json<R: tokio::io::AsyncBufRead + Unpin>(r: &mut R) -> Result<Value> {
    let mut line = String::new();
    if r.read_line(&mut line).await? == 0 {
        return Err(Error::Disconnected);
    }
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}

/// One line of a recorded conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// Sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// Expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript: one [`TranscriptStep`] per line, blank lines ignored.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let steps = s
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line.trim()).map_err(|e| {
                    Error::protocol(format!("invalid jsonl at line {}: {e}", idx + 1))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { steps })
    }
}

/// Replays a [`Transcript`] as a QMP server over TCP.
///
/// A client message that differs from the recorded one ends the session,
/// which the client observes as a closed connection.
#[derive(Debug)]
pub struct ReplayServer {
    server: MockServer,
}

impl ReplayServer {
    /// Start a replay server on TCP.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        let server = MockServer::spawn(endpoint, async move {
            if let Ok((stream, _peer)) = listener.accept().await {
                let _ = replay(stream, transcript).await;
            }
        });

        Ok(Self { server })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.server.endpoint()
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        self.server.shutdown().await
    }
}

async fn replay(stream: TcpStream, transcript: Transcript) -> Result<()> {
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => send_json(&mut w, &msg).await?,
            TranscriptStep::Client { msg: expected } => {
                let got = recv_json(&mut r).await?;
                if got != expected {
                    return Err(Error::protocol(format!(
                        "transcript mismatch: expected {expected}, got {got}"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// A command received by a [`MockDomain`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockCommand {
    /// Command name.
    pub name: String,
    /// `arguments` object.
    pub args: Value,
}

impl MockCommand {
    /// String argument `key`, if present.
    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// What a [`MockDomain`] publishes on its event feed after a successful reply.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum MockFeed {
    /// Nothing; waiters run into their deadline.
    #[default]
    Silent,
    /// These events, in order.
    Events(Vec<Event>),
    /// Close the feed; waiters see end-of-stream.
    Close,
}

type Handler = dyn Fn(&MockCommand) -> MockReply + Send + Sync;

/// An in-process [`Domain`] for tests.
///
/// Every command is recorded and answered by the handler closure. After a
/// successful answer the configured [`MockFeed`] is applied, before
/// `execute` returns. A [`MockReply::Stall`] answer honors the call's
/// timeout and cancel token like [`crate::Client`] does.
pub struct MockDomain {
    handler: Arc<Handler>,
    feed: MockFeed,
    events_tx: std::sync::Mutex<Option<broadcast::Sender<Event>>>,
    commands: std::sync::Mutex<Vec<MockCommand>>,
}

impl std::fmt::Debug for MockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDomain")
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

impl MockDomain {
    /// Create a domain answering every command with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&MockCommand) -> MockReply + Send + Sync + 'static,
    {
        let (events_tx, _events_rx) = broadcast::channel(64);
        Self {
            handler: Arc::new(handler),
            feed: MockFeed::default(),
            events_tx: std::sync::Mutex::new(Some(events_tx)),
            commands: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A domain that acknowledges every command with `{}`.
    #[must_use]
    pub fn acknowledging() -> Self {
        Self::new(|_| MockReply::ok())
    }

    /// Publish `events` after each successful reply.
    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.feed = MockFeed::Events(events.into_iter().collect());
        self
    }

    /// Close the event feed after the first successful reply.
    #[must_use]
    pub fn closing_feed(mut self) -> Self {
        self.feed = MockFeed::Close;
        self
    }

    /// Publish one event to current subscribers.
    pub fn publish(&self, event: Event) {
        let guard = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Close the event feed.
    pub fn close(&self) {
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<MockCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_feed(&self) {
        match &self.feed {
            MockFeed::Silent => {}
            MockFeed::Events(events) => {
                for ev in events {
                    self.publish(ev.clone());
                }
            }
            MockFeed::Close => self.close(),
        }
    }
}

impl Domain for MockDomain {
    fn execute(
        &self,
        command: &str,
        args: Value,
        options: CallOptions,
    ) -> impl Future<Output = Result<Value>> + Send {
        let cmd = MockCommand {
            name: command.to_string(),
            args,
        };
        let reply = (self.handler)(&cmd);
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cmd);

        let answer = match reply {
            MockReply::Return(v) => {
                self.apply_feed();
                Some(Ok(v))
            }
            MockReply::Error { class, desc } => Some(Err(Error::rejected(command, class, desc))),
            MockReply::Stall => None,
        };

        async move {
            if let Some(answer) = answer {
                return answer;
            }
            stalled(options).await
        }
    }

    fn events(&self) -> EventStream {
        let guard = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => EventStream::new(tx.subscribe()),
            None => EventStream::closed(),
        }
    }
}

/// Ends a stalled call the way the client does: timeout first, then
/// cancellation, otherwise never.
async fn stalled(options: CallOptions) -> Result<Value> {
    let expired = async {
        match options.timeout {
            Some(t) => {
                tokio::time::sleep(t).await;
                t
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match &options.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        t = expired => Err(Error::Timeout { timeout: t }),
        () = cancelled => Err(Error::Cancelled),
    }
}

/// Build a block job event as the reader loop would deliver it.
#[must_use]
pub fn job_event(name: &str, data: Value) -> Event {
    Event {
        name: name.to_string(),
        data,
        timestamp: None,
    }
}
