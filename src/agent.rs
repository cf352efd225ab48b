//! Supervisory loop.
//!
//! `Agent` owns the transport and runs one background task that reads a line,
//! dispatches it, and writes the response, strictly one request at a time.
//! Transport failures are retried forever: a transient failure waits a short
//! interval, a closed transport waits longer and is reopened. Only `stop()`
//! ends the loop.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::dispatch::Dispatcher;
use crate::error::{AgentError, TransportError};
use crate::transport::Transport;

/// Wait before reopening a transport that reported itself closed.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Wait after a read failure on a transport that is still open.
pub const DEFAULT_TRANSIENT_RETRY: Duration = Duration::from_millis(100);

/// Retry intervals used by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    pub reconnect_delay: Duration,
    pub transient_retry: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            transient_retry: DEFAULT_TRANSIENT_RETRY,
        }
    }
}

/// Lifecycle phase of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    phase: AgentPhase,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// The guest agent engine.
pub struct Agent {
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    timings: LoopTimings,
    lifecycle: Mutex<Lifecycle>,
}

impl Agent {
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        Self {
            transport,
            dispatcher,
            timings: LoopTimings::default(),
            lifecycle: Mutex::new(Lifecycle {
                phase: AgentPhase::Stopped,
                shutdown: None,
                task: None,
            }),
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: LoopTimings) -> Self {
        self.timings = timings;
        self
    }

    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Open the transport and spawn the loop. Returns once the loop is running.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.phase != AgentPhase::Stopped {
            return Err(AgentError::AlreadyRunning);
        }
        lifecycle.phase = AgentPhase::Starting;

        if let Err(e) = self.transport.open().await {
            lifecycle.phase = AgentPhase::Stopped;
            return Err(AgentError::Open(e));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = LoopWorker {
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            timings: self.timings,
            shutdown: shutdown_rx,
        };

        lifecycle.task = Some(tokio::spawn(worker.run()));
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.phase = AgentPhase::Running;
        info!(commands = self.dispatcher.registry().len(), "Agent started");
        Ok(())
    }

    /// Signal the loop, wait for it to exit, then close the transport.
    ///
    /// Idempotent. When this returns no further command is dispatched.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.phase == AgentPhase::Stopped {
            return;
        }
        lifecycle.phase = AgentPhase::Stopping;

        if let Some(shutdown) = lifecycle.shutdown.take() {
            // Err only means the loop already exited.
            let _ = shutdown.send(true);
        }
        if let Some(task) = lifecycle.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Supervisory loop terminated abnormally");
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close transport");
        }

        lifecycle.phase = AgentPhase::Stopped;
        info!("Agent stopped");
    }

    pub async fn phase(&self) -> AgentPhase {
        self.lifecycle.lock().await.phase
    }

    pub async fn is_running(&self) -> bool {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.phase == AgentPhase::Running
            && lifecycle.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// State moved into the loop task.
struct LoopWorker {
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    timings: LoopTimings,
    shutdown: watch::Receiver<bool>,
}

impl LoopWorker {
    async fn run(mut self) {
        info!("Supervisory loop running");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                read = self.transport.read_message() => read,
            };

            match read {
                Ok(line) => self.process(&line).await,
                Err(e) if e.is_idle() => trace!(reason = %e, "No message"),
                Err(e) => {
                    if !self.recover(&e).await {
                        break;
                    }
                }
            }
        }
        info!("Supervisory loop exited");
    }

    async fn process(&self, line: &[u8]) {
        let dispatcher = &self.dispatcher;
        let outbound = match catch_unwind(AssertUnwindSafe(|| dispatcher.handle_line(line))) {
            Ok(outbound) => outbound,
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    request = %String::from_utf8_lossy(line),
                    "Request handling panicked, continuing"
                );
                dispatcher.handle_panic(line)
            }
        };

        if let Err(e) = self
            .transport
            .send_message(&outbound.payload, outbound.delimited)
            .await
        {
            error!(error = %e, "Failed to send response");
        }
    }

    /// Back off after a read failure. Returns `false` if stop was requested
    /// while waiting.
    async fn recover(&mut self, err: &TransportError) -> bool {
        if self.transport.is_open() {
            warn!(error = %err, retry_in = ?self.timings.transient_retry, "Transient read failure");
            return self.pause(self.timings.transient_retry).await;
        }

        warn!(error = %err, reopen_in = ?self.timings.reconnect_delay, "Transport closed");
        if !self.pause(self.timings.reconnect_delay).await {
            return false;
        }
        match self.transport.open().await {
            Ok(()) => info!("Transport reopened"),
            Err(e) => error!(error = %e, "Failed to reopen transport"),
        }
        true
    }

    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CommandDescriptor, Registry};
    use crate::state::AgentState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    enum Step {
        Line(&'static [u8]),
        Transient,
        Closed,
    }

    /// Transport that replays a script and records what the loop does.
    #[derive(Default)]
    struct ScriptedTransport {
        script: std::sync::Mutex<VecDeque<Step>>,
        sent: std::sync::Mutex<Vec<(Vec<u8>, bool)>>,
        reads: std::sync::Mutex<Vec<Instant>>,
        open: AtomicBool,
        open_attempts: AtomicUsize,
        failing_opens: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_script(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            let transport = Self::default();
            transport.script.lock().unwrap().extend(steps);
            Arc::new(transport)
        }

        fn sent(&self) -> Vec<(Vec<u8>, bool)> {
            self.sent.lock().unwrap().clone()
        }

        fn read_times(&self) -> Vec<Instant> {
            self.reads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self) -> Result<(), TransportError> {
            self.open_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_opens.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_opens.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::DeviceUnavailable {
                    message: "scripted failure".into(),
                    source: None,
                });
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
            if !self.is_open() {
                return Err(TransportError::NotOpen);
            }
            self.reads.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Line(line)) => Ok(line.to_vec()),
                Some(Step::Transient) => Err(TransportError::ReadFailure(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "scripted",
                ))),
                Some(Step::Closed) => {
                    self.open.store(false, Ordering::SeqCst);
                    Err(TransportError::ConnectionClosed)
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(TransportError::Timeout)
                }
            }
        }

        async fn send_message(&self, payload: &[u8], delimited: bool) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((payload.to_vec(), delimited));
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let registry = Registry::from_descriptors([
            CommandDescriptor::new("guest-ping", |_| Ok(json!({}))),
            CommandDescriptor::new("guest-sync-delimited", |_| Ok(json!(42))),
            CommandDescriptor::new("guest-echo-id", |args| {
                let value: serde_json::Value = crate::protocol::parse_arguments(args)?;
                Ok(value["n"].clone())
            }),
            CommandDescriptor::new("guest-panic", |_| panic!("handler exploded")),
        ]);
        Dispatcher::new(Arc::new(registry), Arc::new(AgentState::new()))
    }

    fn agent(transport: &Arc<ScriptedTransport>) -> Agent {
        Agent::new(Arc::clone(transport) as Arc<dyn Transport>, dispatcher())
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn answers_requests_in_order() {
        let transport = ScriptedTransport::with_script([
            Step::Line(br#"{"execute":"guest-echo-id","arguments":{"n":1}}"#),
            Step::Line(br#"{"execute":"guest-echo-id","arguments":{"n":2}}"#),
            Step::Line(br#"{"execute":"guest-echo-id","arguments":{"n":3}}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();

        wait_for(|| transport.sent().len() == 3).await;
        let payloads: Vec<_> = transport.sent().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            payloads,
            vec![
                br#"{"return":1}"#.to_vec(),
                br#"{"return":2}"#.to_vec(),
                br#"{"return":3}"#.to_vec(),
            ]
        );
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn framing_follows_command() {
        let transport = ScriptedTransport::with_script([
            Step::Line(br#"{"execute":"guest-sync-delimited"}"#),
            Step::Line(b"not-json"),
            Step::Line(br#"{"execute":"guest-ping"}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();

        wait_for(|| transport.sent().len() == 3).await;
        let sent = transport.sent();
        assert_eq!(sent[0], (br#"{"return":42}"#.to_vec(), true));
        assert_eq!(
            sent[1],
            (
                br#"{"error":{"class":"GenericError","desc":"Invalid message format"}}"#.to_vec(),
                false
            )
        );
        assert_eq!(sent[2], (br#"{"return":{}}"#.to_vec(), false));
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_without_reopening() {
        let transport = ScriptedTransport::with_script([
            Step::Transient,
            Step::Line(br#"{"execute":"guest-ping"}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();

        wait_for(|| transport.sent().len() == 1).await;
        let reads = transport.read_times();
        let gap = reads[1] - reads[0];
        assert!(gap >= DEFAULT_TRANSIENT_RETRY, "retried after {gap:?}");
        assert!(gap < DEFAULT_RECONNECT_DELAY, "retried after {gap:?}");
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 1);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_is_reopened_after_delay() {
        let transport = ScriptedTransport::with_script([
            Step::Closed,
            Step::Line(br#"{"execute":"guest-ping"}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();

        wait_for(|| transport.sent().len() == 1).await;
        let reads = transport.read_times();
        assert!(reads[1] - reads[0] >= DEFAULT_RECONNECT_DELAY);
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 2);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_keeps_retrying() {
        let transport = ScriptedTransport::with_script([
            Step::Closed,
            Step::Line(br#"{"execute":"guest-ping"}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();
        transport.failing_opens.store(2, Ordering::SeqCst);

        wait_for(|| transport.sent().len() == 1).await;
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 4);
        assert!(agent.is_running().await);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_kill_loop() {
        let transport = ScriptedTransport::with_script([
            Step::Line(br#"{"execute":"guest-panic","id":9}"#),
            Step::Line(br#"{"execute":"guest-ping"}"#),
        ]);
        let agent = agent(&transport);
        agent.start().await.unwrap();

        wait_for(|| transport.sent().len() == 2).await;
        let sent = transport.sent();
        let failure: serde_json::Value = serde_json::from_slice(&sent[0].0).unwrap();
        assert_eq!(failure["error"]["class"], "InternalError");
        assert_eq!(failure["id"], 9);
        assert_eq!(sent[1].0, br#"{"return":{}}"#);
        assert!(agent.is_running().await);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_fails() {
        let transport = ScriptedTransport::with_script(Vec::<Step>::new());
        let agent = agent(&transport);
        agent.start().await.unwrap();
        assert!(matches!(agent.start().await, Err(AgentError::AlreadyRunning)));
        assert_eq!(agent.phase().await, AgentPhase::Running);
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_when_transport_cannot_open() {
        let transport = ScriptedTransport::with_script(Vec::<Step>::new());
        transport.failing_opens.store(1, Ordering::SeqCst);
        let agent = agent(&transport);

        assert!(matches!(agent.start().await, Err(AgentError::Open(_))));
        assert_eq!(agent.phase().await, AgentPhase::Stopped);
        agent.start().await.unwrap();
        agent.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_final() {
        let transport = ScriptedTransport::with_script(Vec::<Step>::new());
        let agent = agent(&transport);
        agent.stop().await;

        agent.start().await.unwrap();
        agent.stop().await;
        agent.stop().await;
        assert_eq!(agent.phase().await, AgentPhase::Stopped);
        assert!(!transport.is_open());

        let reads = transport.read_times().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.read_times().len(), reads);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_reconnect_wait_returns_promptly() {
        let transport = ScriptedTransport::with_script([Step::Closed]);
        let agent = agent(&transport);
        agent.start().await.unwrap();
        wait_for(|| !transport.is_open()).await;

        let begun = Instant::now();
        agent.stop().await;
        assert!(begun.elapsed() < DEFAULT_RECONNECT_DELAY);
        assert_eq!(transport.open_attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let text: Box<dyn Any + Send> = Box::new("plain");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(text.as_ref()), "plain");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
