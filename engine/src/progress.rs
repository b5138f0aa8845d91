// engine/src/progress.rs
//!
//! Progress Channel: a push subscription, keyed by session id, that delivers
//! live stage progress independently of the stage request/response calls.
//!
//! Each subscription runs a supervisor thread that owns the reconnect loop and
//! a reader thread per connection. Readers forward events over one mpsc
//! channel tagged with their connection generation, so frames from an
//! abandoned connection are dropped instead of being delivered twice. The
//! supervisor waits on that channel with the keepalive timeout: silence for
//! longer than the timeout counts as a stall and reconnects immediately,
//! while a dropped stream or a failed connect waits the fixed reconnect delay
//! first. Any event from the live connection resets the attempt counter.

use crate::api::check_status;
use crate::pipeline::Stage;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        stage: Stage,
        percent: f64,
        label: String,
    },
    Cancelled,
    Keepalive,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default, alias = "progress")]
    percent: Option<f64>,
    #[serde(default, alias = "message")]
    label: Option<String>,
}

impl ProgressEvent {
    /// Decode one JSON message pushed by the backend.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let raw: RawEvent = serde_json::from_str(text).map_err(|err| err.to_string())?;
        match raw.kind.as_deref().map(str::to_lowercase).as_deref() {
            Some("cancelled") | Some("canceled") | Some("cancel") => Ok(ProgressEvent::Cancelled),
            Some("keepalive") | Some("ping") | Some("heartbeat") => Ok(ProgressEvent::Keepalive),
            Some("progress") | None => {
                let name = raw.stage.ok_or("progress event without stage")?;
                let stage = name.parse::<Stage>()?;
                Ok(ProgressEvent::Progress {
                    stage,
                    percent: raw.percent.unwrap_or(0.0).clamp(0.0, 100.0),
                    label: raw.label.unwrap_or_default(),
                })
            }
            Some(other) => Err(format!("unknown event type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed after the first connection before giving up.
    pub max_attempts: u32,
    pub delay: Duration,
    /// Longest silence tolerated before the connection counts as stalled.
    pub keepalive_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
            keepalive_timeout: Duration::from_secs(45),
        }
    }
}

/// Why a subscription gave up. Handed to `on_disconnect`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("no progress received within the keepalive window after {attempts} reconnect attempts")]
    Stalled { attempts: u32 },
    #[error("progress stream unavailable: {0}")]
    Transport(String),
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Stalled { attempts } => Error::ChannelStalled { attempts },
            ChannelError::Transport(message) => Error::Transport(message),
        }
    }
}

/// One open connection. `Ok(None)` means the server closed the stream.
pub trait ProgressStream: Send {
    fn next_event(&mut self) -> Result<Option<ProgressEvent>, String>;
}

pub trait ProgressSource: Send + Sync {
    fn connect(&self, session_id: &str) -> Result<Box<dyn ProgressStream>, String>;
}

enum Signal {
    Frame { generation: u64, event: ProgressEvent },
    Closed { generation: u64, reason: String },
    Stop,
}

enum Outcome {
    Stalled,
    Dropped(String),
}

type EventCallback = Box<dyn FnMut(ProgressEvent) + Send>;
type DisconnectCallback = Box<dyn FnOnce(ChannelError) + Send>;

pub struct ProgressChannel {
    source: Arc<dyn ProgressSource>,
    policy: ReconnectPolicy,
}

impl ProgressChannel {
    pub fn new(source: Arc<dyn ProgressSource>, policy: ReconnectPolicy) -> Self {
        Self { source, policy }
    }

    /// Open a subscription for `session_id`. `on_event` runs on the
    /// subscription's own thread, once per event, in arrival order.
    /// `on_disconnect` fires at most once, when the reconnect ceiling is
    /// exhausted, and never after `unsubscribe`.
    pub fn subscribe<F, D>(
        &self,
        session_id: &str,
        on_event: F,
        on_disconnect: D,
    ) -> crate::Result<Subscription>
    where
        F: FnMut(ProgressEvent) + Send + 'static,
        D: FnOnce(ChannelError) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let supervisor = Supervisor {
            source: Arc::clone(&self.source),
            session_id: session_id.to_string(),
            policy: self.policy,
            tx: tx.clone(),
            stopped: Arc::clone(&stopped),
            generation: Arc::new(AtomicU64::new(0)),
            on_event: Box::new(on_event),
            on_disconnect: Some(Box::new(on_disconnect)),
        };
        let handle = thread::Builder::new()
            .name(format!("progress-{session_id}"))
            .spawn(move || supervisor.run(rx))?;

        debug!(session = %session_id, "progress subscription opened");
        Ok(Subscription {
            session_id: session_id.to_string(),
            stopped,
            stop_tx: Mutex::new(tx),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }
}

pub struct Subscription {
    session_id: String,
    stopped: Arc<AtomicBool>,
    stop_tx: Mutex<Sender<Signal>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Stop delivery and any pending reconnect. Safe to call repeatedly and
    /// from inside the event callback.
    pub fn unsubscribe(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .stop_tx
            .lock()
            .expect("subscription sender poisoned")
            .send(Signal::Stop);
        debug!(session = %self.session_id, "progress subscription closed");
    }

    /// True while the supervisor thread is still running.
    pub fn is_active(&self) -> bool {
        self.handle
            .lock()
            .expect("subscription handle poisoned")
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the supervisor to exit. Only returns once the subscription
    /// was closed or gave up.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .expect("subscription handle poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Supervisor {
    source: Arc<dyn ProgressSource>,
    session_id: String,
    policy: ReconnectPolicy,
    tx: Sender<Signal>,
    stopped: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    on_event: EventCallback,
    on_disconnect: Option<DisconnectCallback>,
}

impl Supervisor {
    fn run(mut self, rx: mpsc::Receiver<Signal>) {
        let mut failures: u32 = 0;

        loop {
            if self.is_stopped() {
                return;
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = match self.source.connect(&self.session_id) {
                Ok(stream) => {
                    if let Err(err) = self.spawn_reader(stream, generation) {
                        Outcome::Dropped(err.to_string())
                    } else {
                        match self.pump(&rx, generation, &mut failures) {
                            Some(outcome) => outcome,
                            None => return,
                        }
                    }
                }
                Err(message) => Outcome::Dropped(message),
            };

            if self.is_stopped() {
                return;
            }

            failures += 1;
            if failures > self.policy.max_attempts {
                self.give_up(outcome);
                return;
            }

            match outcome {
                Outcome::Stalled => {
                    warn!(
                        session = %self.session_id,
                        attempt = failures,
                        "progress stream stalled; reconnecting"
                    );
                }
                Outcome::Dropped(reason) => {
                    warn!(
                        session = %self.session_id,
                        attempt = failures,
                        %reason,
                        "progress stream dropped; reconnecting after delay"
                    );
                    if !self.wait(&rx, self.policy.delay) {
                        return;
                    }
                }
            }
        }
    }

    /// Deliver frames from connection `generation` until it stalls or drops.
    /// `None` means the subscription was stopped.
    fn pump(
        &mut self,
        rx: &mpsc::Receiver<Signal>,
        generation: u64,
        failures: &mut u32,
    ) -> Option<Outcome> {
        loop {
            match rx.recv_timeout(self.policy.keepalive_timeout) {
                Ok(Signal::Stop) => return None,
                Ok(Signal::Frame {
                    generation: from,
                    event,
                }) if from == generation => {
                    *failures = 0;
                    if self.is_stopped() {
                        return None;
                    }
                    (self.on_event)(event);
                }
                Ok(Signal::Closed {
                    generation: from,
                    reason,
                }) if from == generation => return Some(Outcome::Dropped(reason)),
                // Leftovers from an abandoned connection.
                Ok(Signal::Frame { .. }) | Ok(Signal::Closed { .. }) => {}
                Err(RecvTimeoutError::Timeout) => return Some(Outcome::Stalled),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Sleep for `delay` unless stopped first. Returns false when stopped.
    fn wait(&self, rx: &mpsc::Receiver<Signal>, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return !self.is_stopped();
            }
            match rx.recv_timeout(remaining) {
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return !self.is_stopped(),
            }
        }
    }

    fn give_up(&mut self, outcome: Outcome) {
        let error = match outcome {
            Outcome::Stalled => ChannelError::Stalled {
                attempts: self.policy.max_attempts,
            },
            Outcome::Dropped(reason) => ChannelError::Transport(reason),
        };
        info!(session = %self.session_id, error = %error, "progress channel giving up");
        if let Some(on_disconnect) = self.on_disconnect.take() {
            on_disconnect(error);
        }
    }

    fn spawn_reader(
        &self,
        mut stream: Box<dyn ProgressStream>,
        generation: u64,
    ) -> std::io::Result<()> {
        let tx = self.tx.clone();
        let current = Arc::clone(&self.generation);
        let stopped = Arc::clone(&self.stopped);
        thread::Builder::new()
            .name(format!("progress-reader-{}-{generation}", self.session_id))
            .spawn(move || loop {
                let signal = match stream.next_event() {
                    Ok(Some(event)) => Signal::Frame { generation, event },
                    Ok(None) => Signal::Closed {
                        generation,
                        reason: "stream closed by server".to_string(),
                    },
                    Err(reason) => Signal::Closed { generation, reason },
                };
                let last = matches!(signal, Signal::Closed { .. });
                if tx.send(signal).is_err()
                    || last
                    || stopped.load(Ordering::SeqCst)
                    || current.load(Ordering::SeqCst) != generation
                {
                    return;
                }
            })?;
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// ============================================================================
// HTTP streaming source
// ============================================================================

/// Reads `GET {base}/api/progress/{session}` as server-sent events. Bare
/// newline-delimited JSON is accepted too, and SSE comment lines count as
/// keepalives.
pub struct HttpProgressSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpProgressSource {
    /// `read_timeout` bounds how long an abandoned reader can linger; keep it
    /// above the keepalive timeout.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn for_policy(base_url: impl Into<String>, policy: &ReconnectPolicy) -> Self {
        Self::new(base_url, Duration::from_secs(10), policy.keepalive_timeout * 2)
    }
}

impl ProgressSource for HttpProgressSource {
    fn connect(&self, session_id: &str) -> Result<Box<dyn ProgressStream>, String> {
        let url = format!("{}/api/progress/{}", self.base_url, session_id);
        let response = check_status(
            self.agent
                .get(&url)
                .set("Accept", "text/event-stream")
                .call(),
        )
        .map_err(|err| err.to_string())?;
        debug!(%url, "progress stream connected");
        Ok(Box::new(SseStream {
            reader: BufReader::new(response.into_reader()),
            parser: SseParser::default(),
        }))
    }
}

struct SseStream {
    reader: BufReader<Box<dyn Read + Send + Sync + 'static>>,
    parser: SseParser,
}

impl ProgressStream for SseStream {
    fn next_event(&mut self) -> Result<Option<ProgressEvent>, String> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|err| err.to_string())?;
            if read == 0 {
                return Ok(None);
            }
            match self.parser.feed_line(line.trim_end_matches(['\r', '\n'])) {
                Some(Ok(event)) => return Ok(Some(event)),
                Some(Err(reason)) => debug!(%reason, "skipping malformed progress message"),
                None => {}
            }
        }
    }
}

/// Line-oriented SSE decoder. Multi-line `data:` fields are joined with
/// newlines and dispatched on the blank line that ends the message.
#[derive(Debug, Default)]
pub struct SseParser {
    data: Vec<String>,
}

impl SseParser {
    pub fn feed_line(&mut self, line: &str) -> Option<Result<ProgressEvent, String>> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(ProgressEvent::from_json(&payload));
        }
        if line.starts_with(':') {
            return Some(Ok(ProgressEvent::Keepalive));
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            return None;
        }
        if line.starts_with('{') && self.data.is_empty() {
            return Some(ProgressEvent::from_json(line));
        }
        // event:, id:, retry: and unknown fields carry nothing we use.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::Receiver;

    /// What a scripted connection does once its events run out.
    #[derive(Clone)]
    enum End {
        Hang,
        Fail(&'static str),
    }

    struct ScriptedStream {
        events: VecDeque<ProgressEvent>,
        end: End,
        hang: Option<Receiver<()>>,
    }

    impl ProgressStream for ScriptedStream {
        fn next_event(&mut self) -> Result<Option<ProgressEvent>, String> {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            match &self.end {
                End::Fail(reason) => Err(reason.to_string()),
                End::Hang => {
                    // Blocks until the source (and its senders) is dropped.
                    if let Some(hang) = self.hang.take() {
                        let _ = hang.recv();
                    }
                    Ok(None)
                }
            }
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Result<(Vec<ProgressEvent>, End), String>>>,
        connects: AtomicUsize,
        hangs: Mutex<Vec<Sender<()>>>,
    }

    impl ScriptedSource {
        fn with(scripts: Vec<Result<(Vec<ProgressEvent>, End), String>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl ProgressSource for ScriptedSource {
        fn connect(&self, _session_id: &str) -> Result<Box<dyn ProgressStream>, String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok((Vec::new(), End::Hang)));
            let (events, end) = script?;
            let (hang_tx, hang_rx) = mpsc::channel();
            self.hangs.lock().unwrap().push(hang_tx);
            Ok(Box::new(ScriptedStream {
                events: events.into(),
                end,
                hang: Some(hang_rx),
            }))
        }
    }

    fn progress(stage: Stage, percent: f64) -> ProgressEvent {
        ProgressEvent::Progress {
            stage,
            percent,
            label: format!("{stage} {percent}"),
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            delay: Duration::from_millis(10),
            keepalive_timeout: Duration::from_millis(60),
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn collector() -> (Arc<Mutex<Vec<ProgressEvent>>>, impl FnMut(ProgressEvent) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event| sink.lock().unwrap().push(event))
    }

    #[test]
    fn events_arrive_once_in_emission_order() {
        let source = ScriptedSource::with(vec![Ok((
            vec![
                progress(Stage::Parser, 10.0),
                ProgressEvent::Keepalive,
                progress(Stage::Parser, 55.0),
                progress(Stage::Parser, 100.0),
            ],
            End::Hang,
        ))]);
        let channel = ProgressChannel::new(source.clone(), ReconnectPolicy {
            keepalive_timeout: Duration::from_secs(5),
            ..fast_policy(3)
        });
        let (seen, on_event) = collector();

        let sub = channel.subscribe("run-1", on_event, |_| {}).unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 4));
        channel.unsubscribe(&sub);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], progress(Stage::Parser, 10.0));
        assert_eq!(seen[1], ProgressEvent::Keepalive);
        assert_eq!(seen[3], progress(Stage::Parser, 100.0));
        assert_eq!(source.connects(), 1);
    }

    #[test]
    fn dropped_stream_reconnects_without_replay() {
        let source = ScriptedSource::with(vec![
            Ok((vec![progress(Stage::Parser, 20.0)], End::Fail("connection reset"))),
            Ok((vec![progress(Stage::Parser, 80.0)], End::Hang)),
        ]);
        let channel = ProgressChannel::new(source.clone(), ReconnectPolicy {
            keepalive_timeout: Duration::from_secs(5),
            ..fast_policy(3)
        });
        let (seen, on_event) = collector();
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);

        let sub = channel
            .subscribe("run-2", on_event, move |_| flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 2));
        sub.unsubscribe();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![progress(Stage::Parser, 20.0), progress(Stage::Parser, 80.0)]
        );
        assert_eq!(source.connects(), 2);
        assert!(!disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn silent_stream_reconnects_then_disconnects_exactly_once() {
        // Every connection stays open but never says anything.
        let source = ScriptedSource::with(Vec::new());
        let channel = ProgressChannel::new(source.clone(), fast_policy(2));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&calls);

        let sub = channel
            .subscribe("run-3", |_| {}, move |err| record.lock().unwrap().push(err))
            .unwrap();
        sub.join();

        assert_eq!(source.connects(), 3, "initial connection plus two reconnects");
        assert_eq!(
            *calls.lock().unwrap(),
            vec![ChannelError::Stalled { attempts: 2 }]
        );
        assert!(!sub.is_active());
    }

    /// Sends nothing but keepalives, one per `every`, until `stop` is set.
    struct KeepaliveSource {
        every: Duration,
        stop: Arc<AtomicBool>,
        connects: AtomicUsize,
    }

    struct KeepaliveStream {
        every: Duration,
        stop: Arc<AtomicBool>,
    }

    impl ProgressStream for KeepaliveStream {
        fn next_event(&mut self) -> Result<Option<ProgressEvent>, String> {
            thread::sleep(self.every);
            if self.stop.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(ProgressEvent::Keepalive))
        }
    }

    impl ProgressSource for KeepaliveSource {
        fn connect(&self, _session_id: &str) -> Result<Box<dyn ProgressStream>, String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(KeepaliveStream {
                every: self.every,
                stop: Arc::clone(&self.stop),
            }))
        }
    }

    #[test]
    fn keepalives_alone_hold_the_connection_open() {
        let stop = Arc::new(AtomicBool::new(false));
        let source = Arc::new(KeepaliveSource {
            every: Duration::from_millis(20),
            stop: Arc::clone(&stop),
            connects: AtomicUsize::new(0),
        });
        let channel = ProgressChannel::new(source.clone(), ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
            keepalive_timeout: Duration::from_millis(100),
        });
        let (seen, on_event) = collector();
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);

        let sub = channel
            .subscribe("run-keepalive", on_event, move |_| flag.store(true, Ordering::SeqCst))
            .unwrap();
        // 30 keepalives span six stall windows.
        assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 30));

        assert_eq!(source.connects.load(Ordering::SeqCst), 1);
        assert!(!disconnected.load(Ordering::SeqCst));
        assert!(sub.is_active());
        sub.unsubscribe();
        stop.store(true, Ordering::SeqCst);
        sub.join();
        assert!(!disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn events_reset_the_attempt_counter() {
        // Each connection delivers one event and then drops. With a ceiling of
        // one reconnect the subscription only survives because events reset it.
        let mut scripts = Vec::new();
        for i in 0..4 {
            scripts.push(Ok((vec![progress(Stage::Reasoner, i as f64)], End::Fail("reset"))));
        }
        scripts.push(Err("refused".to_string()));
        let source = ScriptedSource::with(scripts);
        let channel = ProgressChannel::new(source.clone(), fast_policy(1));
        let (seen, on_event) = collector();
        let calls = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&calls);

        let sub = channel
            .subscribe("run-4", on_event, move |err| {
                assert_eq!(err, ChannelError::Transport("refused".into()));
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sub.join();

        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(source.connects(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_cancels_pending_reconnect() {
        let source = ScriptedSource::with(vec![Err("refused".to_string())]);
        let channel = ProgressChannel::new(source.clone(), ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(30),
        });
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);
        let sub = channel
            .subscribe("run-5", |_| {}, move |_| flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || source.connects() == 1));

        let started = Instant::now();
        sub.unsubscribe();
        sub.unsubscribe();
        channel.unsubscribe(&sub);
        sub.join();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(source.connects(), 1);
        assert!(!disconnected.load(Ordering::SeqCst));
        assert!(!sub.is_active());
    }

    #[test]
    fn parses_backend_messages() {
        assert_eq!(
            ProgressEvent::from_json(r#"{"stage": "reason", "percent": 40, "label": "Checking"}"#),
            Ok(ProgressEvent::Progress {
                stage: Stage::Reasoner,
                percent: 40.0,
                label: "Checking".into()
            })
        );
        assert_eq!(
            ProgressEvent::from_json(r#"{"type": "cancelled"}"#),
            Ok(ProgressEvent::Cancelled)
        );
        assert_eq!(
            ProgressEvent::from_json(r#"{"type": "keepalive"}"#),
            Ok(ProgressEvent::Keepalive)
        );
        assert!(ProgressEvent::from_json(r#"{"stage": "render"}"#).is_err());
        assert!(ProgressEvent::from_json("not json").is_err());
    }

    #[test]
    fn sse_parser_handles_data_comments_and_bare_json() {
        let mut parser = SseParser::default();
        assert_eq!(parser.feed_line("event: progress"), None);
        assert_eq!(parser.feed_line(r#"data: {"stage": "parser","#), None);
        assert_eq!(parser.feed_line(r#"data: "percent": 5}"#), None);
        assert_eq!(
            parser.feed_line(""),
            Some(Ok(progress_with_label(Stage::Parser, 5.0, "")))
        );
        assert_eq!(parser.feed_line(": ping"), Some(Ok(ProgressEvent::Keepalive)));
        assert_eq!(
            parser.feed_line(r#"{"type": "cancelled"}"#),
            Some(Ok(ProgressEvent::Cancelled))
        );
        assert_eq!(parser.feed_line(""), None);
    }

    fn progress_with_label(stage: Stage, percent: f64, label: &str) -> ProgressEvent {
        ProgressEvent::Progress {
            stage,
            percent,
            label: label.into(),
        }
    }

    #[test]
    fn http_source_streams_server_sent_events() {
        use std::io::Write;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let n = stream.read(&mut request).unwrap();
            let head = String::from_utf8_lossy(&request[..n]).to_string();
            let body = "retry: 1000\n\n: keepalive\n\ndata: {\"stage\": \"generator\", \"percent\": 50, \"label\": \"Drafting\"}\n\ndata: {\"type\": \"cancelled\"}\n\n";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            head
        });

        let source = HttpProgressSource::new(
            format!("http://{addr}"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let mut stream = source.connect("run-42").unwrap();
        assert_eq!(stream.next_event(), Ok(Some(ProgressEvent::Keepalive)));
        assert_eq!(
            stream.next_event(),
            Ok(Some(progress_with_label(Stage::Generator, 50.0, "Drafting")))
        );
        assert_eq!(stream.next_event(), Ok(Some(ProgressEvent::Cancelled)));
        assert_eq!(stream.next_event(), Ok(None));

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /api/progress/run-42"));
    }
}
