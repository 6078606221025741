//! Process runner - owns one backend inference process.
//!
//! Each runner drives the state machine
//! `stopped -> starting -> ready -> stopping -> stopped`, with `failed` as the
//! observable sink for startup timeouts and unexpected exits. Every transition
//! is published on the event bus after the state has changed, so a subscriber
//! observing `ready` may immediately acquire.

use crate::config::ModelConfig;
use crate::events::{EventBus, ProcessStateChangeEvent};
use crate::logger::RingLogger;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, warn};

/// How long a single readiness probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

/// Poll interval for the readiness and exit-watch loops.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Observable state of a managed backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }

    /// `failed` counts as settled: no process is running.
    pub fn is_settled(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

/// How to terminate a backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGKILL right away
    Immediate,
    /// SIGTERM, escalating to SIGKILL after the stop timeout
    Graceful,
}

/// Errors from a process runner
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{model} failed to start: {reason}")]
    StartFailed { model: String, reason: String },

    #[error("failed to stop {model}: {reason}")]
    StopFailed { model: String, reason: String },
}

/// Send a signal to an entire process group.
#[cfg(unix)]
fn kill_process_group(pid: u32, signal: libc::c_int) {
    // SAFETY: signalling a process group we spawned ourselves.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Strip ANSI escape sequences before log capture. An escape runs from ESC
/// to the first ASCII letter.
fn strip_ansi(line: &str) -> String {
    let mut clean = String::with_capacity(line.len());
    let mut in_escape = false;
    for ch in line.chars() {
        if in_escape {
            in_escape = !ch.is_ascii_alphabetic();
        } else if ch == '\x1b' {
            in_escape = true;
        } else {
            clean.push(ch);
        }
    }
    clean
}

/// Extract `host:port` from an upstream proxy URL for the TCP probe.
fn upstream_authority(proxy: &str) -> Option<String> {
    let uri: hyper::Uri = proxy.trim().parse().ok()?;
    let host = uri.host()?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
    Some(format!("{host}:{port}"))
}

/// One managed backend process.
pub struct ProcessRunner {
    group_id: String,
    model_id: String,
    /// Fingerprint the process was (or will be) started with.
    config: ModelConfig,
    start_timeout: Duration,
    stop_timeout: Duration,
    bus: EventBus,
    upstream_log: RingLogger,
    state_tx: watch::Sender<ProcessState>,
    child: Mutex<Option<Child>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ProcessRunner {
    pub fn new(
        group_id: &str,
        model_id: &str,
        config: ModelConfig,
        start_timeout: Duration,
        stop_timeout: Duration,
        bus: EventBus,
        upstream_log: RingLogger,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Arc::new(Self {
            group_id: group_id.to_string(),
            model_id: model_id.to_string(),
            config,
            start_timeout,
            stop_timeout,
            bus,
            upstream_log,
            state_tx,
            child: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Upstream base URL this runner's process serves on.
    pub fn upstream(&self) -> &str {
        &self.config.proxy
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Unconditional transition; publishes the change after it is visible.
    fn set_state(&self, to: ProcessState) {
        let mut from = to;
        self.state_tx.send_modify(|s| {
            from = *s;
            *s = to;
        });
        if from != to {
            self.publish_transition(from, to);
        }
    }

    /// Transition only when the current state satisfies `from_ok`. Returns
    /// true when this caller won the transition.
    fn transition_if(&self, from_ok: impl Fn(ProcessState) -> bool, to: ProcessState) -> bool {
        let mut from = to;
        let changed = self.state_tx.send_if_modified(|s| {
            if from_ok(*s) {
                from = *s;
                *s = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.publish_transition(from, to);
        }
        changed
    }

    fn publish_transition(&self, from: ProcessState, to: ProcessState) {
        debug!(
            group = %self.group_id,
            model = %self.model_id,
            from = from.as_str(),
            to = to.as_str(),
            "process state change"
        );
        self.bus.publish_process_state(ProcessStateChangeEvent {
            group_id: self.group_id.clone(),
            model_id: self.model_id.clone(),
            from,
            to,
        });
    }

    // -- in-flight reference counting -------------------------------------

    pub fn acquire_ref(&self) {
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("modelswap_model_in_flight", "model" => self.model_id.clone()).set(count as f64);
    }

    pub fn release_ref(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        gauge!("modelswap_model_in_flight", "model" => self.model_id.clone())
            .set(prev.saturating_sub(1) as f64);
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no request holds a ticket on this runner.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release between the check and
            // the await cannot be lost.
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Ensure the backend is ready, starting it if necessary. Blocks until
    /// ready or until the start attempt fails. Cancelling the caller only
    /// abandons the wait; the start task runs to completion on its own.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<(), RunnerError> {
        let mut rx = self.state_tx.subscribe();

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProcessState::Ready => return Ok(()),
                ProcessState::Stopping => {
                    if rx.changed().await.is_err() {
                        return Err(self.start_failed("runner closed"));
                    }
                    continue;
                }
                ProcessState::Stopped | ProcessState::Failed => {
                    if self.transition_if(|s| s.is_settled(), ProcessState::Starting) {
                        let runner = Arc::clone(self);
                        tokio::spawn(async move { runner.run_start().await });
                    }
                    break;
                }
                ProcessState::Starting => break,
            }
        }

        match rx.wait_for(|s| *s != ProcessState::Starting).await {
            Ok(state) if *state == ProcessState::Ready => Ok(()),
            Ok(_) => Err(self.start_failed("process failed to become ready")),
            Err(_) => Err(self.start_failed("runner closed")),
        }
    }

    fn start_failed(&self, reason: &str) -> RunnerError {
        RunnerError::StartFailed {
            model: self.model_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Spawn the configured command and drive it to ready or failed.
    /// Runs detached from the acquiring request.
    async fn run_start(self: Arc<Self>) {
        let started_at = Instant::now();
        counter!("modelswap_process_starts_total", "model" => self.model_id.clone()).increment(1);

        let mut argv = self.config.cmd.split_whitespace();
        let Some(program) = argv.next() else {
            warn!(model = %self.model_id, "refusing to start: empty cmd");
            self.set_state(ProcessState::Failed);
            return;
        };

        debug!(model = %self.model_id, cmd = %self.config.cmd, "starting backend process");

        let mut cmd = Command::new(program);
        cmd.args(argv)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        for pair in &self.config.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(model = %self.model_id, error = %e, "failed to spawn backend");
                self.set_state(ProcessState::Failed);
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_forwarder(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_forwarder(stderr, "stderr");
        }

        *self.child.lock().await = Some(child);

        let deadline = started_at + self.start_timeout;
        loop {
            if self.state() != ProcessState::Starting {
                // A stop raced the startup; make sure nothing lingers.
                self.kill_now().await;
                return;
            }

            if Instant::now() >= deadline {
                warn!(
                    model = %self.model_id,
                    timeout = ?self.start_timeout,
                    "backend did not become ready before the start timeout"
                );
                self.kill_now().await;
                self.set_state(ProcessState::Failed);
                return;
            }

            {
                let mut guard = self.child.lock().await;
                let Some(child) = guard.as_mut() else {
                    // stop() took ownership of the process
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(model = %self.model_id, %status, "backend exited during startup");
                        *guard = None;
                        drop(guard);
                        self.set_state(ProcessState::Failed);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(model = %self.model_id, error = %e, "failed to poll backend status");
                    }
                }
            }

            if self.probe_ready().await {
                histogram!("modelswap_process_start_seconds", "model" => self.model_id.clone())
                    .record(started_at.elapsed().as_secs_f64());
                self.set_state(ProcessState::Ready);
                self.spawn_exit_watch();
                return;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Readiness predicate: the upstream accepts a TCP connection on its
    /// configured proxy address. HTTP-level detection of externally started
    /// backends lives in the reconciler.
    async fn probe_ready(&self) -> bool {
        let Some(addr) = upstream_authority(&self.config.proxy) else {
            return false;
        };
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    fn spawn_output_forwarder(
        &self,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        source: &'static str,
    ) {
        let model = self.model_id.clone();
        let log = self.upstream_log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = strip_ansi(&line);
                debug!(target: "upstream", model = %model, stream = source, "{}", clean);
                log.append(format!("[{model}] {clean}\n").as_bytes());
            }
        });
    }

    /// Watch a ready process for unexpected exits.
    fn spawn_exit_watch(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let mut guard = runner.child.lock().await;
                let Some(child) = guard.as_mut() else {
                    // stop() owns the shutdown path
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        drop(guard);
                        if runner.state() == ProcessState::Ready {
                            warn!(model = %runner.model_id, %status, "backend exited unexpectedly");
                            if status.success() {
                                runner.set_state(ProcessState::Stopped);
                            } else {
                                runner.set_state(ProcessState::Failed);
                            }
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(model = %runner.model_id, error = %e, "exit watch failed");
                        return;
                    }
                }
            }
        });
    }

    /// SIGKILL the process group and reap the child, without a state change.
    async fn kill_now(&self) {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match child.id() {
                #[cfg(unix)]
                Some(pid) => kill_process_group(pid, libc::SIGKILL),
                _ => {
                    let _ = child.start_kill();
                }
            }
            let _ = child.wait().await;
        }
    }

    /// Idempotent stop. A concurrent stop already in progress is awaited
    /// rather than duplicated.
    pub async fn stop(&self, mode: StopMode) -> Result<(), RunnerError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ProcessState::Stopped | ProcessState::Failed => return Ok(()),
                ProcessState::Stopping => {
                    if rx.changed().await.is_err() {
                        return Ok(());
                    }
                }
                ProcessState::Starting | ProcessState::Ready => {
                    if self.transition_if(
                        |s| matches!(s, ProcessState::Starting | ProcessState::Ready),
                        ProcessState::Stopping,
                    ) {
                        break;
                    }
                }
            }
        }

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            // Never spawned, or already reaped by a watcher.
            self.set_state(ProcessState::Stopped);
            return Ok(());
        };

        let pid = child.id();
        let signal_group = |signal: libc::c_int, child: &mut Child| match pid {
            #[cfg(unix)]
            Some(pid) => kill_process_group(pid, signal),
            _ => {
                let _ = child.start_kill();
            }
        };

        match mode {
            StopMode::Immediate => {
                signal_group(libc::SIGKILL, &mut child);
            }
            StopMode::Graceful => {
                signal_group(libc::SIGTERM, &mut child);
                match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                    Ok(Ok(_)) => {
                        self.set_state(ProcessState::Stopped);
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        self.set_state(ProcessState::Stopped);
                        return Err(RunnerError::StopFailed {
                            model: self.model_id.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(_) => {
                        warn!(
                            model = %self.model_id,
                            timeout = ?self.stop_timeout,
                            "graceful stop timed out, escalating to SIGKILL"
                        );
                        signal_group(libc::SIGKILL, &mut child);
                    }
                }
            }
        }

        let result = child.wait().await;
        self.set_state(ProcessState::Stopped);
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(RunnerError::StopFailed {
                model: self.model_id.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    async fn fake_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        format!("http://{addr}")
    }

    fn make_runner(cmd: &str, proxy: &str, bus: EventBus) -> Arc<ProcessRunner> {
        ProcessRunner::new(
            "g1",
            "m1",
            ModelConfig {
                cmd: cmd.to_string(),
                proxy: proxy.to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
            Duration::from_secs(2),
            bus,
            RingLogger::new(),
        )
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    }

    #[test]
    fn test_upstream_authority() {
        assert_eq!(
            upstream_authority("http://127.0.0.1:8001"),
            Some("127.0.0.1:8001".to_string())
        );
        assert_eq!(
            upstream_authority("http://localhost"),
            Some("localhost:80".to_string())
        );
        assert_eq!(upstream_authority("not a url"), None);
    }

    #[tokio::test]
    async fn test_start_reaches_ready_and_stop_reaches_stopped() {
        let proxy = fake_upstream().await;
        let bus = EventBus::new();

        let transitions: Arc<StdMutex<Vec<(ProcessState, ProcessState)>>> = Arc::default();
        let transitions_clone = Arc::clone(&transitions);
        let _sub = bus.on_process_state(move |e| {
            transitions_clone.lock().unwrap().push((e.from, e.to));
        });

        let runner = make_runner("sleep 30", &proxy, bus);
        runner.ensure_ready().await.unwrap();
        assert_eq!(runner.state(), ProcessState::Ready);

        runner.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(runner.state(), ProcessState::Stopped);

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ProcessState::Stopped, ProcessState::Starting),
                (ProcessState::Starting, ProcessState::Ready),
                (ProcessState::Ready, ProcessState::Stopping),
                (ProcessState::Stopping, ProcessState::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn test_crashing_command_ends_failed() {
        // Unreachable proxy so readiness can never win the race with the exit.
        let runner = make_runner("false", "http://127.0.0.1:1", EventBus::new());
        let err = runner.ensure_ready().await.unwrap_err();
        assert!(matches!(err, RunnerError::StartFailed { .. }));
        assert_eq!(runner.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_failed_runner_restarts_on_next_ensure_ready() {
        let bus = EventBus::new();
        let transitions: Arc<StdMutex<Vec<(ProcessState, ProcessState)>>> = Arc::default();
        let transitions_clone = Arc::clone(&transitions);
        let _sub = bus.on_process_state(move |e| {
            transitions_clone.lock().unwrap().push((e.from, e.to));
        });

        let runner = make_runner("false", "http://127.0.0.1:1", bus);
        assert!(runner.ensure_ready().await.is_err());
        assert_eq!(runner.state(), ProcessState::Failed);

        // Still failing, but the attempt must go through starting again.
        assert!(runner.ensure_ready().await.is_err());
        let seen = transitions.lock().unwrap().clone();
        assert!(
            seen.contains(&(ProcessState::Failed, ProcessState::Starting)),
            "transitions: {seen:?}"
        );
    }

    #[tokio::test]
    async fn test_start_timeout_fails_runner() {
        let bus = EventBus::new();
        let runner = ProcessRunner::new(
            "g1",
            "m1",
            ModelConfig {
                cmd: "sleep 30".to_string(),
                proxy: "http://127.0.0.1:1".to_string(),
                ..Default::default()
            },
            Duration::from_millis(300),
            Duration::from_secs(2),
            bus,
            RingLogger::new(),
        );

        let err = runner.ensure_ready().await.unwrap_err();
        assert!(matches!(err, RunnerError::StartFailed { .. }));
        assert_eq!(runner.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runner = make_runner("sleep 30", "http://127.0.0.1:1", EventBus::new());
        assert_eq!(runner.state(), ProcessState::Stopped);
        runner.stop(StopMode::Immediate).await.unwrap();
        runner.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(runner.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_drained_blocks_until_refs_released() {
        let runner = make_runner("sleep 30", "http://127.0.0.1:1", EventBus::new());
        runner.acquire_ref();
        runner.acquire_ref();

        let waiter = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.wait_drained().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        runner.release_ref();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        runner.release_ref();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_output_forwarded_to_upstream_log() {
        let proxy = fake_upstream().await;
        let log = RingLogger::new();
        let runner = ProcessRunner::new(
            "g1",
            "echo-model",
            ModelConfig {
                cmd: "echo backend-banner".to_string(),
                proxy: proxy.clone(),
                ..Default::default()
            },
            Duration::from_secs(5),
            Duration::from_secs(2),
            EventBus::new(),
            log.clone(),
        );

        // echo exits immediately; ready/failed either way is fine, we only
        // care that the output landed in the tail.
        let _ = runner.ensure_ready().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let history = String::from_utf8(log.get_history()).unwrap();
        assert!(history.contains("backend-banner"), "history: {history}");
    }
}
