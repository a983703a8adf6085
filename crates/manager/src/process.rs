//! Process supervision for inference backends
//!
//! A backend runs in its own process group so that one signal reaches the
//! backend and every child it forks. [`Supervisor`] combines a [`Launcher`]
//! with a [`HealthProbe`] and owns the startup and termination policies; both
//! seams are traits so the registry can run against fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use voice_insight_common::{BackendCommand, ManagerError, Result};

/// Lines of backend output kept for startup failure reports
const OUTPUT_TAIL_LINES: usize = 200;

/// Time allowed for output readers to hit EOF once a process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to start one backend process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub alias: String,
    pub port: u16,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Launch spec for a worker following the backend argument contract
    pub fn for_worker(command: &BackendCommand, alias: &str, model_path: &str, port: u16) -> Self {
        let mut args = command.args.clone();
        args.extend([
            "--alias".to_string(),
            alias.to_string(),
            "--model_path".to_string(),
            model_path.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);

        Self {
            alias: alias.to_string(),
            port,
            program: command.program.clone(),
            args,
            env: command.env.clone(),
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exited with code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Stop signals, independent of any platform signal API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the group to shut down (SIGTERM on unix)
    Graceful,

    /// Kill the group (SIGKILL on unix)
    Forceful,
}

/// Exclusive handle to a running backend's process group
#[async_trait]
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check. `Some` once the process has exited.
    fn poll(&mut self) -> Option<ProcessExit>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Signal the whole process group. A no-op once the process has exited.
    fn signal(&mut self, signal: StopSignal) -> Result<()>;

    /// Combined stdout/stderr tail captured so far
    async fn captured_output(&mut self) -> String;
}

/// Starts backend processes
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Answers whether a backend health endpoint reports ready
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, url: &str) -> bool;
}

/// Why a health gate did not pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFailure {
    /// The process exited before answering a health check
    Exited { exit: ProcessExit, output: String },

    /// No healthy answer within the startup timeout
    TimedOut { waited: Duration },
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateFailure::Exited { exit, .. } => write!(f, "process {} before becoming healthy", exit),
            GateFailure::TimedOut { waited } => {
                write!(f, "no healthy response within {:.1}s", waited.as_secs_f64())
            }
        }
    }
}

/// Launch, health-gate and terminate policy for backend processes
#[derive(Clone)]
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
    poll_interval: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn HealthProbe>,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            launcher,
            probe,
            poll_interval,
            grace,
        }
    }

    /// Start a backend process
    pub fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        debug!(
            alias = %spec.alias,
            port = spec.port,
            "Launching {} {}",
            spec.program,
            spec.args.join(" ")
        );
        let handle = self.launcher.launch(spec)?;
        info!(alias = %spec.alias, port = spec.port, pid = ?handle.pid(), "Worker process launched");
        Ok(handle)
    }

    /// Poll `health_url` until it answers healthy or `startup_timeout`
    /// elapses. Liveness is checked before every probe so a crashed process
    /// fails the gate immediately.
    pub async fn health_gate(
        &self,
        handle: &mut dyn ProcessHandle,
        health_url: &str,
        startup_timeout: Duration,
    ) -> std::result::Result<Duration, GateFailure> {
        let started = Instant::now();
        // A timeout past the clock's range never expires
        let deadline = started.checked_add(startup_timeout);

        loop {
            if let Some(exit) = handle.poll() {
                let output = handle.captured_output().await;
                return Err(GateFailure::Exited { exit, output });
            }

            let healthy = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GateFailure::TimedOut {
                            waited: now - started,
                        });
                    }
                    let probe = timeout(deadline - now, self.probe.is_healthy(health_url));
                    matches!(probe.await, Ok(true))
                }
                None => self.probe.is_healthy(health_url).await,
            };
            if healthy {
                return Ok(started.elapsed());
            }

            let pause = match deadline {
                Some(deadline) => self
                    .poll_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.poll_interval,
            };
            sleep(pause).await;
        }
    }

    /// Gracefully stop the process group, escalating to a forceful kill after
    /// the grace period. Terminating an exited process is a no-op.
    pub async fn terminate(&self, handle: &mut dyn ProcessHandle) -> Result<()> {
        if let Some(exit) = handle.poll() {
            debug!(pid = ?handle.pid(), "Process already {}", exit);
            return Ok(());
        }

        handle.signal(StopSignal::Graceful)?;

        match timeout(self.grace, handle.wait()).await {
            Ok(exit) => {
                let exit = exit?;
                debug!(pid = ?handle.pid(), "Process {}", exit);
                Ok(())
            }
            Err(_) => {
                warn!(
                    pid = ?handle.pid(),
                    "Process still alive {:?} after graceful stop, killing",
                    self.grace
                );
                handle.signal(StopSignal::Forceful)?;
                handle.wait().await?;
                Ok(())
            }
        }
    }
}

/// Bounded tail of process output lines
#[derive(Debug)]
struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Launcher for real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New group led by the child, so pgid == pid
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            ManagerError::startup_failure(
                &spec.alias,
                format!("failed to launch {}: {}", spec.program, e),
                "",
            )
        })?;

        let output = Arc::new(Mutex::new(OutputTail::new(OUTPUT_TAIL_LINES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(stdout, spec.alias.clone(), output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(stderr, spec.alias.clone(), output.clone()));
        }

        Ok(Box::new(OsProcess {
            pid: child.id(),
            child,
            output,
            readers,
            exit: None,
        }))
    }
}

fn spawn_output_reader<R>(reader: R, alias: String, tail: Arc<Mutex<OutputTail>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(alias = %alias, "{}", line);
                    tail.lock().push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(alias = %alias, "Stopped reading worker output: {}", e);
                    break;
                }
            }
        }
    })
}

/// A backend process group started by [`OsLauncher`]
#[derive(Debug)]
pub struct OsProcess {
    pid: Option<u32>,
    child: Child,
    output: Arc<Mutex<OutputTail>>,
    readers: Vec<JoinHandle<()>>,
    exit: Option<ProcessExit>,
}

#[async_trait]
impl ProcessHandle for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> Option<ProcessExit> {
        if self.exit.is_some() {
            return self.exit;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status.into());
                self.exit
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = ?self.pid, "Failed to poll process: {}", e);
                None
            }
        }
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let exit = ProcessExit::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }

    fn signal(&mut self, signal: StopSignal) -> Result<()> {
        // Until the child is reaped its pid cannot be reused, so the group id
        // stays ours
        if self.poll().is_some() {
            return Ok(());
        }

        signal_group(&mut self.child, self.pid, signal)
    }

    async fn captured_output(&mut self) -> String {
        for reader in self.readers.drain(..) {
            if timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(pid = ?self.pid, "Worker output still open, reporting partial output");
            }
        }
        self.output.lock().joined()
    }
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, signal: StopSignal) -> Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    let signo = match signal {
        StopSignal::Graceful => libc::SIGTERM,
        StopSignal::Forceful => libc::SIGKILL,
    };

    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: StopSignal) -> Result<()> {
    // No process groups here; both signals kill the direct child
    child.start_kill()?;
    Ok(())
}

/// Health probe issuing `GET <url>` and accepting HTTP 200
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ManagerError::internal(format!("Failed to build health probe client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_healthy(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct FixedProbe(bool);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn is_healthy(&self, _url: &str) -> bool {
            self.0
        }
    }

    fn supervisor(healthy: bool, grace: Duration) -> Supervisor {
        Supervisor::new(
            Arc::new(OsLauncher),
            Arc::new(FixedProbe(healthy)),
            Duration::from_millis(50),
            grace,
        )
    }

    fn shell(alias: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            alias: alias.to_string(),
            port: 0,
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_launch_spec_appends_worker_arguments() {
        let command = BackendCommand {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "src.workers.stt_worker".to_string()],
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
        };

        let spec = LaunchSpec::for_worker(&command, "stt-fast", "mlx-community/whisper", 8211);

        assert_eq!(
            spec.args,
            vec![
                "-m",
                "src.workers.stt_worker",
                "--alias",
                "stt-fast",
                "--model_path",
                "mlx-community/whisper",
                "--port",
                "8211"
            ]
        );
        assert_eq!(spec.env["PYTHONUNBUFFERED"], "1");
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let mut tail = OutputTail::new(2);
        tail.push("one".to_string());
        tail.push("two".to_string());
        tail.push("three".to_string());

        assert_eq!(tail.joined(), "two\nthree");
    }

    #[tokio::test]
    async fn test_health_gate_fails_fast_on_early_exit() {
        let supervisor = supervisor(false, Duration::from_secs(1));
        let mut handle = supervisor
            .launch(&shell("crasher", "echo loading; echo boom >&2; exit 3"))
            .unwrap();

        let started = std::time::Instant::now();
        let result = supervisor
            .health_gate(handle.as_mut(), "http://127.0.0.1:1/health", Duration::from_secs(30))
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match result {
            Err(GateFailure::Exited { exit, output }) => {
                assert_eq!(exit.code, Some(3));
                assert!(output.contains("loading"));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected gate result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health_gate_accepts_unbounded_timeout() {
        let supervisor = supervisor(false, Duration::from_secs(1));
        let mut handle = supervisor.launch(&shell("crasher", "exit 4")).unwrap();

        let result = supervisor
            .health_gate(handle.as_mut(), "http://127.0.0.1:1/health", Duration::MAX)
            .await;

        assert!(matches!(result, Err(GateFailure::Exited { exit, .. }) if exit.code == Some(4)));
    }

    #[tokio::test]
    async fn test_health_gate_times_out() {
        let supervisor = supervisor(false, Duration::from_secs(1));
        let mut handle = supervisor.launch(&shell("slow", "sleep 30")).unwrap();

        let result = supervisor
            .health_gate(handle.as_mut(), "http://127.0.0.1:1/health", Duration::from_millis(300))
            .await;

        assert!(matches!(result, Err(GateFailure::TimedOut { .. })));
        supervisor.terminate(handle.as_mut()).await.unwrap();
        assert!(handle.poll().is_some());
    }

    #[tokio::test]
    async fn test_terminate_is_graceful_and_idempotent() {
        let supervisor = supervisor(true, Duration::from_secs(5));
        let mut handle = supervisor.launch(&shell("worker", "sleep 30")).unwrap();

        supervisor
            .health_gate(handle.as_mut(), "http://127.0.0.1:1/health", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(handle.poll().is_none());

        supervisor.terminate(handle.as_mut()).await.unwrap();
        assert!(handle.poll().is_some());

        supervisor.terminate(handle.as_mut()).await.unwrap();
        handle.signal(StopSignal::Forceful).unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let supervisor = supervisor(true, Duration::from_millis(200));
        // Ignored dispositions survive exec, so sleep ignores SIGTERM too
        let mut handle = supervisor
            .launch(&shell("stubborn", "trap '' TERM; sleep 30"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.terminate(handle.as_mut()).await.unwrap();

        assert_eq!(handle.poll(), Some(ProcessExit { code: None }));
    }

    #[tokio::test]
    async fn test_launch_failure_is_startup_failure() {
        let supervisor = supervisor(true, Duration::from_secs(1));
        let spec = LaunchSpec {
            program: "/nonexistent/voice-worker".to_string(),
            ..shell("missing", "")
        };

        let result = supervisor.launch(&spec);

        assert!(matches!(result, Err(ManagerError::StartupFailure { alias, .. }) if alias == "missing"));
    }

    #[tokio::test]
    async fn test_http_health_check() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new()
            .route("/health", axum::routing::get(|| async { "ok" }))
            .route(
                "/loading",
                axum::routing::get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "loading") }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();

        assert!(probe.is_healthy(&format!("http://127.0.0.1:{}/health", port)).await);
        assert!(!probe.is_healthy(&format!("http://127.0.0.1:{}/loading", port)).await);
        assert!(!probe.is_healthy("http://127.0.0.1:1/health").await);
    }
}
