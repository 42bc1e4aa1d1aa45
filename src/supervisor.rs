//! Supervision of the frontend tool process
//!
//! The tool is started as the leader of a new process group so that stopping
//! it also reaches the bundler/server children it forks. Every supervisor is
//! tracked in a process-wide [`Registry`]; the bootstrap layer owns a
//! [`LifecycleGuard`] from [`init`] and calls [`LifecycleGuard::shutdown`] when
//! it receives a termination signal. Dropping the guard without shutting down
//! force-kills every tracked group.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines of child output retained for start-failure diagnostics
const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for output readers after an immediate exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for group members that outlive the leader
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No process
    Idle,
    /// Spawned, inside the startup probe window
    Starting,
    /// Alive past the probe window
    Running,
    /// Termination in progress
    Stopping,
}

/// The supervised process exited right after it was spawned
#[derive(Debug, thiserror::Error)]
#[error("process {command:?} exited immediately (exit code {exit_code:?})\n{output}")]
pub struct ProcessStartError {
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub output: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("empty command")]
    EmptyCommand,
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    StartFailed(#[from] ProcessStartError),
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable (builder pattern)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Bounded tail of child stdout/stderr
#[derive(Debug, Default)]
struct OutputLog {
    lines: Mutex<VecDeque<String>>,
}

impl OutputLog {
    fn push(&self, stream: &str, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(format!("[{}] {}", stream, line));
    }

    fn render(&self) -> String {
        self.lines.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

struct RunningProcess {
    child: Child,
    pid: u32,
}

/// Supervises at most one live process.
///
/// Like the rest of the crate's shared components, a supervisor lives behind an
/// `Arc`; [`new`](Supervisor::new) returns one and registers a weak reference
/// in the global registry.
pub struct Supervisor {
    name: String,
    process: tokio::sync::Mutex<Option<RunningProcess>>,
    state: Mutex<SupervisorState>,
    /// Group id of the last started process (0 when none), readable without
    /// awaiting. Kept after the leader exits until the group has been signaled.
    pgid: AtomicU32,
    startup_probe: Duration,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, startup_probe: Duration, shutdown_timeout: Duration) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            name: name.into(),
            process: tokio::sync::Mutex::new(None),
            state: Mutex::new(SupervisorState::Idle),
            pgid: AtomicU32::new(0),
            startup_probe,
            shutdown_timeout,
        });
        registry().register(&supervisor);
        supervisor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
    }

    /// Pid of the live process, if any
    pub async fn pid(&self) -> Option<u32> {
        let mut guard = self.process.lock().await;
        reap_if_exited(&self.name, &mut guard);
        guard.as_ref().map(|p| p.pid)
    }

    pub async fn is_running(&self) -> bool {
        self.pid().await.is_some()
    }

    /// Start the process unless one is already alive. Returns the pid.
    pub async fn start(&self, spec: &ProcessSpec) -> Result<u32, SupervisorError> {
        let mut guard = self.process.lock().await;

        reap_if_exited(&self.name, &mut guard);
        if let Some(ref running) = *guard {
            debug!(process = %self.name, pid = running.pid, "Process already running");
            return Ok(running.pid);
        }

        let (program, args) = spec.argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

        // Leftovers of a previous run whose leader exited on its own
        let stale = self.pgid.load(Ordering::SeqCst);
        if group_alive(stale) {
            warn!(process = %self.name, pgid = stale, "Killing leftover process group");
            signal_group(None, stale, GroupSignal::Kill);
        }
        self.pgid.store(0, Ordering::SeqCst);

        info!(process = %self.name, command = ?spec.argv, "Starting process");
        self.set_state(SupervisorState::Starting);

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // New group led by the child, so the whole tree can be signaled
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.set_state(SupervisorState::Idle);
                return Err(SupervisorError::Spawn {
                    command: spec.argv.clone(),
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let output = Arc::new(OutputLog::default());
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(stdout, "stdout", self.name.clone(), Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(stderr, "stderr", self.name.clone(), Arc::clone(&output)));
        }

        // An exit inside the probe window is a failed start
        match tokio::time::timeout(self.startup_probe, child.wait()).await {
            Ok(Ok(status)) => {
                self.set_state(SupervisorState::Idle);
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers)).await;
                error!(process = %self.name, pid, ?status, "Process exited immediately after start");
                signal_group(None, pid, GroupSignal::Kill);
                return Err(ProcessStartError {
                    command: spec.argv.clone(),
                    exit_code: status.code(),
                    output: output.render(),
                }
                .into());
            }
            Ok(Err(e)) => {
                warn!(process = %self.name, pid, error = %e, "Could not poll process after start");
            }
            Err(_) => {}
        }

        self.pgid.store(pid, Ordering::SeqCst);
        *guard = Some(RunningProcess { child, pid });
        self.set_state(SupervisorState::Running);
        info!(process = %self.name, pid, "Process started");

        Ok(pid)
    }

    /// Stop the process group: SIGTERM, wait up to the shutdown timeout, then SIGKILL.
    /// The group is signaled even if its leader already exited. A no-op when
    /// no group was ever started. Always leaves the supervisor idle.
    pub async fn stop(&self) {
        self.stop_with_timeout(self.shutdown_timeout).await
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) {
        let mut guard = self.process.lock().await;
        let running = guard.take();
        let pgid = self.pgid.load(Ordering::SeqCst);
        if running.is_none() && pgid == 0 {
            self.set_state(SupervisorState::Idle);
            return;
        }

        self.set_state(SupervisorState::Stopping);
        let deadline = tokio::time::Instant::now() + timeout;

        match running {
            Some(mut running) => {
                if let Ok(Some(status)) = running.child.try_wait() {
                    debug!(process = %self.name, pid = running.pid, ?status, "Process already exited");
                }
                info!(process = %self.name, pgid, "Sending SIGTERM to process group");
                signal_group(Some(&mut running.child), pgid, GroupSignal::Terminate);

                match tokio::time::timeout_at(deadline, running.child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(process = %self.name, ?status, "Process exited gracefully");
                    }
                    Ok(Err(e)) => {
                        warn!(process = %self.name, error = %e, "Error waiting for process to exit");
                    }
                    Err(_) => {
                        warn!(
                            process = %self.name,
                            timeout_secs = timeout.as_secs_f64(),
                            "Shutdown timeout exceeded, sending SIGKILL to process group"
                        );
                        signal_group(Some(&mut running.child), pgid, GroupSignal::Kill);
                        let _ = running.child.wait().await;
                    }
                }
            }
            None => {
                info!(process = %self.name, pgid, "Leader gone, sending SIGTERM to remaining group");
                signal_group(None, pgid, GroupSignal::Terminate);
            }
        }

        // Members that outlive the leader get the rest of the timeout
        if !wait_for_group_exit(pgid, deadline).await {
            warn!(process = %self.name, pgid, "Group members still running, sending SIGKILL");
            signal_group(None, pgid, GroupSignal::Kill);
        }

        self.pgid.store(0, Ordering::SeqCst);
        self.set_state(SupervisorState::Idle);
    }

    /// Synchronous SIGKILL of the tracked group, for exit paths that cannot await
    fn kill_now(&self) {
        let pgid = self.pgid.swap(0, Ordering::SeqCst);
        if pgid == 0 {
            return;
        }
        warn!(process = %self.name, pgid, "Force-killing process group");
        signal_group(None, pgid, GroupSignal::Kill);
    }
}

/// Drop the handle of a leader that has exited on its own. The group id stays
/// recorded: forked members may still be running.
fn reap_if_exited(name: &str, slot: &mut Option<RunningProcess>) {
    let exited = match slot.as_mut() {
        Some(running) => match running.child.try_wait() {
            Ok(Some(status)) => {
                warn!(process = %name, pid = running.pid, ?status, "Process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(process = %name, error = %e, "Failed to poll process");
                false
            }
        },
        None => false,
    };
    if exited {
        *slot = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the whole group. A group that no longer exists is not an error.
fn signal_group(child: Option<&mut Child>, pgid: u32, signal: GroupSignal) {
    #[cfg(unix)]
    {
        if pgid == 0 {
            // Never signal group 0: that is our own group
            if let Some(child) = child {
                let _ = child.start_kill();
            }
            return;
        }
        let sig = match signal {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        if unsafe { libc::killpg(pgid as i32, sig) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, ?signal, error = %err, "Failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
        if let Some(child) = child {
            let _ = child.start_kill();
        }
    }
}

/// Whether any process is left in group `pgid`
#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    pgid != 0 && unsafe { libc::killpg(pgid as i32, 0) } == 0
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}

/// Wait until the group is empty. Returns false if `deadline` passes first.
async fn wait_for_group_exit(pgid: u32, deadline: tokio::time::Instant) -> bool {
    while group_alive(pgid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
    true
}

fn spawn_output_reader<R>(reader: R, stream: &'static str, name: String, log: Arc<OutputLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(process = %name, stream, "{}", line);
            log.push(stream, line);
        }
    })
}

/// Process-wide set of supervisors
#[derive(Default)]
pub struct Registry {
    supervisors: Mutex<Vec<Weak<Supervisor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, supervisor: &Arc<Supervisor>) {
        let mut supervisors = self.supervisors.lock();
        supervisors.retain(|s| s.strong_count() > 0);
        supervisors.push(Arc::downgrade(supervisor));
    }

    /// Live supervisors
    pub fn supervisors(&self) -> Vec<Arc<Supervisor>> {
        self.supervisors.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Gracefully stop every registered supervisor
    pub async fn shutdown_all(&self) {
        let supervisors = self.supervisors();
        if !supervisors.is_empty() {
            info!(count = supervisors.len(), "Stopping supervised processes");
        }
        futures::future::join_all(supervisors.iter().map(|s| s.stop())).await;
    }

    /// Force-kill every registered group without awaiting
    pub fn kill_all_now(&self) {
        for supervisor in self.supervisors() {
            supervisor.kill_now();
        }
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Begin the supervision lifecycle. Call once from the bootstrap layer.
pub fn init() -> LifecycleGuard {
    LifecycleGuard::new(registry())
}

/// Owns cleanup of every supervised process.
///
/// `shutdown().await` stops each group gracefully. If the guard is dropped
/// without that (panic unwinding, early return), every tracked group is
/// SIGKILLed synchronously so no dev server outlives the host.
pub struct LifecycleGuard {
    registry: &'static Registry,
    done: AtomicBool,
}

impl LifecycleGuard {
    pub fn new(registry: &'static Registry) -> Self {
        debug!("Supervisor lifecycle initialized");
        Self {
            registry,
            done: AtomicBool::new(false),
        }
    }

    pub async fn shutdown(self) {
        self.registry.shutdown_all().await;
        self.done.store(true, Ordering::SeqCst);
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            self.registry.kill_all_now();
        }
    }
}
