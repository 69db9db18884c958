//! Worker processes for directory-backed applications
//!
//! A worker is one subprocess started as `<launcher> --server <socket>`. It is
//! considered started as soon as its Unix socket shows up on disk. Workers
//! are addressed by a per-application number that is never reused, so the
//! socket path of a worker is stable across forced restarts.

use crate::app::{ProcessApplication, WorkerPool};
use crate::error::AppError;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Environment variable forwarded to workers to toggle their debug output
pub const DEBUG_ENV: &str = "DEVGATE_DEBUG";

/// Signals the supervisor sends to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown (default)
    Term,
    /// Interrupt, as from a terminal
    Int,
    /// Immediate termination
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Int => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Everything needed to (re)launch a worker process
#[derive(Debug, Clone)]
struct Launch {
    program: PathBuf,
    cwd: PathBuf,
    log_path: PathBuf,
    path_env: String,
    startup_timeout: Duration,
    poll_interval: Duration,
}

/// One subprocess serving an application over a private Unix socket
pub struct Worker {
    app_name: String,
    number: u64,
    socket_path: PathBuf,
    launch: Launch,
    /// Back-reference to the owning application's pool (no ownership)
    owner: Weak<Mutex<WorkerPool>>,
    /// Held for the whole readiness wait of a start
    process: tokio::sync::Mutex<Option<Child>>,
    /// Pid of the launched process, readable without the `process` lock
    pid: Mutex<Option<u32>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("app", &self.app_name)
            .field("number", &self.number)
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

impl Worker {
    /// Allocate the next worker number from `app` and describe the worker.
    ///
    /// Nothing is launched until [`Worker::start`].
    pub(crate) fn new(app: &ProcessApplication) -> Arc<Self> {
        let number = app.next_worker_number();
        let settings = app.settings();

        Arc::new(Self {
            app_name: app.name().to_string(),
            number,
            socket_path: app.socket_path_for(number),
            launch: Launch {
                program: settings.launcher.clone(),
                cwd: app.path().to_path_buf(),
                log_path: app.log_path().to_path_buf(),
                path_env: settings.worker_path(),
                startup_timeout: settings.startup_timeout(),
                poll_interval: settings.poll_interval(),
            },
            owner: app.pool_ref(),
            process: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Process id of the launched process, including one still starting
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// True iff the worker's socket file currently exists
    pub fn is_started(&self) -> bool {
        let started = self.socket_path.exists();
        if !started {
            debug!(socket = %self.socket_path.display(), "Socket does not exist yet");
        }
        started
    }

    /// Modification time of the socket file
    pub(crate) fn socket_modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.socket_path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Connect to the worker's socket.
    ///
    /// A missing socket or a refused connection means the backend crashed or
    /// left a stale socket behind: the worker is force-restarted and the
    /// connection is retried exactly once.
    pub async fn acquire_socket(&self) -> Result<UnixStream, AppError> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => Ok(stream),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                debug!(
                    app = %self.app_name,
                    worker = self.number,
                    error = %e,
                    "Worker socket unusable"
                );
                self.force_restart().await?;
                UnixStream::connect(&self.socket_path)
                    .await
                    .map_err(|e| self.connect_error(e))
            }
            Err(e) => Err(self.connect_error(e)),
        }
    }

    /// Signal the process and drop this worker from the owner's lists.
    ///
    /// With `wait` the call returns once the process has been reaped;
    /// without it the process is detached and reaped in the background.
    pub async fn kill(&self, signal: Signal, wait: bool) {
        self.terminate(signal, wait).await;

        if let Some(pool) = self.owner.upgrade() {
            pool.lock().remove(self.number);
        }
    }

    async fn force_restart(&self) -> Result<(), AppError> {
        info!(
            app = %self.app_name,
            worker = self.number,
            socket = %self.socket_path.display(),
            "Forcing restart of worker"
        );
        self.terminate(Signal::Term, true).await;
        self.clean_stale_socket();
        self.start().await
    }

    fn clean_stale_socket(&self) {
        if !self.socket_path.exists() {
            return;
        }
        warn!(socket = %self.socket_path.display(), "Cleaning stale socket");
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), error = %e, "Failed to remove stale socket");
            }
        }
    }

    /// Launch the process and block until its socket exists
    pub(crate) async fn start(&self) -> Result<(), AppError> {
        let mut process = self.process.lock().await;
        info!(
            app = %self.app_name,
            worker = self.number,
            path = %self.launch.cwd.display(),
            "Spawning worker"
        );
        let mut child = self.launch()?;
        *self.pid.lock() = child.id();

        match self.wait_until_started(&mut child).await {
            Ok(()) => {
                debug!(
                    app = %self.app_name,
                    worker = self.number,
                    socket = %self.socket_path.display(),
                    "Worker is ready"
                );
                *process = Some(child);
                Ok(())
            }
            Err(e) => {
                warn!(app = %self.app_name, worker = self.number, error = %e, "Worker failed to start");
                *self.pid.lock() = None;
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<Child, AppError> {
        let launch = &self.launch;
        for dir in [launch.log_path.parent(), self.socket_path.parent()]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("creating {}", dir.display()), e))?;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&launch.log_path)
            .map_err(|e| AppError::io(format!("opening log {}", launch.log_path.display()), e))?;
        let err_log = log
            .try_clone()
            .map_err(|e| AppError::io("duplicating log handle", e))?;

        let mut cmd = Command::new(&launch.program);
        cmd.arg("--server").arg(&self.socket_path);
        cmd.current_dir(&launch.cwd);
        cmd.env_clear();
        cmd.env("PATH", &launch.path_env);
        if let Some(home) = std::env::var_os("HOME") {
            cmd.env("HOME", home);
        }
        if let Some(flag) = std::env::var_os(DEBUG_ENV) {
            cmd.env(DEBUG_ENV, flag);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(err_log));

        debug!(
            program = %launch.program.display(),
            socket = %self.socket_path.display(),
            "Launching worker process"
        );

        let child = cmd.spawn().map_err(|e| {
            AppError::cant_start(
                &self.app_name,
                format!("failed to launch {}: {}", launch.program.display(), e),
            )
        })?;
        info!(
            app = %self.app_name,
            worker = self.number,
            pid = child.id().unwrap_or(0),
            "Worker process spawned"
        );

        Ok(child)
    }

    /// Poll for the socket file until it appears, the process exits or the
    /// startup timeout elapses.
    async fn wait_until_started(&self, child: &mut Child) -> Result<(), AppError> {
        let deadline = Instant::now() + self.launch.startup_timeout;

        loop {
            if self.is_started() {
                return Ok(());
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(AppError::cant_start(
                        &self.app_name,
                        format!("worker exited ({}) before creating its socket", status),
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(AppError::cant_start(
                        &self.app_name,
                        format!("lost track of worker process: {}", e),
                    ));
                }
            }

            if Instant::now() >= deadline {
                return Err(AppError::cant_start(
                    &self.app_name,
                    format!(
                        "socket {} did not appear within {} seconds",
                        self.socket_path.display(),
                        self.launch.startup_timeout.as_secs()
                    ),
                ));
            }

            tokio::time::sleep(self.launch.poll_interval).await;
        }
    }

    /// Stop the tracked process without touching pool membership.
    ///
    /// The signal goes out before the `process` lock is taken, so a start
    /// still waiting for its socket sees the exit and gives up. Without
    /// `wait` the lock is never awaited.
    async fn terminate(&self, signal: Signal, wait: bool) {
        let pid = *self.pid.lock();
        if let Some(pid) = pid {
            info!(app = %self.app_name, worker = self.number, pid, ?signal, "Killing worker");
            send_signal(pid, signal);
        }

        let child = if wait {
            self.process.lock().await.take()
        } else {
            // Busy means a start is in flight; it reaps its own child
            self.process.try_lock().ok().and_then(|mut process| process.take())
        };
        let Some(mut child) = child else {
            if pid.is_none() {
                debug!(app = %self.app_name, worker = self.number, "No process to kill");
            }
            return;
        };
        *self.pid.lock() = None;

        if pid.is_none() {
            if let Some(pid) = child.id() {
                info!(app = %self.app_name, worker = self.number, pid, ?signal, "Killing worker");
                send_signal(pid, signal);
            }
        }

        if wait {
            match child.wait().await {
                Ok(status) => {
                    debug!(app = %self.app_name, worker = self.number, ?status, "Worker exited");
                }
                // ECHILD: already reaped elsewhere
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {}
                Err(e) => {
                    warn!(app = %self.app_name, worker = self.number, error = %e, "Error waiting for worker to exit");
                }
            }
        } else {
            // Dropping the handle detaches the child; tokio reaps it in the background
            drop(child);
        }
    }

    fn connect_error(&self, e: std::io::Error) -> AppError {
        AppError::io(format!("connecting to {}", self.socket_path.display()), e)
    }
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // ESRCH means the process is already gone
    unsafe {
        libc::kill(pid, signal.as_raw());
    }
}
