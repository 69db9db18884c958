//! Applications resolved from the host root
//!
//! Every entry under the host root is one application:
//! - a directory (or a symlink to one) is served by worker processes
//!   speaking HTTP over Unix sockets
//! - a file holding a port number is forwarded to `localhost:<port>`

use crate::config::AppSettings;
use crate::error::AppError;
use crate::worker::{Signal, Worker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, error, info};

/// Marker that forces a restart on every request while present
pub const ALWAYS_RESTART_FILE: &str = "always_restart.txt";
/// Marker whose mtime, when newer than a worker's socket, requests a restart
pub const RESTART_FILE: &str = "restart.txt";

/// What an entry under the host root configures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationKind {
    /// Directory served by spawned workers; `path` is canonical
    Process { path: PathBuf },
    /// Fixed TCP port on localhost
    PortForward { port: u16 },
}

impl ApplicationKind {
    /// Classify `<host_root>/<name>`.
    ///
    /// This reads the filesystem on every call so edits between calls are
    /// observed.
    pub fn classify(name: &str, settings: &AppSettings) -> Result<Self, AppError> {
        if !is_valid_name(name) {
            debug!(app = name, "Rejecting invalid application name");
            return Err(AppError::no_such_app(name));
        }

        let entry = settings.host_root.join(name);
        let meta = match std::fs::symlink_metadata(&entry) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(app = name, path = %entry.display(), error = %e, "No application entry");
                return Err(AppError::no_such_app(name));
            }
        };

        let resolved = if meta.file_type().is_symlink() {
            match std::fs::canonicalize(&entry) {
                Ok(target) => target,
                Err(_) => {
                    let target = std::fs::read_link(&entry).unwrap_or_default();
                    error!(
                        app = name,
                        link = %entry.display(),
                        target = %target.display(),
                        "Dangling symlink"
                    );
                    return Err(AppError::no_such_app(name));
                }
            }
        } else {
            entry
        };

        if resolved.is_dir() {
            let path = std::fs::canonicalize(&resolved).unwrap_or(resolved);
            return Ok(ApplicationKind::Process { path });
        }

        let content = std::fs::read_to_string(&resolved).unwrap_or_default();
        match content.trim().parse::<i64>() {
            Ok(port) if port > 0 => match u16::try_from(port) {
                Ok(port) => Ok(ApplicationKind::PortForward { port }),
                Err(_) => {
                    error!(app = name, path = %resolved.display(), port, "Port number out of range");
                    Err(AppError::no_such_app(name))
                }
            },
            _ => {
                error!(
                    app = name,
                    path = %resolved.display(),
                    "Could not read port number from file"
                );
                Err(AppError::no_such_app(name))
            }
        }
    }
}

/// True when `<host_root>/<name>` exists (following symlinks)
pub fn entry_exists(name: &str, settings: &AppSettings) -> bool {
    is_valid_name(name) && settings.host_root.join(name).exists()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// A resolved application.
///
/// Both kinds expose the same capabilities; port-forwarded applications own
/// no process so their lifecycle operations are no-ops.
#[derive(Debug)]
pub enum Application {
    Process(ProcessApplication),
    PortForward(PortForwardApplication),
}

impl Application {
    /// Build the application configured for `name`, or fail with
    /// [`AppError::NoSuchApplication`]
    pub fn for_name(name: &str, settings: &Arc<AppSettings>) -> Result<Self, AppError> {
        let app = match ApplicationKind::classify(name, settings)? {
            ApplicationKind::Process { path } => {
                Application::Process(ProcessApplication::new(name, path, Arc::clone(settings)))
            }
            ApplicationKind::PortForward { port } => {
                Application::PortForward(PortForwardApplication::new(name, port))
            }
        };
        Ok(app)
    }

    pub fn name(&self) -> &str {
        match self {
            Application::Process(app) => app.name(),
            Application::PortForward(app) => app.name(),
        }
    }

    pub fn kind(&self) -> ApplicationKind {
        match self {
            Application::Process(app) => ApplicationKind::Process {
                path: app.path().to_path_buf(),
            },
            Application::PortForward(app) => ApplicationKind::PortForward { port: app.port() },
        }
    }

    /// Where worker output is appended (process-backed only)
    pub fn log_path(&self) -> Option<&Path> {
        match self {
            Application::Process(app) => Some(app.log_path()),
            Application::PortForward(_) => None,
        }
    }

    pub async fn start(&self) -> Result<(), AppError> {
        match self {
            Application::Process(app) => app.start().await,
            Application::PortForward(_) => Ok(()),
        }
    }

    pub async fn kill(&self, signal: Signal, wait: bool) {
        if let Application::Process(app) = self {
            app.kill(signal, wait).await;
        }
    }

    /// Kill everything without waiting and refuse new workers from now on
    pub async fn close(&self) {
        if let Application::Process(app) = self {
            app.close().await;
        }
    }

    pub fn restart_needed(&self) -> bool {
        match self {
            Application::Process(app) => app.restart_needed(),
            Application::PortForward(_) => false,
        }
    }

    /// A live connection to the application
    pub async fn acquire_connection(&self) -> Result<Connection, AppError> {
        match self {
            Application::Process(app) => app.acquire_connection().await,
            Application::PortForward(app) => app.acquire_connection().await,
        }
    }
}

/// Workers of one application, tracked by worker number.
///
/// Workers are tracked from the moment they are launched, so killing the
/// application also reaches workers still waiting for their socket.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    available: VecDeque<u64>,
    /// Set on shutdown; no worker is tracked afterwards
    closed: bool,
}

impl WorkerPool {
    /// Track a starting worker; false once the pool is closed
    fn add(&mut self, worker: Arc<Worker>) -> bool {
        if self.closed {
            return false;
        }
        self.workers.push(worker);
        true
    }

    fn contains(&self, number: u64) -> bool {
        self.workers.iter().any(|w| w.number() == number)
    }

    fn check_out(&mut self) -> Option<Arc<Worker>> {
        while let Some(number) = self.available.pop_front() {
            if let Some(worker) = self.workers.iter().find(|w| w.number() == number) {
                return Some(Arc::clone(worker));
            }
        }
        None
    }

    fn check_in(&mut self, number: u64) {
        if self.contains(number) && !self.available.contains(&number) {
            self.available.push_back(number);
        }
    }

    pub(crate) fn remove(&mut self, number: u64) {
        self.workers.retain(|w| w.number() != number);
        self.available.retain(|n| *n != number);
    }
}

/// Exclusive use of one worker; hands it back to the pool on drop
pub struct Checkout {
    worker: Arc<Worker>,
    pool: Weak<Mutex<WorkerPool>>,
}

impl Checkout {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().check_in(self.worker.number());
        }
    }
}

/// Application served from a directory by one or more workers
pub struct ProcessApplication {
    name: String,
    path: PathBuf,
    log_path: PathBuf,
    socket_prefix: String,
    settings: Arc<AppSettings>,
    last_worker_number: AtomicU64,
    pool: Arc<Mutex<WorkerPool>>,
}

impl std::fmt::Debug for ProcessApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessApplication")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("workers", &self.workers())
            .finish()
    }
}

impl ProcessApplication {
    pub fn new(name: &str, path: PathBuf, settings: Arc<AppSettings>) -> Self {
        let socket_prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let log_path = settings.log_root().join(format!("{}.log", socket_prefix));

        Self {
            name: name.to_string(),
            path,
            log_path,
            socket_prefix,
            settings,
            last_worker_number: AtomicU64::new(0),
            pool: Arc::new(Mutex::new(WorkerPool::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical application directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub(crate) fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub(crate) fn pool_ref(&self) -> Weak<Mutex<WorkerPool>> {
        Arc::downgrade(&self.pool)
    }

    pub(crate) fn socket_path_for(&self, number: u64) -> PathBuf {
        self.settings
            .socket_root()
            .join(format!("{}-{}.sock", self.socket_prefix, number))
    }

    /// Returns a fresh worker number; numbers are never reused
    pub fn next_worker_number(&self) -> u64 {
        self.last_worker_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Numbers of all tracked workers, in spawn order
    pub fn workers(&self) -> Vec<u64> {
        self.pool.lock().workers.iter().map(|w| w.number()).collect()
    }

    /// Numbers of checked-in workers, in checkout order
    pub fn available_workers(&self) -> Vec<u64> {
        self.pool.lock().available.iter().copied().collect()
    }

    pub fn worker(&self, number: u64) -> Option<Arc<Worker>> {
        self.pool
            .lock()
            .workers
            .iter()
            .find(|w| w.number() == number)
            .cloned()
    }

    /// Spawn one worker and make it available
    pub async fn spawn(&self) -> Result<Arc<Worker>, AppError> {
        info!(app = %self.name, "Spawning one worker");
        self.spawn_worker(true).await
    }

    /// Launch a tracked worker and wait until it is ready.
    ///
    /// A worker killed while starting (or started on a closed pool) is
    /// stopped again and reported as a failed start.
    async fn spawn_worker(&self, available: bool) -> Result<Arc<Worker>, AppError> {
        let worker = Worker::new(self);
        let number = worker.number();
        if !self.pool.lock().add(Arc::clone(&worker)) {
            return Err(AppError::cant_start(&self.name, "application is shutting down"));
        }

        if let Err(e) = worker.start().await {
            self.pool.lock().remove(number);
            return Err(e);
        }

        let tracked = {
            let mut pool = self.pool.lock();
            let tracked = pool.contains(number);
            if tracked && available {
                pool.check_in(number);
            }
            tracked
        };
        if !tracked {
            debug!(app = %self.name, worker = number, "Worker was stopped while starting");
            worker.kill(Signal::Term, false).await;
            return Err(AppError::cant_start(
                &self.name,
                format!("worker {} was stopped while starting", number),
            ));
        }

        Ok(worker)
    }

    /// Spawn a worker unless one is already started
    pub async fn start(&self) -> Result<(), AppError> {
        info!(app = %self.name, "Starting application");
        let started = self.pool.lock().workers.iter().any(|w| w.is_started());
        if started {
            debug!(app = %self.name, "Application already has a started worker");
            return Ok(());
        }
        self.spawn().await.map(|_| ())
    }

    pub async fn kill(&self, signal: Signal, wait: bool) {
        let workers: Vec<Arc<Worker>> = self.pool.lock().workers.clone();
        for worker in workers {
            worker.kill(signal, wait).await;
        }
    }

    /// Close the pool, then kill every worker without waiting
    pub async fn close(&self) {
        self.pool.lock().closed = true;
        self.kill(Signal::Term, false).await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.lock().closed
    }

    /// Restart when no worker is up, when `tmp/always_restart.txt` exists, or
    /// when `tmp/restart.txt` was touched after a started worker's socket
    /// was created.
    pub fn restart_needed(&self) -> bool {
        let started: Vec<Arc<Worker>> = self
            .pool
            .lock()
            .workers
            .iter()
            .filter(|w| w.is_started())
            .cloned()
            .collect();
        if started.is_empty() {
            return true;
        }

        let tmp = self.path.join("tmp");
        if tmp.join(ALWAYS_RESTART_FILE).exists() {
            return true;
        }

        let Ok(requested_at) = std::fs::metadata(tmp.join(RESTART_FILE)).and_then(|m| m.modified())
        else {
            return false;
        };
        started
            .iter()
            .any(|w| w.socket_modified().is_some_and(|created| created < requested_at))
    }

    /// Check out the first available worker, spawning one if none is free,
    /// and connect to it.
    ///
    /// The worker stays out of the available list until the returned
    /// connection is dropped, or immediately returns to it if connecting
    /// fails.
    pub async fn acquire_connection(&self) -> Result<Connection, AppError> {
        debug!(app = %self.name, "Getting connection");
        let checkout = self.check_out().await?;
        let stream = checkout.worker().acquire_socket().await?;
        Ok(Connection::Unix { stream, checkout })
    }

    async fn check_out(&self) -> Result<Checkout, AppError> {
        let available = self.pool.lock().check_out();
        let worker = match available {
            Some(worker) => worker,
            None => {
                debug!(app = %self.name, "No available worker, spawning one");
                self.spawn_worker(false).await?
            }
        };

        Ok(Checkout {
            worker,
            pool: Arc::downgrade(&self.pool),
        })
    }
}

/// Application forwarded to a fixed port on localhost
#[derive(Debug)]
pub struct PortForwardApplication {
    name: String,
    port: u16,
}

impl PortForwardApplication {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn acquire_connection(&self) -> Result<Connection, AppError> {
        debug!(app = %self.name, port = self.port, "Getting connection");
        TcpStream::connect(("localhost", self.port))
            .await
            .map(Connection::Tcp)
            .map_err(|source| AppError::PortForwardingConnectionError {
                name: self.name.clone(),
                port: self.port,
                source,
            })
    }
}

/// A byte stream to an application
pub enum Connection {
    /// Socket of a checked-out worker
    Unix {
        stream: UnixStream,
        checkout: Checkout,
    },
    /// Forwarded TCP port
    Tcp(TcpStream),
}

impl Connection {
    /// Number of the worker serving this connection
    pub fn worker_number(&self) -> Option<u64> {
        match self {
            Connection::Unix { checkout, .. } => Some(checkout.worker().number()),
            Connection::Tcp(_) => None,
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix { stream, .. } => Pin::new(stream).poll_read(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix { stream, .. } => Pin::new(stream).poll_write(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix { stream, .. } => Pin::new(stream).poll_flush(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix { stream, .. } => Pin::new(stream).poll_shutdown(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Arc<AppSettings> {
        Arc::new(AppSettings::with_host_root(dir.path()))
    }

    #[test]
    fn test_classify_missing_entry() {
        let dir = TempDir::new().unwrap();
        let result = ApplicationKind::classify("ghost", &settings(&dir));
        assert!(matches!(result, Err(AppError::NoSuchApplication { name }) if name == "ghost"));
    }

    #[test]
    fn test_classify_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("blog")).unwrap();

        let kind = ApplicationKind::classify("blog", &settings(&dir)).unwrap();
        let expected = std::fs::canonicalize(dir.path().join("blog")).unwrap();
        assert_eq!(kind, ApplicationKind::Process { path: expected });
    }

    #[test]
    fn test_classify_symlink_to_directory_uses_target() {
        let dir = TempDir::new().unwrap();
        let projects = TempDir::new().unwrap();
        let target = projects.path().join("shop-src");
        std::fs::create_dir(&target).unwrap();
        symlink(&target, dir.path().join("shop")).unwrap();

        let kind = ApplicationKind::classify("shop", &settings(&dir)).unwrap();
        assert_eq!(
            kind,
            ApplicationKind::Process {
                path: std::fs::canonicalize(&target).unwrap()
            }
        );
    }

    #[test]
    fn test_classify_dangling_symlink() {
        let dir = TempDir::new().unwrap();
        symlink(dir.path().join("gone"), dir.path().join("broken")).unwrap();

        let result = ApplicationKind::classify("broken", &settings(&dir));
        assert!(matches!(result, Err(AppError::NoSuchApplication { .. })));
        assert!(!entry_exists("broken", &settings(&dir)));
    }

    #[test]
    fn test_classify_port_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("api"), "9292\n").unwrap();
        std::fs::write(dir.path().join("padded"), "  3000  ").unwrap();

        let settings = settings(&dir);
        assert_eq!(
            ApplicationKind::classify("api", &settings).unwrap(),
            ApplicationKind::PortForward { port: 9292 }
        );
        assert_eq!(
            ApplicationKind::classify("padded", &settings).unwrap(),
            ApplicationKind::PortForward { port: 3000 }
        );
    }

    #[test]
    fn test_classify_invalid_port_files() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        for (name, content) in [
            ("zero", "0"),
            ("negative", "-80"),
            ("words", "not a port"),
            ("empty", ""),
            ("huge", "70000"),
        ] {
            std::fs::write(dir.path().join(name), content).unwrap();
            let result = ApplicationKind::classify(name, &settings);
            assert!(
                matches!(result, Err(AppError::NoSuchApplication { .. })),
                "{} should not classify",
                name
            );
        }
    }

    #[test]
    fn test_classify_rejects_names_escaping_host_root() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        for name in ["", ".", "..", "../etc", "a/b"] {
            assert!(ApplicationKind::classify(name, &settings).is_err());
            assert!(!entry_exists(name, &settings));
        }
    }

    #[test]
    fn test_classification_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let entry = dir.path().join("flip");

        std::fs::write(&entry, "4000").unwrap();
        assert_eq!(
            ApplicationKind::classify("flip", &settings).unwrap(),
            ApplicationKind::PortForward { port: 4000 }
        );

        std::fs::remove_file(&entry).unwrap();
        std::fs::create_dir(&entry).unwrap();
        assert!(matches!(
            ApplicationKind::classify("flip", &settings).unwrap(),
            ApplicationKind::Process { .. }
        ));
    }

    #[test]
    fn test_process_application_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("blog")).unwrap();
        let settings = settings(&dir);

        let app = Application::for_name("blog", &settings).unwrap();
        let Application::Process(app) = app else {
            panic!("expected a process-backed application");
        };

        assert_eq!(app.log_path(), settings.log_root().join("blog.log"));
        assert_eq!(
            app.socket_path_for(3),
            settings.socket_root().join("blog-3.sock")
        );
    }

    #[test]
    fn test_worker_numbers_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let app = ProcessApplication::new("blog", dir.path().to_path_buf(), settings(&dir));

        assert_eq!(app.next_worker_number(), 1);
        assert_eq!(app.next_worker_number(), 2);
        assert_eq!(app.next_worker_number(), 3);
    }

    #[test]
    fn test_restart_needed_without_workers() {
        let dir = TempDir::new().unwrap();
        let app = ProcessApplication::new("blog", dir.path().to_path_buf(), settings(&dir));

        assert!(app.restart_needed());
        assert!(app.workers().is_empty());
        assert!(app.available_workers().is_empty());
    }

    #[tokio::test]
    async fn test_closed_application_refuses_workers() {
        let dir = TempDir::new().unwrap();
        let app = ProcessApplication::new("blog", dir.path().to_path_buf(), settings(&dir));

        app.close().await;
        assert!(app.is_closed());

        let result = app.acquire_connection().await;
        assert!(matches!(result, Err(AppError::CantStartApplication { .. })));
        assert!(app.workers().is_empty());
    }

    #[tokio::test]
    async fn test_port_forward_application_is_inert() {
        let app = Application::PortForward(PortForwardApplication::new("api", 9292));

        app.start().await.unwrap();
        app.kill(Signal::Term, true).await;
        app.close().await;
        assert!(!app.restart_needed());
        assert_eq!(app.kind(), ApplicationKind::PortForward { port: 9292 });
        assert!(app.log_path().is_none());
    }

    #[tokio::test]
    async fn test_port_forward_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = PortForwardApplication::new("api", port);

        let (connection, accepted) = tokio::join!(app.acquire_connection(), listener.accept());
        let connection = connection.unwrap();
        accepted.unwrap();
        assert!(connection.worker_number().is_none());
    }
}
