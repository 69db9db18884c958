//! Idle monitoring of registered applications
//!
//! The registry reports every application it creates and every access to
//! it. [`IdleReaper`] uses those reports to kill the workers of applications
//! nobody has asked for within the idle timeout.

use crate::app::Application;
use crate::config::MonitorConfig;
use crate::worker::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("idle monitor is stopped")]
    Stopped,
}

/// Receives lifecycle notifications from the registry
pub trait IdleMonitor: Send + Sync {
    /// A new application was registered
    fn track(&self, app: &Arc<Application>);

    /// An application was just handed out by the registry
    fn accessed(&self, app: &Arc<Application>);

    /// The application is going away
    fn untrack(&self, app: &Arc<Application>) -> Result<(), MonitorError>;
}

/// Monitor that ignores every notification
#[derive(Debug, Default)]
pub struct NoopMonitor;

impl IdleMonitor for NoopMonitor {
    fn track(&self, _app: &Arc<Application>) {}

    fn accessed(&self, _app: &Arc<Application>) {}

    fn untrack(&self, _app: &Arc<Application>) -> Result<(), MonitorError> {
        Ok(())
    }
}

struct Tracked {
    app: Arc<Application>,
    last_access: Instant,
    /// Set once the idle workers were killed; cleared by the next access
    reaped: bool,
}

/// Kills the workers of applications idle for longer than the timeout.
///
/// Reaped applications stay registered: the registry notices they have no
/// started worker and a fresh one is spawned on the next connection.
pub struct IdleReaper {
    config: MonitorConfig,
    tracked: Mutex<HashMap<String, Tracked>>,
    stopped: AtomicBool,
}

impl IdleReaper {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tracked: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Kill every application idle past the timeout; returns their names
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout();
        let to_kill: Vec<Arc<Application>> = {
            let mut tracked = self.tracked.lock();
            tracked
                .values_mut()
                .filter(|t| !t.reaped && t.last_access.elapsed() > idle_timeout)
                .map(|t| {
                    t.reaped = true;
                    info!(
                        app = %t.app.name(),
                        idle_secs = t.last_access.elapsed().as_secs(),
                        "Application idle timeout reached"
                    );
                    Arc::clone(&t.app)
                })
                .collect()
        };

        let mut names = Vec::with_capacity(to_kill.len());
        for app in to_kill {
            app.kill(Signal::Term, true).await;
            names.push(app.name().to_string());
        }
        names
    }

    /// Periodically reap idle applications until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.reap_interval();
        debug!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout_secs,
            "Idle monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.reap_idle().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.stopped.store(true, Ordering::SeqCst);
        debug!("Idle monitor stopped");
    }
}

impl IdleMonitor for IdleReaper {
    fn track(&self, app: &Arc<Application>) {
        self.tracked.lock().insert(
            app.name().to_string(),
            Tracked {
                app: Arc::clone(app),
                last_access: Instant::now(),
                reaped: false,
            },
        );
    }

    fn accessed(&self, app: &Arc<Application>) {
        let mut tracked = self.tracked.lock();
        match tracked.get_mut(app.name()) {
            Some(entry) => {
                entry.last_access = Instant::now();
                entry.reaped = false;
            }
            None => {
                tracked.insert(
                    app.name().to_string(),
                    Tracked {
                        app: Arc::clone(app),
                        last_access: Instant::now(),
                        reaped: false,
                    },
                );
            }
        }
    }

    fn untrack(&self, app: &Arc<Application>) -> Result<(), MonitorError> {
        if self.is_stopped() {
            return Err(MonitorError::Stopped);
        }
        self.tracked.lock().remove(app.name());
        Ok(())
    }
}
