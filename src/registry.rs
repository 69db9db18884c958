use crate::app::Application;
use crate::config::AppSettings;
use crate::error::AppError;
use crate::monitor::IdleMonitor;
use crate::worker::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A registered application and the lock serializing its start/restart
struct Slot {
    app: Arc<Application>,
    /// `true` once the first start has been attempted
    lifecycle: tokio::sync::Mutex<bool>,
}

/// Process-wide map from application name to its single live instance.
///
/// # Locking
///
/// The map itself is guarded by a short synchronous lock that is never held
/// across an await. Starting or restarting an application happens under
/// that application's own async lock, so a slow worker spawn only delays
/// requests for the same application.
pub struct Registry {
    settings: Arc<AppSettings>,
    apps: Mutex<HashMap<String, Arc<Slot>>>,
    monitor: Arc<dyn IdleMonitor>,
}

impl Registry {
    /// Create an empty registry.
    ///
    /// Returns `Arc<Self>` because the registry is shared by every request
    /// handler task.
    pub fn new(settings: AppSettings, monitor: Arc<dyn IdleMonitor>) -> Arc<Self> {
        Arc::new(Self {
            settings: Arc::new(settings),
            apps: Mutex::new(HashMap::new()),
            monitor,
        })
    }

    pub fn settings(&self) -> &Arc<AppSettings> {
        &self.settings
    }

    /// Return the live application for `name`.
    ///
    /// A new name is classified and started. A known application whose
    /// restart markers fire has its workers killed; the instance stays
    /// registered and spawns a fresh worker on its next connection.
    pub async fn get(&self, name: &str) -> Result<Arc<Application>, AppError> {
        debug!(app = name, "Looking up application");
        let slot = self.slot_for(name)?;

        {
            let mut started = slot.lifecycle.lock().await;
            if !*started {
                *started = true;
                if let Err(e) = slot.app.start().await {
                    error!(app = name, error = %e, "Failed to start application");
                    slot.app.kill(Signal::Term, true).await;
                    return Err(e);
                }
            } else if slot.app.restart_needed() {
                info!(app = name, "Restarting application");
                slot.app.kill(Signal::Term, true).await;
            }
        }

        self.monitor.accessed(&slot.app);
        Ok(Arc::clone(&slot.app))
    }

    fn slot_for(&self, name: &str) -> Result<Arc<Slot>, AppError> {
        let mut apps = self.apps.lock();
        if let Some(slot) = apps.get(name) {
            return Ok(Arc::clone(slot));
        }

        let app = Arc::new(Application::for_name(name, &self.settings)?);
        self.monitor.track(&app);
        let slot = Arc::new(Slot {
            app,
            lifecycle: tokio::sync::Mutex::new(false),
        });
        apps.insert(name.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    /// Currently registered application, without starting anything
    pub fn lookup(&self, name: &str) -> Option<Arc<Application>> {
        self.apps.lock().get(name).map(|slot| Arc::clone(&slot.app))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.apps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.lock().is_empty()
    }

    /// Remove and close every application.
    ///
    /// Workers are signalled without waiting for them to exit, since this
    /// runs while the proxy itself is going down. Workers still starting
    /// are stopped too, and closed applications spawn no new ones. Calling
    /// it again on an empty registry does nothing.
    pub async fn shutdown(&self) {
        let mut stopped = 0usize;
        loop {
            let next = {
                let mut apps = self.apps.lock();
                let key = apps.keys().next().cloned();
                key.and_then(|k| apps.remove(&k))
            };
            let Some(slot) = next else {
                break;
            };

            slot.app.close().await;
            // The monitor may already be stopped
            let _ = self.monitor.untrack(&slot.app);
            stopped += 1;
        }
        if stopped > 0 {
            info!(count = stopped, "Stopped all applications");
        }
    }
}
