//! Installation and readiness of the interception process
//!
//! The [`Registry`] is the host mechanism: it installs one interception
//! process and keeps it alive across requester sessions. [`activate`] is the
//! per-session handshake: install, wait until active, and on the very first
//! activation for this origin ask the session to reload, since only a fresh
//! navigation is guaranteed to be routed through a newly installed
//! interceptor.

use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::interceptor::Interceptor;
use crate::storage::{ReadinessStore, READINESS_KEY};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Request interception is not available in this environment")]
    UnsupportedEnvironment,

    #[error("Readiness storage failed: {0:#}")]
    Storage(anyhow::Error),

    #[error("Interceptor still not in control after a reload")]
    ReloadLoop,
}

/// Interceptor installation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninstalled,
    Installing,
    Active,
}

/// Host mechanism for the interception process
#[derive(Debug)]
pub struct Registry {
    supported: bool,
    state: watch::Sender<WorkerState>,
    worker: OnceLock<Interceptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_support(true)
    }

    /// A host without interception capability
    pub fn unsupported() -> Self {
        Self::with_support(false)
    }

    fn with_support(supported: bool) -> Self {
        let (state, _) = watch::channel(WorkerState::Uninstalled);
        Self {
            supported,
            state,
            worker: OnceLock::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Install the interception process if it is not installed yet.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn register(&self) -> Result<(), LifecycleError> {
        if !self.supported {
            return Err(LifecycleError::UnsupportedEnvironment);
        }
        if self.worker.get().is_some() {
            debug!("Interceptor already installed");
            return Ok(());
        }

        self.state.send_replace(WorkerState::Installing);
        self.worker.get_or_init(|| {
            let (interceptor, _task) = Interceptor::spawn();
            interceptor
        });
        self.state.send_replace(WorkerState::Active);
        info!("Interceptor installed and active");
        Ok(())
    }

    /// Wait until the interception process is active.
    ///
    /// Like a browser's `serviceWorker.ready`, this waits indefinitely if
    /// nothing ever registers.
    pub async fn ready(&self) -> Interceptor {
        let mut state = self.state.subscribe();
        loop {
            if let Some(worker) = self.active() {
                return worker;
            }
            // The sender lives in self, so this only fails if self is gone
            if state.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The installed interceptor, if any
    pub fn active(&self) -> Option<Interceptor> {
        match self.state() {
            WorkerState::Active => self.worker.get().cloned(),
            _ => None,
        }
    }
}

/// Result of one session's handshake
#[derive(Debug)]
pub enum Activation {
    /// The interceptor controls this session's requests
    Active(Interceptor),
    /// First activation on this origin; the session must start over
    ReloadRequired,
}

/// Handshake for one requester session
pub async fn activate(
    registry: &Registry,
    store: &ReadinessStore,
) -> Result<Activation, LifecycleError> {
    registry.register().await?;
    let interceptor = registry.ready().await;

    let already_ready = store
        .is_set(READINESS_KEY)
        .map_err(LifecycleError::Storage)?;
    if !already_ready {
        store
            .set(READINESS_KEY)
            .map_err(LifecycleError::Storage)?;
        info!("First activation on this origin, reloading session");
        return Ok(Activation::ReloadRequired);
    }

    Ok(Activation::Active(interceptor))
}
