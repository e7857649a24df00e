//! Startup and shutdown ordering for the process's components.
//!
//! Components register a start hook and a stop hook. [`Lifecycle::run_all`]
//! starts them in registration order; [`Lifecycle::shutdown_all`] stops the
//! ones that started, in reverse order, under one shared deadline.
//!
//! ```no_run
//! # async fn demo() -> twinport::Result<()> {
//! use std::time::Duration;
//! use twinport::Lifecycle;
//!
//! let mut lifecycle = Lifecycle::new();
//! lifecycle.register(
//!     "first",
//!     || async { Ok(()) },
//!     |_deadline| async { Ok(()) },
//! );
//! lifecycle.run_all().await?;
//! let report = lifecycle.shutdown_all(Duration::from_secs(5)).await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

use crate::{Result, TwinportError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

type StartHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type StopHook = Box<dyn FnOnce(Instant) -> BoxFuture<'static, Result<()>> + Send>;

struct Component {
    name: String,
    on_start: Option<StartHook>,
    on_stop: Option<StopHook>,
}

/// Where the coordinator is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing started yet.
    Idle,
    /// `run_all` has run (possibly failing part-way).
    Running,
    /// `shutdown_all` has run; further calls are no-ops.
    Stopped,
}

/// Components that did not stop cleanly.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub failures: Vec<(String, TwinportError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered set of (start, stop) hooks.
pub struct Lifecycle {
    components: Vec<Component>,
    started: usize,
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.components.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("Lifecycle")
            .field("components", &names)
            .field("started", &self.started)
            .field("state", &self.state)
            .finish()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            started: 0,
            state: LifecycleState::Idle,
        }
    }

    /// Add a component.
    ///
    /// `on_stop` receives the shared shutdown deadline.
    pub fn register<S, SF, T, TF>(
        &mut self,
        name: impl Into<String>,
        on_start: S,
        on_stop: T,
    ) -> &mut Self
    where
        S: FnOnce() -> SF + Send + 'static,
        SF: Future<Output = Result<()>> + Send + 'static,
        T: FnOnce(Instant) -> TF + Send + 'static,
        TF: Future<Output = Result<()>> + Send + 'static,
    {
        self.components.push(Component {
            name: name.into(),
            on_start: Some(Box::new(move || on_start().boxed())),
            on_stop: Some(Box::new(move |deadline| on_stop(deadline).boxed())),
        });
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Run every start hook in registration order.
    ///
    /// Stops at the first failure and returns it; the remaining components are
    /// never started.
    pub async fn run_all(&mut self) -> Result<()> {
        if self.state != LifecycleState::Idle {
            return Err(TwinportError::Config {
                message: "lifecycle has already been run".to_string(),
            });
        }
        self.state = LifecycleState::Running;

        for component in &mut self.components {
            let Some(on_start) = component.on_start.take() else {
                continue;
            };
            info!("Starting {}", component.name);
            if let Err(e) = on_start().await {
                error!("Failed to start {}: {}", component.name, e);
                return Err(e);
            }
            self.started += 1;
            info!("{} started", component.name);
        }
        Ok(())
    }

    /// Stop every started component in reverse start order.
    ///
    /// All stops share a deadline `timeout` from now. A stop that fails or
    /// overruns it is logged and recorded, and the remaining stops still run.
    pub async fn shutdown_all(&mut self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.state == LifecycleState::Stopped {
            return report;
        }
        self.state = LifecycleState::Stopped;

        let deadline = Instant::now() + timeout;
        for component in self.components[..self.started].iter_mut().rev() {
            let Some(on_stop) = component.on_stop.take() else {
                continue;
            };
            info!("Stopping {}", component.name);
            match tokio::time::timeout_at(deadline, on_stop(deadline)).await {
                Ok(Ok(())) => info!("{} stopped", component.name),
                Ok(Err(e)) => {
                    warn!("{} did not stop cleanly: {}", component.name, e);
                    report.failures.push((component.name.clone(), e));
                }
                Err(_) => {
                    let e = TwinportError::ShutdownTimeout {
                        component: component.name.clone(),
                        timeout,
                    };
                    warn!("{}", e);
                    report.failures.push((component.name.clone(), e));
                }
            }
        }
        self.started = 0;
        report
    }
}
