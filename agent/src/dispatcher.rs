//! Fan-out of mining work across every device on the host
//!
//! ## Architecture
//!
//! ```text
//! dispatch() → enumerate devices (once) → WorkerHandle per device
//!      ↓                                          ↓
//!  one task per handle  →  ProcessRunner  →  WorkResult
//!      ↓
//!  join all → aggregate → Summary (sorted by device id)
//! ```
//!
//! A failing device never aborts its siblings: launch failures, timeouts,
//! cancellations and even panicking tasks are folded into failed
//! [`WorkResult`]s, and `dispatch()` only returns once every task has settled.

use crate::aggregate::{aggregate, any_cancelled, RoundFlags, Summary};
use crate::device::{Device, HostCapabilities, Inventory};
use crate::errors::{AgentError, Result};
use crate::runtime::RuntimeContext;
use crate::stats::DispatchStats;
use crate::worker::types::validate_iterations;
use crate::worker::{WorkRequest, WorkResult, WorkerHandle, WorkerSettings};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Issues one work request per device and joins the results.
pub struct Dispatcher {
    context: RuntimeContext,
    settings: WorkerSettings,
    workers: Vec<Arc<WorkerHandle>>,
    degraded: bool,
    enumerations: AtomicUsize,
    stats: Arc<DispatchStats>,
    released: bool,
}

/// Decrements the active-worker gauge even if the task panics.
struct ActiveWorker(Arc<DispatchStats>);

impl ActiveWorker {
    fn start(stats: Arc<DispatchStats>) -> Self {
        stats.start_worker();
        Self(stats)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.finish_worker();
    }
}

impl Dispatcher {
    /// Create a dispatcher that owns `context` until [`shutdown`](Self::shutdown).
    ///
    /// # Example
    /// ```no_run
    /// use fleet_agent::{Dispatcher, FleetConfig, RuntimeContext};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = FleetConfig::default();
    /// let context = RuntimeContext::init(&config)?;
    /// let mut dispatcher = Dispatcher::new(context, config.worker_settings());
    ///
    /// let summary = dispatcher.dispatch(1000, None).await?;
    /// println!("{} of {} devices succeeded", summary.successes, summary.total_gpus_used);
    ///
    /// dispatcher.shutdown();
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(context: RuntimeContext, settings: WorkerSettings) -> Self {
        Self {
            context,
            settings,
            workers: Vec::new(),
            degraded: false,
            enumerations: AtomicUsize::new(0),
            stats: Arc::new(DispatchStats::new()),
            released: false,
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    pub fn devices(&self) -> Vec<Device> {
        self.workers.iter().map(|w| w.device()).collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// How many times the inventory source has been queried
    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Query the inventory source.
    ///
    /// Zero devices or a failed query yield a degraded inventory with one
    /// logical slot; only an inactive context is an error.
    #[instrument(skip(self), fields(inventory = self.context.inventory_name()))]
    pub async fn enumerate_devices(&self) -> Result<Inventory> {
        self.context.ensure_active()?;
        self.enumerations.fetch_add(1, Ordering::Relaxed);

        let queried = self
            .context
            .available_slots()
            .await
            .and_then(Inventory::from_count);

        let inventory = match queried {
            Ok(inventory) if inventory.degraded => {
                let host = HostCapabilities::detect();
                warn!(
                    cpu_cores = host.cpu_cores,
                    "No accelerators found, falling back to a single logical slot"
                );
                inventory
            }
            Ok(inventory) => inventory,
            Err(e @ AgentError::RuntimeUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    "Device inventory query failed, falling back to a single logical slot"
                );
                Inventory::degraded()
            }
        };

        info!(
            devices = inventory.len(),
            degraded = inventory.degraded,
            "Devices enumerated"
        );

        Ok(inventory)
    }

    /// Run `iterations_per_device` on every device and wait for all of them.
    ///
    /// # Errors
    /// * `AgentError::InvalidArgument` - `iterations_per_device` is zero or the timeout is zero
    /// * `AgentError::RuntimeUnavailable` - the context has been shut down
    ///
    /// Per-device failures never surface here; they are entries in the summary.
    pub async fn dispatch(
        &mut self,
        iterations_per_device: u64,
        timeout: Option<Duration>,
    ) -> Result<Summary> {
        self.dispatch_with_cancel(iterations_per_device, timeout, CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but `cancel` terminates every
    /// outstanding run. The dispatcher still waits for each termination and
    /// returns a summary marked `partial`.
    ///
    /// Dropping the returned future also terminates every outstanding run.
    #[instrument(skip(self, timeout, cancel), fields(dispatch_id = tracing::field::Empty))]
    pub async fn dispatch_with_cancel(
        &mut self,
        iterations_per_device: u64,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Summary> {
        validate_iterations(iterations_per_device)?;
        if timeout == Some(Duration::ZERO) {
            return Err(AgentError::InvalidArgument(
                "timeout must be greater than zero".into(),
            ));
        }
        self.context.ensure_active()?;

        if self.workers.is_empty() {
            self.setup_workers().await?;
        }

        let dispatch_id = Uuid::new_v4();
        tracing::Span::current().record("dispatch_id", tracing::field::display(dispatch_id));

        info!(
            devices = self.workers.len(),
            iterations = iterations_per_device,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Dispatching work to all devices"
        );

        // Cancelled when this future completes or is dropped; `cancel` still propagates.
        let round = cancel.child_token();
        let _abort_on_drop = round.clone().drop_guard();

        let start = Instant::now();
        let mut requests = Vec::with_capacity(self.workers.len());
        let mut tasks = Vec::with_capacity(self.workers.len());

        for worker in &self.workers {
            let request = WorkRequest::new(worker.device_id(), iterations_per_device)
                .with_timeout(timeout);

            let worker = Arc::clone(worker);
            let stats = Arc::clone(&self.stats);
            let cancel = round.clone();
            let task_request = request.clone();

            let task = tokio::spawn(
                async move {
                    let _active = ActiveWorker::start(stats);
                    let started = Instant::now();

                    match worker.run(&task_request, &cancel).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(device = %worker.device(), error = %e, "Worker run failed");
                            WorkResult::from_error(&task_request, &e, started.elapsed())
                        }
                    }
                }
                .in_current_span(),
            );

            requests.push(request);
            tasks.push(task);
        }

        let outcomes = join_all(tasks).await;

        let results: Vec<WorkResult> = requests
            .iter()
            .zip(outcomes)
            .map(|(request, outcome)| match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!(device_id = request.device_id, error = %e, "Worker task did not complete");
                    WorkResult::panicked(request, e.to_string())
                }
            })
            .collect();

        let flags = RoundFlags {
            degraded: self.degraded,
            partial: any_cancelled(&results),
        };
        let summary = aggregate(dispatch_id, results, flags);
        self.stats.record_round(&summary);

        info!(
            total = summary.total_gpus_used,
            successes = summary.successes,
            failures = summary.failures,
            partial = summary.partial,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dispatch round complete"
        );

        Ok(summary)
    }

    async fn setup_workers(&mut self) -> Result<()> {
        let inventory = self.enumerate_devices().await?;

        self.degraded = inventory.degraded;
        self.workers = inventory
            .devices
            .into_iter()
            .map(|device| Arc::new(WorkerHandle::new(device, &self.settings)))
            .collect();

        info!(
            workers = self.workers.len(),
            binary = %self.settings.binary_path.display(),
            "Workers created"
        );

        Ok(())
    }

    /// Release the runtime context.
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.workers.clear();
        self.context.shutdown();
        self.stats.print_summary();
        info!("Dispatcher shut down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.released {
            warn!("Dispatcher dropped without shutdown, releasing runtime context");
            self.release();
        }
    }
}
