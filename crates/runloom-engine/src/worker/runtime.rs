//! Worker runtime: registration, heartbeat, polling, and recovery loops
//!
//! A worker is a long-running process that claims queue items, dispatches
//! them, and reports results. Workers hold no durable state; the
//! authoritative claim is the `claimed_by` column, and any worker can
//! recover any other worker's orphaned work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineError};
use crate::graph::GraphProvider;
use crate::persistence::{QueueItem, WorkerInfo, WorkerStatus, WorkflowStore};

use super::dispatch::Dispatcher;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker identity (hostname-pid-random when generated)
    pub id: String,

    pub hostname: String,

    pub version: Option<String>,

    /// Node types this worker accepts; `*` accepts anything
    pub capabilities: Vec<String>,

    /// Concurrent step executions this worker allows
    pub max_concurrent_steps: usize,

    pub heartbeat_interval: Duration,

    pub poll_interval: Duration,

    /// Staleness threshold for orphan recovery, and the recovery loop's
    /// cadence
    pub worker_timeout: Duration,

    /// How long shutdown waits for in-flight work to drain
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        let suffix = Uuid::now_v7().simple().to_string();
        Self {
            id: format!("{hostname}-{pid}-{}", &suffix[..8]),
            hostname,
            version: None,
            capabilities: vec!["*".to_string()],
            max_concurrent_steps: 10,
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            worker_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Worker runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Draining,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with work in flight")]
    ShutdownTimeout,
}

/// A stateless worker over the engine
///
/// # Example
///
/// ```ignore
/// use runloom_engine::prelude::*;
///
/// let worker = Worker::new(engine, graphs, WorkerConfig::default());
/// worker.start().await?;
/// // ...
/// worker.stop().await?;
/// ```
pub struct Worker {
    engine: Engine,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    /// Claimed items currently being processed: item id -> optional step id
    in_flight: Arc<DashMap<Uuid, Option<Uuid>>>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    state: RwLock<WorkerState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(engine: Engine, graphs: Arc<dyn GraphProvider>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            graphs,
            config.capabilities.clone(),
        ));

        Self {
            engine,
            dispatcher,
            permits: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            config,
            in_flight: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
            state: RwLock::new(WorkerState::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn current_step_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Register with the store and start the heartbeat, poll, and recovery
    /// loops. Registration failure is fatal.
    #[instrument(skip(self), fields(worker_id = %self.config.id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        if *self.state.read() == WorkerState::Running {
            return Err(WorkerError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.id,
            capabilities = ?self.config.capabilities,
            max_concurrent_steps = self.config.max_concurrent_steps,
            "starting worker"
        );

        self.engine
            .register_worker(&WorkerInfo {
                id: self.config.id.clone(),
                hostname: self.config.hostname.clone(),
                pid: Some(std::process::id() as i32),
                version: self.config.version.clone(),
                capabilities: self.config.capabilities.clone(),
                status: WorkerStatus::Idle,
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                max_concurrent_steps: self.config.max_concurrent_steps as i32,
                current_step_count: 0,
                total_steps_executed: 0,
                total_steps_failed: 0,
            })
            .await?;

        *self.state.write() = WorkerState::Running;

        let mut handles = self.handles.lock();
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_recovery_loop());

        Ok(())
    }

    /// Stop polling, drain in-flight work (bounded by the shutdown
    /// deadline), and unregister.
    #[instrument(skip(self), fields(worker_id = %self.config.id))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        if *self.state.read() == WorkerState::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.id, "initiating graceful shutdown");
        *self.state.write() = WorkerState::Draining;
        if let Err(e) = self
            .engine
            .store()
            .set_worker_status(&self.config.id, WorkerStatus::Draining)
            .await
        {
            warn!("failed to mark worker draining: {e}");
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut timed_out = false;
        loop {
            if self.permits.available_permits() == self.config.max_concurrent_steps {
                debug!("all in-flight work drained");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight.len(),
                    "shutdown deadline reached with work in flight"
                );
                timed_out = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = self.engine.unregister_worker(&self.config.id).await {
            warn!("failed to unregister worker: {e}");
        }
        *self.state.write() = WorkerState::Stopped;

        info!(worker_id = %self.config.id, "worker stopped");
        if timed_out {
            // Peers will recover the orphaned claims after worker_timeout
            return Err(WorkerError::ShutdownTimeout);
        }
        Ok(())
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let worker_id = self.config.id.clone();
        let interval = self.config.heartbeat_interval;
        let in_flight = Arc::clone(&self.in_flight);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = in_flight.len() as i32;
                        if let Err(e) = engine.update_worker_heartbeat(&worker_id, load).await {
                            error!("heartbeat failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("heartbeat loop exited");
        })
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let worker_id = self.config.id.clone();
        let interval = self.config.poll_interval;
        let max_concurrent = self.config.max_concurrent_steps;
        let in_flight = Arc::clone(&self.in_flight);
        let permits = Arc::clone(&self.permits);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let available = max_concurrent.saturating_sub(in_flight.len());
                        if available == 0 {
                            continue;
                        }

                        let items = match engine.claim_work(&worker_id, available).await {
                            Ok(items) => items,
                            Err(e) => {
                                // Store outage; the next tick retries
                                error!("claim failed: {e}");
                                continue;
                            }
                        };

                        for item in items {
                            let permit = match Arc::clone(&permits).try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };

                            in_flight.insert(item.id, item.step_id);
                            let engine = engine.clone();
                            let dispatcher = Arc::clone(&dispatcher);
                            let worker_id = worker_id.clone();
                            let in_flight = Arc::clone(&in_flight);

                            tokio::spawn(async move {
                                process_item(&engine, &dispatcher, &worker_id, item, &in_flight)
                                    .await;
                                drop(permit);
                            });
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("poll loop exited");
        })
    }

    fn spawn_recovery_loop(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let timeout = self.config.worker_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeout);
            // The immediate first tick would sweep on startup with nothing
            // stale yet; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.recover_orphaned_work(timeout).await {
                            error!("orphan recovery failed: {e}");
                        }
                        if let Err(e) = engine.recover_failed_runs(timeout).await {
                            error!("run recovery failed: {e}");
                        }
                        if let Err(e) = engine.fail_timed_out_runs().await {
                            error!("timeout sweep failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("recovery loop exited");
        })
    }
}

/// Dispatch one claimed item and report its result.
///
/// A dispatch error leaves the item claimed: orphan recovery releases it
/// once the claim goes stale. A stale claim on completion means another
/// worker already owns the item; the result is dropped.
async fn process_item(
    engine: &Engine,
    dispatcher: &Dispatcher,
    worker_id: &str,
    item: QueueItem,
    in_flight: &DashMap<Uuid, Option<Uuid>>,
) {
    let item_id = item.id;

    match dispatcher.dispatch(&item).await {
        Ok(result) => match engine.complete_work(worker_id, item_id, &result).await {
            Ok(_) => {}
            Err(EngineError::StaleClaim(_)) => {
                warn!(%item_id, "claim was taken over; dropping result");
            }
            Err(e) => {
                error!(%item_id, "failed to complete work item: {e}");
            }
        },
        Err(e) => {
            warn!(%item_id, "aborting item, recovery will release it: {e}");
        }
    }

    in_flight.remove(&item_id);
}
