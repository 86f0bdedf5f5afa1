//! Background runtime: drives the dispatcher and the retention sweeper on
//! their own timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::producer::JobProducer;
use super::registry::ExecutorRegistry;
use super::stats::{DispatcherStats, QueueDepth};
use super::store::JobStore;
use super::sweeper::RetentionSweeper;
use crate::config::{ConfigError, EngineConfig};

/// A configured engine, not yet running.
pub struct JobEngine<S: JobStore + ?Sized + 'static> {
    dispatcher: Dispatcher<S>,
    sweeper: Arc<RetentionSweeper<S>>,
    config: EngineConfig,
}

impl<S: JobStore + ?Sized + 'static> JobEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: ExecutorRegistry,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(store.clone(), registry, &config),
            sweeper: Arc::new(RetentionSweeper::new(store, config.retention_window)),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn sweeper(&self) -> &RetentionSweeper<S> {
        &self.sweeper
    }

    /// Start the dispatcher and sweeper loops on the current Tokio runtime.
    pub fn spawn(self) -> JobEngineHandle<S> {
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatch_task = tokio::spawn(dispatch_loop(
            self.dispatcher.clone(),
            self.config.dispatch_interval,
            wake.clone(),
            shutdown_rx.clone(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(
            self.sweeper.clone(),
            self.config.sweep_interval,
            shutdown_rx,
        ));

        info!(
            max_retries = self.config.max_retries,
            dispatch_interval_ms = self.config.dispatch_interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            "job engine started"
        );

        JobEngineHandle {
            dispatcher: self.dispatcher,
            wake,
            shutdown: shutdown_tx,
            tasks: vec![dispatch_task, sweep_task],
        }
    }
}

/// Handle to control a running engine.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops
/// both loops, without waiting for them.
pub struct JobEngineHandle<S: JobStore + ?Sized + 'static> {
    dispatcher: Dispatcher<S>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: JobStore + ?Sized + 'static> JobEngineHandle<S> {
    /// Run a dispatch cycle now instead of at the next tick. Wakes coalesce.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// A producer on the engine's store that wakes the dispatcher on submit.
    pub fn producer(&self) -> JobProducer<S> {
        JobProducer::new(self.dispatcher.store().clone()).with_wake(self.wake.clone())
    }

    /// Current queue depth.
    pub async fn queue_depth(&self) -> Result<QueueDepth, super::store::JobStoreError> {
        QueueDepth::collect(self.dispatcher.store().as_ref()).await
    }

    /// Request graceful shutdown and wait for both loops to stop.
    ///
    /// A dispatch cycle in progress runs to completion first. Jobs it could not
    /// finish stay `Running` and are recovered by the staleness check later.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "job engine task ended abnormally");
            }
        }
        info!("job engine stopped");
    }
}

async fn dispatch_loop<S: JobStore + ?Sized + 'static>(
    dispatcher: Dispatcher<S>,
    period: Duration,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("job dispatcher started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(err) = dispatcher.run_cycle().await {
            error!(error = %err, "dispatch cycle aborted; retrying on next tick");
        }
    }

    info!("job dispatcher stopped");
}

async fn sweep_loop<S: JobStore + ?Sized + 'static>(
    sweeper: Arc<RetentionSweeper<S>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = sweeper.sweep().await {
            error!(error = %err, "retention sweep failed; retrying on next tick");
            continue;
        }
        match QueueDepth::collect(sweeper.store().as_ref()).await {
            Ok(depth) => info!(
                pending = depth.pending,
                running = depth.running,
                completed = depth.completed,
                failed = depth.failed,
                "job queue depth"
            ),
            Err(err) => error!(error = %err, "failed to collect queue depth"),
        }
    }
}
