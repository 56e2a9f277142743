//! Lifecycle factory: builds and starts iterators per entity type, gated on
//! worker-enablement configuration.
//!
//! The factory owns no scheduling logic; it wires an engine to either a
//! long-running loop task or a dedicated fixed-rate pump runtime.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::{IteratorBuilder, PersistenceIterator};
use crate::entity::IterableEntity;
use crate::error::{IteratorError, Result};
use crate::types::ProcessMode;

/// Decides which entity types get a running iterator on this process.
pub trait WorkerActivationPolicy: Send + Sync {
    fn is_active(&self, entity_type: &str) -> bool;
}

impl<F> WorkerActivationPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_active(&self, entity_type: &str) -> bool {
        self(entity_type)
    }
}

/// Options for pump iterators driven by a dedicated thread pool.
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Fixed rate at which sweeps run.
    pub interval: Duration,
    /// Worker threads in the dedicated runtime; handler tasks run there too.
    pub pool_size: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pool_size: 2,
        }
    }
}

/// A loop-mode iterator running on the ambient runtime.
pub struct LoopIterator<T: IterableEntity> {
    engine: PersistenceIterator<T>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T: IterableEntity> LoopIterator<T> {
    pub fn engine(&self) -> &PersistenceIterator<T> {
        &self.engine
    }

    pub fn wakeup(&self) {
        self.engine.wakeup();
    }

    /// Signal shutdown and wait for the loop to finish its current sweep.
    /// In-flight handler tasks are not aborted.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Hard-cancel the loop task without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// A pump-mode iterator swept at a fixed rate on its own named runtime.
pub struct PumpIterator<T: IterableEntity> {
    engine: PersistenceIterator<T>,
    shutdown: watch::Sender<bool>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl<T: IterableEntity> PumpIterator<T> {
    pub fn engine(&self) -> &PersistenceIterator<T> {
        &self.engine
    }

    /// Signal shutdown and release the dedicated runtime in the background
    /// (safe to call from async context).
    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl<T: IterableEntity> Drop for PumpIterator<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Builds and starts iterators, consulting the activation policy per entity
/// type.
pub struct IteratorFactory<A> {
    activation: A,
}

impl<A: WorkerActivationPolicy> IteratorFactory<A> {
    pub fn new(activation: A) -> Self {
        Self { activation }
    }

    /// Start a loop-mode iterator for `entity_type`, or `None` when the
    /// worker is disabled. Must be called within a tokio runtime.
    pub fn create_iterator<T: IterableEntity>(
        &self,
        entity_type: &str,
        builder: IteratorBuilder<T>,
    ) -> Result<Option<LoopIterator<T>>> {
        if !self.activation.is_active(entity_type) {
            info!(entity_type, "iterator not started: worker disabled by configuration");
            return Ok(None);
        }
        let engine = builder.mode(ProcessMode::Loop).build()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(entity_type, iterator = %engine.name(), "starting loop iterator");
        let task = tokio::spawn(engine.clone().run(shutdown_rx));
        Ok(Some(LoopIterator {
            engine,
            shutdown,
            task,
        }))
    }

    /// Start a pump-mode iterator swept every `options.interval` on a
    /// dedicated runtime named after the iterator, or `None` when the worker
    /// is disabled.
    pub fn create_pump_iterator<T: IterableEntity>(
        &self,
        options: PumpOptions,
        entity_type: &str,
        builder: IteratorBuilder<T>,
    ) -> Result<Option<PumpIterator<T>>> {
        if !self.activation.is_active(entity_type) {
            info!(entity_type, "iterator not started: worker disabled by configuration");
            return Ok(None);
        }
        let engine = builder.mode(ProcessMode::Pump).build()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.pool_size.max(1))
            .thread_name(format!("iterator-{}", engine.name()))
            .enable_all()
            .build()
            .map_err(|e| {
                IteratorError::Config(format!("could not build the iterator runtime: {e}"))
            })?;

        info!(entity_type, iterator = %engine.name(), "starting pump iterator");
        let pump = engine.clone();
        let interval = options.interval;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = pump.process_pump().await {
                            error!(iterator = %pump.name(), error = %err, "pump sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Some(PumpIterator {
            engine,
            shutdown,
            runtime: Some(runtime),
        }))
    }
}
