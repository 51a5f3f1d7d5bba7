//! Traffic Engineering Controller
//!
//! Wires the allocation engine to its surroundings:
//!
//! ```text
//!   flow monitor ──TCP/NDJSON──► FeedListener ──mpsc──► worker ──► AllocationEngine
//!                                                                      │
//!                                                           LoggingSouthbound
//! ```

pub mod config;
pub mod feed;
pub mod southbound;
pub mod topology;
pub mod worker;

pub use config::{ConfigError, ControllerConfig, TopologyConfig};
pub use feed::{ChannelFlowSource, FeedListener, WireEvent};
pub use southbound::LoggingSouthbound;

use std::future::Future;
use std::sync::Arc;
use te_engine::{AllocationEngine, StatsSnapshot, TopologyDirectory};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

/// Controller error types
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Controller instance
pub struct Controller {
    config: ControllerConfig,
    engine: Arc<AllocationEngine>,
    southbound: Arc<LoggingSouthbound>,
}

impl Controller {
    /// Build topology, southbound and engine from `config`
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let topology = config.topology.build()?;
        let southbound = Arc::new(
            LoggingSouthbound::new().with_resolver(Box::new(TopologyDirectory::from_topology(&topology))),
        );
        let engine = Arc::new(AllocationEngine::new(topology, southbound.clone()));
        Ok(Self {
            config,
            engine,
            southbound,
        })
    }

    pub fn engine(&self) -> Arc<AllocationEngine> {
        self.engine.clone()
    }

    pub fn southbound(&self) -> Arc<LoggingSouthbound> {
        self.southbound.clone()
    }

    /// Listen on the configured address until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<StatsSnapshot> {
        let (tx, source) = feed::channel(self.config.queue_size);
        let listener = FeedListener::bind(self.config.listen_addr, tx).await?;
        self.serve(listener, source, shutdown).await
    }

    /// Run the worker over `source` and the feed `listener` until
    /// `shutdown` resolves or the listener fails.
    pub async fn serve(
        self,
        listener: FeedListener,
        source: ChannelFlowSource,
        shutdown: impl Future<Output = ()>,
    ) -> Result<StatsSnapshot> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(worker::run_worker(self.engine.clone(), source, stop_rx));
        let mut feed = tokio::spawn(listener.run());

        let mut failure = None;
        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            res = &mut feed => match res {
                Ok(Err(e)) => {
                    error!(error = %e, "Flow feed failed");
                    failure = Some(ControllerError::Io(e));
                }
                Err(e) => failure = Some(ControllerError::Task(e)),
                Ok(Ok(())) => {}
            },
        }
        feed.abort();
        // receiver may already be gone if the worker exited
        let _ = stop_tx.send(true);
        let handled = worker.await?;
        info!(handled, "Controller stopped");

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(match Arc::try_unwrap(self.engine) {
            Ok(engine) => engine.shutdown(),
            Err(engine) => engine.stats().snapshot(),
        })
    }
}

/// Resolves once `signal` fires. A signal listener that cannot be set up
/// is logged and resolves too, so the controller stops instead of running
/// without a way to stop it.
pub async fn shutdown_on(signal: impl Future<Output = std::io::Result<()>>) {
    match signal.await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Cannot listen for shutdown signal, stopping"),
    }
}
