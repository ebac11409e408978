//! Application wiring and lifecycle.
//!
//! 1. **Build**: broker, gateway client, worker and metrics from [`Config`]
//! 2. **Start**: the worker's router subscribes every binding
//! 3. **Serve**: the HTTP listener binds only once the router is running
//! 4. **Shutdown**: the HTTP server drains, then the router stops after its
//!    in-flight messages

use crate::clients::{ClientError, GatewayClient};
use crate::config::{BrokerBackend, Config};
use crate::http::{self, AppState};
use crate::worker::{BrokerHandle, Clients, Worker};
use courier_core::broker::BrokerError;
use courier_core::memory::{MemoryQueue, MemoryStream, QueueConfig};
use courier_runtime::metrics::{MetricsError, MetricsExporter};
use courier_runtime::router::RouterError;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Failure to start or run the service.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Broker could not be created.
    #[error("Broker setup failed: {0}")]
    Broker(#[from] BrokerError),

    /// The selected backend is not compiled in.
    #[error("Broker backend '{0}' is not available in this build")]
    BackendUnavailable(&'static str),

    /// Gateway client could not be created.
    #[error("Gateway client setup failed: {0}")]
    Client(#[from] ClientError),

    /// Router wiring or subscription failed.
    #[error("Router failed: {0}")]
    Router(#[from] RouterError),

    /// Metrics recorder could not be installed.
    #[error("Metrics setup failed: {0}")]
    Metrics(#[from] MetricsError),

    /// The HTTP listener could not bind.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address
        addr: String,
        /// I/O error
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server failed while running.
    #[error("HTTP server failed: {0}")]
    Server(#[source] std::io::Error),

    /// The worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// The assembled service.
pub struct App {
    config: Config,
    worker: Worker,
    metrics: Option<MetricsExporter>,
}

impl App {
    /// Build every component described by `config`.
    ///
    /// Installs the global metrics recorder when metrics are enabled, so call
    /// this once per process.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a component cannot be created.
    pub fn build(config: Config) -> Result<Self, SetupError> {
        let broker = broker(&config)?;
        let gateway = Arc::new(GatewayClient::new(config.gateway_addr.clone())?);
        let clients = Clients {
            receipts: gateway.clone(),
            spreadsheets: gateway,
        };
        let worker = Worker::new(broker, clients, config.worker())?;

        let metrics = if config.metrics_enabled {
            Some(MetricsExporter::install()?)
        } else {
            None
        };

        tracing::info!(
            backend = ?config.broker.backend,
            gateway = %config.gateway_addr,
            metrics = config.metrics_enabled,
            "Application built"
        );

        Ok(Self::from_parts(config, worker, metrics))
    }

    /// Assemble from pre-built parts.
    #[must_use]
    pub const fn from_parts(config: Config, worker: Worker, metrics: Option<MetricsExporter>) -> Self {
        Self {
            config,
            worker,
            metrics,
        }
    }

    /// Run until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the router cannot start, the listener cannot
    /// bind or the server fails.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SetupError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            config,
            worker,
            metrics,
        } = self;

        let state = AppState::new(worker.sender(), metrics);
        let mut running = worker.running();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let worker_task = tokio::spawn(worker.run(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        }));

        if !running.wait().await {
            // The router returned before running; its error explains why.
            return join_worker(worker_task).await;
        }

        let addr = config.server_addr();
        let served = match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!(address = %addr, "HTTP server listening");
                axum::serve(listener, http::router(state))
                    .with_graceful_shutdown(shutdown)
                    .await
                    .map_err(SetupError::Server)
            },
            Err(source) => Err(SetupError::Bind { addr, source }),
        };

        tracing::info!("HTTP server stopped, stopping worker");
        stop_tx.send_replace(true);
        let stopped = join_worker(worker_task).await;

        served?;
        stopped?;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}

async fn join_worker(
    task: tokio::task::JoinHandle<Result<(), RouterError>>,
) -> Result<(), SetupError> {
    match task.await {
        Ok(result) => result.map_err(SetupError::from),
        Err(e) => Err(SetupError::Worker(e.to_string())),
    }
}

fn broker(config: &Config) -> Result<BrokerHandle, SetupError> {
    match config.broker.backend {
        BrokerBackend::MemoryStream => Ok(BrokerHandle::new(Arc::new(MemoryStream::default()))),
        BrokerBackend::MemoryQueue => Ok(BrokerHandle::new(Arc::new(MemoryQueue::new(
            QueueConfig {
                capacity: config.broker.queue_capacity,
                ..QueueConfig::default()
            },
        )))),
        BrokerBackend::Redpanda => redpanda(config),
    }
}

#[cfg(feature = "redpanda")]
fn redpanda(config: &Config) -> Result<BrokerHandle, SetupError> {
    let broker = courier_redpanda::RedpandaBroker::new(&config.broker.redpanda_brokers)?;
    Ok(BrokerHandle::new(Arc::new(broker)))
}

#[cfg(not(feature = "redpanda"))]
fn redpanda(_config: &Config) -> Result<BrokerHandle, SetupError> {
    Err(SetupError::BackendUnavailable("redpanda"))
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a signal handler cannot be installed the error is logged and only the
/// other signal is waited for.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
