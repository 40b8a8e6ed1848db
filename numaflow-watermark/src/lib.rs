//! Watermark progression for a source vertex. The source publishes its watermarks as [WMB]s into
//! an offset-timeline store, the forwarder fetches the source watermark back and publishes it to
//! the downstream edge. When the source idles, idle watermarks are propagated downstream only
//! after the head idle WMB has converged.
//!
//! [WMB]: wmb::WMB

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::fetcher::WatermarkFetcher;
use crate::forwarder::SourceForwarder;
use crate::publisher::WatermarkPublisher;
use crate::source::generator::Generator;
use crate::store::WatermarkStore;
use crate::store::memory::InMemoryStore;

pub use self::error::{Error, Result};

mod error;

/// Settings loaded from the environment.
pub mod config;

/// Watermark Marker (WMB) codec and the head WMB convergence checker.
pub mod wmb;

/// Offset-timeline stores.
pub mod store;

pub mod publisher;

mod timeline;

pub mod fetcher;

/// Idle watermarks.
pub mod idle;

pub mod message;

pub mod source;

/// [forwarder] moves data and watermarks from the source to the downstream edge.
pub mod forwarder;

pub mod metrics;

/// Runs the generator source with its watermark progression until SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    let settings = Settings::load()?;
    info!(
        vertex = %settings.vertex_name,
        pipeline = %settings.pipeline_name,
        replica = settings.replica,
        partitions = settings.partitions,
        "Loaded settings"
    );

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = start_forwarder(cln_token, &settings).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    if let Err(e) = &result {
        error!(error = ?e, "Application error");
    }
    if let Ok(text) = metrics::metrics_text() {
        info!(metrics = %text, "Final metrics");
    }
    info!("Gracefully Exiting...");
    result
}

async fn start_forwarder(cln_token: CancellationToken, settings: &Settings) -> Result<()> {
    let source_store: Arc<dyn WatermarkStore> = Arc::new(InMemoryStore::new(format!(
        "{}-{}_SOURCE_OT",
        settings.pipeline_name, settings.vertex_name
    )));
    let edge_store: Arc<dyn WatermarkStore> = Arc::new(InMemoryStore::new(format!(
        "{}-{}-out_OT",
        settings.pipeline_name, settings.vertex_name
    )));

    let generator = Generator::new(settings, Arc::clone(&source_store), cln_token.clone());
    let fetcher = WatermarkFetcher::new(source_store).await?;
    let edge_publisher = WatermarkPublisher::new(
        format!("{}-{}", settings.vertex_name, settings.replica),
        edge_store,
        settings.partitions,
    );

    let mut forwarder = SourceForwarder::new(generator, settings, fetcher, edge_publisher);
    let forwarded = forwarder.start(cln_token.clone()).await;

    // stop the source even if forwarding failed
    cln_token.cancel();
    let mut generator = forwarder.into_source();
    generator.stop().await?;
    forwarded
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(error = ?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = ?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
