//! procmond — Remote Process Monitor Daemon
//!
//! Wires the long-lived components together: configuration, credential
//! store, process probe, registry, history, groups, the sampler task, and
//! the request server. SIGINT/SIGTERM trigger a graceful shutdown.

use anyhow::{Context, Result};
use procmond::auth::CredentialStore;
use procmond::groups::GroupIndex;
use procmond::history::HistoryRing;
use procmond::probe::{ProcProbe, ProcessProbe};
use procmond::registry::Registry;
use procmond::server::{Server, ServerState};
use procmond::{config, sampler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;

    let log_level: tracing::Level = config
        .system
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(log_level)
        .compact()
        .init();

    info!("procmond v{} starting...", env!("CARGO_PKG_VERSION"));

    // A bad credential path must fail now, not on the first login.
    let credentials = Arc::new(
        CredentialStore::open(&config.auth.credentials_file)
            .context("failed to open credential store")?,
    );

    let probe: Arc<dyn ProcessProbe> = Arc::new(ProcProbe::new());
    let ncpu = Registry::detect_ncpu();
    info!("monitoring with {ncpu} CPUs");

    let registry = Arc::new(Registry::new(probe.clone(), ncpu));
    let history = Arc::new(HistoryRing::new(
        config.history.max_entries,
        config.history.max_tracked,
    ));
    let groups = Arc::new(GroupIndex::new(probe.clone()));

    for seed in &config.groups {
        let id = groups
            .create_group(&seed.name, seed.priority, &seed.description)
            .await;
        info!("created group {id} ({}) from config", seed.name);
    }

    let cancel = CancellationToken::new();

    // Sampler task: keeps the registry, group stats, and history fresh.
    let sampler_handle = tokio::spawn(sampler::run(
        registry.clone(),
        groups.clone(),
        history.clone(),
        Duration::from_millis(config.sampler.interval_ms),
        cancel.clone(),
    ));

    // Signal handling for graceful shutdown.
    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT, initiating graceful shutdown...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown...");
            }
        }
        shutdown_token.cancel();
    });

    // The listen socket is bound before the server task starts so a busy
    // port is a startup failure with a non-zero exit.
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = Server::bind(&addr).await?;

    let state = Arc::new(ServerState {
        registry,
        history,
        groups,
        credentials,
        probe,
    });
    Server::new(state, config.server.max_clients)
        .run(listener, cancel.clone())
        .await;

    // The server loop exits only on cancellation; let the sampler finish
    // its current iteration before reporting a clean shutdown.
    let _ = sampler_handle.await;
    info!("shutdown complete");
    Ok(())
}
