mod activity;
mod acl;
mod config;
mod dial;
mod error;
mod forward;
mod registry;
mod server;
mod shutdown;
mod tunnel;

use crate::acl::AccessControlList;
use crate::config::{Cli, ProxyConfig};
use crate::registry::{spawn_status_monitor, ConnectionRegistry};
use crate::server::ProxyShared;
use crate::shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownState};
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fwdproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args);

    let acl = AccessControlList::from_config(&config.allowed_ips);
    if acl.is_empty() {
        warn!("Allow-list is empty: every client is allowed");
    } else {
        info!(
            "Allowed client patterns: {}",
            acl.patterns()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let state = Arc::new(ShutdownState::new());
    let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&state)));
    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&state),
        Arc::clone(&registry),
        config.grace_period,
        config.hard_timeout,
    ));
    coordinator.install_panic_hook();

    if let Some(every) = config.stats_interval {
        spawn_status_monitor(Arc::clone(&registry), every);
    }

    let shared = Arc::new(ProxyShared {
        acl,
        registry,
        idle_timeout: config.idle_timeout,
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Forward proxy listening on http://{}", config.listen_addr);

    let mut server = tokio::task::spawn(server::serve(listener, shared, Arc::clone(&state)));

    tokio::select! {
        _ = shutdown_signal() => {
            coordinator.initiate("signal");
        }
        res = &mut server => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task failed: {}", e),
            }
            coordinator.initiate("listener stopped");
        }
    }

    coordinator.wait().await;

    if !server.is_finished() {
        server.abort();
    }
    info!("Shutdown complete");
    Ok(())
}
