use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use jdwp_proxy::{JdwpProxyFactory, ProxyConfig, ProxyServer, Role};
use state_hub::{ClientChangeHandlerFactory, ClientStateChangeHub, HandlerResult, Notification};

#[derive(Parser)]
#[command(name = "jdwp-proxy")]
#[command(about = "Shared JDWP proxy endpoint with automatic leader failover")]
struct Args {
    /// TOML config file (defaults and JDWP_PROXY_* env vars apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to share, overriding the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Logs every change to the set of attached debuggee pids.
struct LogAttachedPids;

impl ClientChangeHandlerFactory for LogAttachedPids {
    fn client_list_changed(&self, pids: &[u32]) -> Notification {
        let pids = pids.to_vec();
        Box::new(move || {
            info!("Debuggee pids with attached debuggers: {:?}", pids);
            HandlerResult::CONTINUE
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "jdwp_proxy=debug,state_hub=debug"
    } else {
        "jdwp_proxy=info,state_hub=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = ProxyConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.endpoint = jdwp_proxy::ListenEndpoint::new(config.endpoint.host(), port);
    }
    info!("Starting JDWP proxy on {}", config.endpoint);

    let client_hub = Arc::new(ClientStateChangeHub::new());
    let subscriber = {
        let client_hub = client_hub.clone();
        std::thread::Builder::new()
            .name("jdwp-client-log".to_string())
            .spawn(move || client_hub.run_subscriber(Arc::new(LogAttachedPids)))
            .context("Failed to spawn client tracker thread")?
    };

    let factory = JdwpProxyFactory::from_config(&config).with_client_hub(client_hub.clone());
    let directory = factory.directory();
    let mut server = ProxyServer::new(config.endpoint, factory)
        .with_reconnect_interval(config.reconnect_interval)
        .with_state_listener(move || {
            // The previous leader's debuggers are gone; republish from scratch.
            directory.publish_clients();
        });
    server
        .start()
        .with_context(|| format!("Failed to start proxy on {}", config.endpoint))?;

    if server.role() == Some(Role::Following) {
        info!("Another process owns {}; standing by", config.endpoint);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received shutdown signal, cleaning up...");

    tokio::task::spawn_blocking(move || {
        server.stop();
        client_hub.stop();
        if subscriber.join().is_err() {
            warn!("Client tracker thread panicked");
        }
    })
    .await
    .context("Shutdown task failed")?;

    info!("JDWP proxy stopped");
    Ok(())
}
