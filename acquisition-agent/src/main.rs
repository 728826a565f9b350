//! Acquisition Agent - instrument polling node
//!
//! Starts, in order:
//! - the log sink (when this process hosts it)
//! - node identification
//! - the work queue (bound first so discovery can advertise its port)
//! - the multicast discovery responder
//! - the dispatcher loop, which runs until the process is stopped

use acquisition_agent::discovery::{DiscoveryResponder, NodeIdentity};
use acquisition_agent::{AgentConfig, CommandSync, Dispatcher, LogClient, LogSink};
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("acquisition_agent=info")),
        )
        .init();

    info!("Acquisition Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load configuration")?;

    if config.log_sink.serve {
        let sink = LogSink::bind(config.log_sink.address, &config.log_sink.log_file)
            .await
            .context("Failed to start log sink")?;
        tokio::spawn(sink.run());
    }

    let log = match LogClient::connect(config.log_sink.address).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Log sink unreachable, logging locally only: {:#}", e);
            LogClient::local_only()
        }
    };

    let (identity, network) = NodeIdentity::discover().await;

    let sync = CommandSync::from_config(&config.sync).context("Invalid sync configuration")?;
    let dispatcher = Dispatcher::bind(&config, sync, identity.clone(), log.clone())
        .await
        .context("Failed to start dispatcher")?;
    let work_addr = dispatcher.local_addr()?;

    if config.discovery.enabled {
        let share_secret = config
            .discovery
            .share_secret
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!("Discovery share secret: {}", share_secret);

        match DiscoveryResponder::bind(
            &config.discovery,
            identity,
            work_addr.port(),
            network,
            share_secret,
            config.time_sync.clone(),
        )
        .await
        {
            Ok(responder) => {
                tokio::spawn(responder.run());
            }
            // The agent stays useful without discovery
            Err(e) => error!("Discovery disabled: {:#}", e),
        }
    }

    log.info("main", format!("Agent ready on {}", work_addr));

    dispatcher.run().await.context("Dispatcher stopped")
}
