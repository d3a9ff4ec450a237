//! Agent Center CLI
//!
//! Accepts agent streams, resolves their identity with the manager,
//! forwards telemetry frames and reports connected hosts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent_center_control::{
    DetailIngestor, DisabledIdentityResolver, HeartbeatReporter, HttpIdentityResolver,
    IdentityResolver, IngestedFrame, ReporterConfig,
};
use agent_center_server::{serve_api, AgentCenter, ServerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "agent-center", about = "Agent connection center")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Listen address for agent streams
    #[arg(
        short = 'l',
        long,
        default_value = "0.0.0.0:6751",
        env = "AGENT_CENTER_LISTEN"
    )]
    listen: SocketAddr,

    /// Listen address for the manager-facing HTTP API
    #[arg(long, default_value = "0.0.0.0:6752", env = "AGENT_CENTER_API_LISTEN")]
    api_listen: SocketAddr,

    /// Manager base URL for identity resolution and host reports
    /// (e.g. http://manager:6701). Without it agents get tenant 0 / host 0
    #[arg(long, env = "AGENT_CENTER_MANAGER_URL")]
    manager_url: Option<String>,

    /// Maximum number of simultaneously connected agents
    #[arg(long, default_value_t = 1500, env = "AGENT_CENTER_CONN_LIMIT")]
    conn_limit: usize,

    /// Timeout for each identity resolution call, in seconds
    #[arg(long, default_value_t = 5)]
    auth_timeout_secs: u64,

    /// Default delivery timeout for API commands, in seconds
    #[arg(long, default_value_t = 10)]
    command_timeout_secs: u64,

    /// Interval between host reports to the manager, in seconds
    #[arg(long, default_value_t = 60)]
    report_interval_secs: u64,

    /// Capacity of the inbound frame pipeline
    #[arg(long, default_value_t = 4096)]
    pipeline_buffer: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "agent_center=debug,agent_center_server=debug,agent_center_control=debug".into()
        })
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "agent_center=info,agent_center_server=info,agent_center_control=info".into()
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Agent Center {} ({})", env!("GIT_TAG"), env!("GIT_HASH"));
    info!("Listen: {}", cli.listen);
    info!("API: {}", cli.api_listen);
    info!("Connection limit: {}", cli.conn_limit);

    let auth_timeout = Duration::from_secs(cli.auth_timeout_secs);
    let resolver: Arc<dyn IdentityResolver> = match &cli.manager_url {
        Some(url) => {
            info!("Manager: {}", url);
            Arc::new(
                HttpIdentityResolver::new(url, auth_timeout)
                    .context("Failed to build identity resolver")?,
            )
        }
        None => {
            warn!("⚠️  No manager URL - every agent runs as tenant 0 / host 0");
            Arc::new(DisabledIdentityResolver)
        }
    };

    let (pipeline_tx, pipeline_rx) = mpsc::channel(cli.pipeline_buffer.max(1));
    let ingestor = Arc::new(DetailIngestor::new(pipeline_tx));

    let config = ServerConfig {
        listen_addr: cli.listen,
        api_listen_addr: cli.api_listen,
        conn_limit: cli.conn_limit,
        auth_timeout,
        manager_url: cli.manager_url.clone(),
        pipeline_buffer: cli.pipeline_buffer,
        command_timeout: Duration::from_secs(cli.command_timeout_secs),
    };
    let center = AgentCenter::new(config, resolver, ingestor.clone())?;
    let shutdown = center.shutdown_token();

    let drain = tokio::spawn(drain_pipeline(pipeline_rx, shutdown.clone()));

    if let Some(url) = &cli.manager_url {
        let mut reporter_config = ReporterConfig::new(url.clone());
        reporter_config.interval = Duration::from_secs(cli.report_interval_secs.max(1));
        let reporter = HeartbeatReporter::new(reporter_config, center.registry())
            .context("Failed to build heartbeat reporter")?;
        tokio::spawn(reporter.run(shutdown.clone()));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                shutdown.cancel();
            }
        });
    }

    let api_listener = tokio::net::TcpListener::bind(cli.api_listen)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", cli.api_listen))?;
    let api = tokio::spawn(serve_api(api_listener, center.api_router(), shutdown.clone()));

    center.run_tcp().await?;

    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Manager API failed: {}", e),
        Err(e) => warn!("Manager API task failed: {}", e),
    }

    let drained = drain.await.unwrap_or(0);
    info!(
        "Pipeline forwarded {} frame(s), dropped {}",
        drained,
        ingestor.dropped()
    );
    info!("Final counters: {:?}", center.metrics().snapshot());

    Ok(())
}

/// Consume the inbound frame pipeline until shutdown
///
/// Downstream processing is deployment specific; this default consumer only
/// logs what it sees.
async fn drain_pipeline(
    mut pipeline: mpsc::Receiver<IngestedFrame>,
    shutdown: CancellationToken,
) -> u64 {
    let mut forwarded = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return forwarded,
            item = pipeline.recv() => match item {
                Some(ingested) => {
                    forwarded += 1;
                    debug!(
                        agent_id = %ingested.agent_id,
                        tenant_id = ingested.tenant_id,
                        host_id = ingested.host_id,
                        "Frame with {} record(s)",
                        ingested.frame.records.len()
                    );
                }
                None => return forwarded,
            },
        }
    }
}
