//! Listens for datagrams, groups them by sender and logs each group.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weft_core::{headers, Envelope, SystemClock};
use weft_integration::aggregator::{BarrierSweeper, CorrelatingHandler};
use weft_integration::config::{IntegrationConfig, MulticastConfig, ReleaseConfig};
use weft_integration::{
    DatagramReceivingAdapter, DirectChannel, MeteredChannel, PollableChannel, QueueChannel,
};

#[derive(Parser, Debug)]
#[command(name = "udp-relay", about = "Correlate UDP datagrams into fixed-size groups per sender")]
struct Args {
    /// JSON configuration file. Flags override its values.
    #[arg(long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, env = "WEFT_PORT", default_value_t = 11111)]
    port: u16,

    /// Join this multicast group instead of listening for unicast.
    #[arg(long, env = "WEFT_MULTICAST_GROUP")]
    multicast_group: Option<Ipv4Addr>,

    /// Interface for the multicast membership.
    #[arg(long, env = "WEFT_INTERFACE", requires = "multicast_group")]
    interface: Option<Ipv4Addr>,

    /// Datagrams per group.
    #[arg(long, env = "WEFT_GROUP_SIZE", default_value_t = 3)]
    group_size: usize,

    /// Incomplete groups older than this are discarded.
    #[arg(long, env = "WEFT_GROUP_TIMEOUT_MS")]
    group_timeout_ms: Option<u64>,

    /// Emit logs as JSON.
    #[arg(long, env = "WEFT_JSON_LOGS")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<IntegrationConfig> {
    let mut config = match &args.config {
        Some(path) => IntegrationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IntegrationConfig::default(),
    };
    config.receiver.port = args.port;
    if let Some(group) = args.multicast_group {
        config.receiver.multicast = Some(MulticastConfig {
            group,
            interface: args.interface,
        });
    }
    config.aggregator.correlation_header = headers::IP_PACKET_ADDRESS.to_string();
    config.aggregator.release = ReleaseConfig::FixedSize {
        size: args.group_size,
    };
    // A sender starts a new group once its previous one is released.
    config.aggregator.tracked_key_capacity = 0;
    if let Some(timeout) = args.group_timeout_ms {
        config.aggregator.group_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn describe(group: &Envelope) -> String {
    let members = group.payload().as_group().unwrap_or_default();
    members
        .iter()
        .map(|member| match member.payload().to_bytes() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => member.payload().kind().to_string(),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn key_of(group: &Envelope) -> String {
    group
        .headers()
        .get_str(headers::CORRELATION_ID)
        .unwrap_or("?")
        .to_string()
}

fn log_each<C, F>(channel: Arc<C>, log: F) -> JoinHandle<()>
where
    C: PollableChannel + 'static,
    F: Fn(Envelope) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if let Some(envelope) = channel.receive(Duration::from_secs(1)).await {
                log(envelope);
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    let config = load_config(&args)?;

    let released = Arc::new(MeteredChannel::new(QueueChannel::new("released", 1024)));
    released
        .metrics()
        .set_full_stats_enabled(config.metrics.full_stats_enabled);
    let timed_out = Arc::new(QueueChannel::new("timedOut", 1024));
    let errors = Arc::new(QueueChannel::new("errorChannel", 1024));

    let handler = Arc::new(
        CorrelatingHandler::from_config(&config.aggregator, released.clone(), Arc::new(SystemClock))
            .with_discard_channel(timed_out.clone())
            .with_error_channel(errors.clone()),
    );
    let inbound = Arc::new(DirectChannel::new("inbound"));
    inbound.subscribe(handler.clone());

    let mut sweeper = BarrierSweeper::spawn(Arc::clone(&handler), config.aggregator.sweep_interval());
    let adapter = DatagramReceivingAdapter::new(config.receiver.clone(), inbound)
        .with_error_channel(errors.clone());
    let port = adapter.start().await?;
    info!(port, group_size = args.group_size, "udp-relay running, Ctrl-C to stop");

    let loggers = [
        log_each(released.clone(), |group| {
            info!(correlation_key = %key_of(&group), members = %describe(&group), "group released");
        }),
        log_each(timed_out, |group| {
            warn!(correlation_key = %key_of(&group), members = %describe(&group), "group timed out");
        }),
        log_each(errors, |failure| {
            if let Some(failure) = failure.payload().as_failure() {
                warn!(description = %failure.description, root_cause = %failure.root_cause, "dispatch failed");
            }
        }),
    ];

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    adapter.stop().await?;
    sweeper.stop().await;
    for logger in loggers {
        logger.abort();
    }
    let stats = released.metrics().snapshot();
    info!(
        groups = stats.send_count,
        errors = stats.send_error_count,
        "udp-relay stopped"
    );
    Ok(())
}
