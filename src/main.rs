// Throttle Relay - Main Entry Point
//
// Line-oriented front end for the relay:
// - Reads `<key> <recipient> <payload>` submissions from stdin
// - Throttles each key with the sliding-window limiter
// - Delivers accepted items in the background (webhook or dry-run log)

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use throttle_relay::config::Config;
use throttle_relay::dispatch::{Delivery, LogDelivery, WebhookDelivery};
use throttle_relay::{logging, metrics, metrics_server, Relay, SubmitOutcome};

/// Throttle Relay: per-key rate limiting in front of background delivery
#[derive(Parser, Debug)]
#[command(name = "throttle-relay")]
#[command(version)]
#[command(about = "Per-key rate limiting with bounded background delivery", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (repeat for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read submissions from stdin and relay them
    Serve {
        /// Log deliveries instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Webhook URL (overrides the configuration)
        #[arg(long)]
        webhook_url: Option<String>,
    },
    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::load().context("Failed to load config")?,
    };

    if let Commands::Serve {
        webhook_url: Some(url),
        ..
    } = &args.command
    {
        config.delivery.webhook_url = Some(url.clone());
        config.validate()?;
    }

    logging::init(&config.logging, args.verbose)?;

    match args.command {
        Commands::Serve { dry_run, .. } => serve(config, dry_run).await,
        Commands::CheckConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

/// Pick the delivery capability for this run
fn select_delivery(config: &Config, dry_run: bool) -> Arc<dyn Delivery> {
    if dry_run {
        info!("Dry run: deliveries are logged only");
        return Arc::new(LogDelivery);
    }
    match WebhookDelivery::from_config(&config.delivery) {
        Some(webhook) => {
            info!("Delivering to webhook {}", webhook.url());
            Arc::new(webhook)
        }
        None => {
            warn!("No webhook URL configured, deliveries are logged only");
            Arc::new(LogDelivery)
        }
    }
}

/// Split a submission line into key, recipient and payload
///
/// The payload is the rest of the line and may contain spaces.
fn parse_line(line: &str) -> Option<(&str, &str, &str)> {
    let (key, rest) = line.trim().split_once(char::is_whitespace)?;
    let (recipient, payload) = rest.trim_start().split_once(char::is_whitespace)?;
    let payload = payload.trim_start();
    if payload.is_empty() {
        return None;
    }
    Some((key, recipient, payload))
}

async fn serve(config: Config, dry_run: bool) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let shutdown = CancellationToken::new();
    let metrics_task = config.metrics.enabled.then(|| {
        let port = config.metrics.port;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(port, token).await {
                error!("Metrics server failed: {:#}", e);
            }
        })
    });

    let relay = Relay::start(&config, select_delivery(&config, dry_run));

    // Ctrl-C abandons the read and any submission waiting for capacity
    let interrupt = relay.cancellation_token();
    let signal_task = {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, draining queue");
                interrupt.cancel();
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            biased;
            () = interrupt.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        line_no += 1;

        if line.trim().is_empty() {
            continue;
        }
        let Some((key, recipient, payload)) = parse_line(&line) else {
            println!("invalid {}", line_no);
            continue;
        };

        match relay.submit(key, recipient, payload).await {
            Ok(SubmitOutcome::Accepted(outcome)) => println!("accepted {}", outcome.seq()),
            Ok(SubmitOutcome::Throttled { .. }) => println!("throttled {}", key),
            Err(e) => {
                warn!(line = line_no, error = %e, "Submission rejected");
                println!("rejected {}", line_no);
            }
        }
        if interrupt.is_cancelled() {
            break;
        }
    }
    signal_task.abort();

    let result = relay.shutdown().await;

    shutdown.cancel();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    let stats = result.context("Dispatch worker failed")?;
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        "Relay finished"
    );
    Ok(())
}
