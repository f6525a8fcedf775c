use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdp_relay::{ensure_relay, stop_relay};

/// Chrome Extension <-> CDP relay server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CDP URL this relay instance serves, e.g. http://127.0.0.1:9223
    #[arg(long, default_value = "http://127.0.0.1:9223")]
    cdp_url: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    // This binary has no stdio protocol to protect (unlike the MCP server
    // it descends from), so logs go to stdout with ANSI when the output is
    // a tty.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    info!(cdp_url = %args.cdp_url, "starting cdp-relay");

    let instance = match ensure_relay(&args.cdp_url).await {
        Ok(instance) => instance,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            return Err(e.into());
        }
    };

    info!(
        host = %instance.config.host,
        port = instance.bound_port(),
        token = %instance.token,
        "relay listening"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    stop_relay(&args.cdp_url).await;

    Ok(())
}
