use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewall::config::RateLimitSettings;
use ratewall::ratelimit::{ip_key, Flow, Options, RateLimiter, Request, Response, DEFAULT_IPV6_SUBNET};

#[derive(Parser)]
#[command(name = "ratewall", version, about = "Request rate limiting engine")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the client key derived from an address
    Key {
        /// Client address
        #[arg(long)]
        ip: String,

        /// IPv6 prefix length; 0 keys by full address
        #[arg(long, default_value_t = DEFAULT_IPV6_SUBNET)]
        subnet: u8,
    },

    /// Replay requests from one client through a limiter built from a settings file
    Simulate {
        /// Settings file (YAML, JSON or TOML)
        #[arg(long)]
        config: String,

        /// Client address
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match args.command {
        Command::Key { ip, subnet } => {
            let subnet = (subnet > 0).then_some(subnet);
            println!("{}", ip_key(&ip, subnet));
            Ok(())
        }
        Command::Simulate {
            config,
            ip,
            requests,
            interval_ms,
        } => {
            let settings = RateLimitSettings::from_file(&config)?;
            let limiter = RateLimiter::new(Options::from_settings(settings))?;
            info!(config = %config, ip = %ip, requests, "Starting simulation");

            tokio::select! {
                result = simulate(&limiter, &ip, requests, Duration::from_millis(interval_ms)) => result,
                _ = shutdown_signal() => Ok(()),
            }
        }
    }
}

/// Send `requests` requests from `ip` and print each outcome.
async fn simulate(
    limiter: &RateLimiter,
    ip: &str,
    requests: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut blocked = 0;

    for n in 1..=requests {
        let mut request = Request::from_ip(ip);
        let mut response = Response::new();
        let evaluation = limiter.evaluate(&mut request, &mut response).await?;

        if evaluation.flow == Flow::Stop {
            blocked += 1;
        }
        println!("#{n} {:?} {}", evaluation.flow, response.status);
        for (name, value) in &response.headers {
            println!("    {}: {}", name, value.to_str().unwrap_or("<binary>"));
        }

        if !interval.is_zero() && n < requests {
            tokio::time::sleep(interval).await;
        }
    }

    info!(requests, blocked, "Simulation finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
