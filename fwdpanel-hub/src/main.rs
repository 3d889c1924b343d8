use std::process::ExitCode;

use clap::Parser;
use fwdpanel_hub::{AppState, serve};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Development hub: pushes published events to every connected panel
/// client and forwards what clients send to each other.
#[derive(Parser, Debug)]
#[command(name = "fwdpanel-hub")]
struct HubArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
    /// Filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = HubArgs::parse();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let listener = match TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, "failed to bind: {err}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupted, draining connections"),
            Err(err) => {
                error!("cannot listen for ctrl-c, running until killed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    match serve(listener, AppState::new(), shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("hub server exited: {err}");
            ExitCode::FAILURE
        }
    }
}
