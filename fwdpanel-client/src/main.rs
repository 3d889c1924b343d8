use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use clap::{Parser, Subcommand};
use fwdpanel_client::{
    AppContext, ClientConfig, WILDCARD,
    config::{DEFAULT_CHANNEL, config_path, load_config_from_path},
    supervisor::{SupervisorExit, SupervisorSpec, spawn_supervisor},
};
use fwdpanel_core::{
    EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_ERROR, EVENT_PARSE_ERROR, EVENT_RECONNECT_FAILED,
    EVENT_RECONNECTING,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fwdpanel", about = "Forwarding panel event channel client")]
struct Args {
    /// Config file; defaults to the per-user config.json when it exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured server URL (ws:// or wss://).
    #[arg(long, global = true)]
    url: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every inbound event as a JSON line until interrupted.
    Tail {
        #[arg(long, default_value = DEFAULT_CHANNEL)]
        channel: String,
    },
    /// Send one JSON message on a channel and exit.
    Send {
        #[arg(long, default_value = DEFAULT_CHANNEL)]
        channel: String,
        message: String,
    },
    /// Run the backend under restart-on-crash supervision.
    Supervise {
        /// Backend command and arguments; defaults to the config's `backend`.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_file.as_ref());

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Tail { channel } => tail(config, &channel).await,
        Command::Send { channel, message } => send_once(config, &channel, &message).await,
        Command::Supervise { command } => supervise(config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
        }
    }
}

fn resolve_config(args: &Args) -> Result<ClientConfig, String> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .map_err(|err| format!("failed to load config {}: {err}", path.display()))?,
        None => {
            let path = config_path();
            if path.exists() {
                load_config_from_path(&path).unwrap_or_else(|err| {
                    warn!(path = %path.display(), "ignoring unreadable config: {err}");
                    ClientConfig::default()
                })
            } else {
                ClientConfig::default()
            }
        }
    };

    config.apply_env();
    if let Some(url) = &args.url {
        config.server_url = url.clone();
    }
    config.validate().map_err(|err| format!("invalid config: {err}"))?;
    Ok(config)
}

async fn tail(config: ClientConfig, channel: &str) -> Result<(), String> {
    let context = AppContext::from_config(config).map_err(|err| err.to_string())?;
    let client = context
        .channel(channel)
        .ok_or_else(|| format!("unknown channel {channel}"))?;

    client.on(WILDCARD, |event| {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", event.payload);
    });
    client.on(EVENT_CONNECTED, |_| info!("channel connected"));
    client.on(EVENT_DISCONNECTED, |_| warn!("channel disconnected"));
    client.on(EVENT_RECONNECTING, |event| {
        info!(
            attempt = %event.payload["attempt"],
            delay_ms = %event.payload["delay_ms"],
            "reconnecting"
        );
    });
    client.on(EVENT_ERROR, |event| warn!(error = %event.payload["error"], "channel error"));
    client.on(EVENT_PARSE_ERROR, |event| {
        warn!(error = %event.payload["error"], "unparseable channel message");
    });

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<()>();
    client.on(EVENT_RECONNECT_FAILED, move |_| {
        let _ = failed_tx.send(());
    });

    if let Err(err) = client.connect().await {
        warn!("initial connect failed, retrying in background: {err}");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            context.shutdown().await;
            Ok(())
        }
        _ = failed_rx.recv() => {
            context.shutdown().await;
            Err(format!(
                "gave up on {} after {} reconnect attempts",
                client.url(),
                context.config().max_reconnect_attempts
            ))
        }
    }
}

async fn send_once(config: ClientConfig, channel: &str, message: &str) -> Result<(), String> {
    let payload: serde_json::Value =
        serde_json::from_str(message).map_err(|err| format!("message is not JSON: {err}"))?;

    let context = AppContext::from_config(config).map_err(|err| err.to_string())?;
    let client = context
        .channel(channel)
        .ok_or_else(|| format!("unknown channel {channel}"))?;

    client.connect().await.map_err(|err| err.to_string())?;
    let sent = client.send(&payload);
    // The driver flushes the queued frame on its way out; returning before it
    // finishes would drop the runtime with the message still queued.
    context.shutdown().await;

    if sent {
        Ok(())
    } else {
        Err("channel closed before the message could be sent".to_owned())
    }
}

async fn supervise(config: ClientConfig, command: Vec<String>) -> Result<(), String> {
    let spec = match command.split_first() {
        Some((program, rest)) => {
            let backend = config.backend.clone().unwrap_or_default();
            SupervisorSpec {
                command: program.clone(),
                args: rest.to_vec(),
                ..SupervisorSpec::from(&backend)
            }
        }
        None => {
            let backend = config
                .backend
                .as_ref()
                .ok_or_else(|| "no backend command given and none configured".to_owned())?;
            SupervisorSpec::from(backend)
        }
    };

    let handle = spawn_supervisor(spec).map_err(|err| err.to_string())?;
    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping backend");
            stopper.stop();
        }
    });

    match handle.wait().await {
        Ok(SupervisorExit::Completed) => Ok(()),
        Ok(SupervisorExit::Stopped) => {
            info!("backend supervision stopped");
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}
