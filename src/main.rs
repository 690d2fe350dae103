//! Slednik CLI - Concox V5 tracking server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use slednik::config::{init_logging, Config};
use slednik::control::ControlServer;
use slednik::error::Result;
use slednik::protocol::{Message, RawFrame};
use slednik::server::DeviceServer;
use slednik::VERSION;

#[derive(Parser)]
#[command(name = "slednik", version = VERSION, about = "TCP terminator for Concox V5 GPS trackers")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking server.
    Serve {
        /// Device TCP port override.
        #[arg(long)]
        listen_port: Option<u16>,
        /// Operator HTTP port override.
        #[arg(long)]
        control_port: Option<u16>,
    },
    /// Validate the configuration and print the effective values.
    CheckConfig,
    /// Decode a hex-encoded frame and print the parsed payload.
    Decode {
        /// The frame as hex, e.g. 78780511...0d0a.
        hex_frame: String,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    config.apply_env()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Serve {
            listen_port,
            control_port,
        } => {
            if let Some(port) = listen_port {
                config.server.listen_port = port;
            }
            if let Some(port) = control_port {
                config.server.control_port = port;
            }
            config.validate()?;
            run_serve(config).await
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config).expect("serializable"));
            Ok(())
        }
        Commands::Decode { hex_frame } => run_decode(&hex_frame),
    }
}

/// Run the server until SIGINT/SIGTERM.
async fn run_serve(config: Config) -> Result<()> {
    // The guard flushes the log sink on drop; hold it for the process
    // lifetime.
    let _log_guard = init_logging(&config.logging)?;
    info!(version = VERSION, "slednik starting");

    let server = DeviceServer::new(config.server.clone());
    let registry = server.registry();

    // Bind failures are the one process-fatal startup error.
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "device port bind failed");
            return Err(err);
        }
    };

    let control_addr = format!("{}:{}", config.server.bind_host, config.server.control_port)
        .parse()
        .map_err(|e| slednik::Error::Config(format!("bad control address: {e}")))?;
    let control = Arc::new(ControlServer::new(control_addr, Arc::clone(&registry)));

    let control_task = {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if let Err(err) = control.start().await {
                error!(error = %err, "control surface failed");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_task = tokio::spawn(async move { server.run(listener, shutdown_rx).await });

    wait_for_signal().await;
    info!("shutdown requested, draining");
    let _ = shutdown_tx.send(());

    server_task.await.map_err(|e| slednik::Error::Internal(e.to_string()))??;
    control.stop();
    let _ = control_task.await;

    info!("bye");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut term =
            unix_signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

/// Parse and pretty-print one frame from the command line.
fn run_decode(hex_frame: &str) -> Result<()> {
    let cleaned: String = hex_frame.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| slednik::Error::Config(format!("not valid hex: {e}")))?;

    let frame = RawFrame::from_bytes(&bytes)?;
    let message = Message::parse(&frame)?;

    println!("opcode:   {:#04x}", frame.opcode());
    println!("framing:  {}", if frame.is_long() { "long" } else { "short" });
    println!("sequence: {}", frame.sequence());
    match frame.verify_crc() {
        Ok(()) => println!("crc:      ok"),
        Err(err) => println!("crc:      MISMATCH ({err})"),
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&message).expect("serializable")
    );
    Ok(())
}
