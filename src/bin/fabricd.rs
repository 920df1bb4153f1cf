//! Fabric daemon binary
//!
//! Loads configuration, builds the instance and runs it until Ctrl+C.

use clap::Parser;
use fabric::{Config, Instance, TcpDialer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Instance network fabric daemon
#[derive(Parser, Debug)]
#[command(name = "fabricd", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, overriding `listen` from the configuration
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let (mut config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }

    if args.show_config {
        match config.to_yaml() {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                error!("Failed to render configuration: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    let instance = match Instance::builder(config).build() {
        Ok(instance) => instance,
        Err(e) => {
            error!("Failed to create instance: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = instance.start() {
        error!("Failed to start instance: {}", e);
        std::process::exit(1);
    }

    if let Some(addr) = instance.config().listen.clone() {
        if let Err(e) = instance.listen(&addr).await {
            error!("Failed to listen on {}: {}", addr, e);
            std::process::exit(1);
        }
    }

    if instance.config().servers.is_empty() {
        if !instance.role().is_authority() {
            warn!("No servers configured, running disconnected");
        }
    } else {
        let dialer = Arc::new(TcpDialer::new(instance.config().node.limits.outbound_queue));
        if let Err(e) = instance.start_upstream(dialer) {
            error!("Failed to start upstream connection: {}", e);
            std::process::exit(1);
        }
    }

    info!(
        role = %instance.role(),
        state = %instance.state(),
        "Fabric running, press Ctrl+C to exit"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    instance.shutdown().await;
    info!("Fabric shutdown complete");
}
