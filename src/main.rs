//! accent-sync - keeps RGB hardware on the Windows accent color
//!
//! This is the binary entry point. All logic lives in the library crates.

use std::path::PathBuf;

use clap::Parser;

use accentsync_app::config;
use accentsync_app::runner;
use accentsync_core::prelude::*;

/// Keeps OpenRGB-managed lighting in sync with the Windows accent color
#[derive(Parser, Debug)]
#[command(name = "accentsync")]
#[command(about = "Keeps OpenRGB-managed lighting in sync with the Windows accent color", long_about = None)]
struct Args {
    /// Path to the config file (defaults to the per-user location)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// OpenRGB SDK server address, overriding the config
    #[arg(long, value_name = "HOST:PORT")]
    server: Option<String>,

    /// Apply the current accent color once and exit
    #[arg(long)]
    once: bool,

    /// List the server's devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    accentsync_core::logging::init()?;

    // Scaffold the default config on first run, but never touch an
    // explicitly given path.
    if args.config.is_none() {
        if let Some(path) = config::default_config_path() {
            if let Err(err) = config::init_config_file(&path) {
                warn!("Could not create the default config file: {}", err);
            }
        }
    }

    let mut settings = config::load(args.config.as_deref());
    if let Some(server) = args.server.as_deref() {
        if let Err(err) = settings.set_server(server) {
            eprintln!("accentsync: {err}");
            std::process::exit(2);
        }
    }

    let result = if args.list_devices {
        runner::list_devices(settings).await
    } else if args.once {
        runner::run_once(settings).await
    } else {
        runner::run(settings).await
    };

    if let Err(err) = result {
        error!("Fatal: {}", err);
        eprintln!("accentsync: {err}");
        std::process::exit(1);
    }

    info!("accent-sync stopped");
    Ok(())
}
