use anyhow::Context;
use clap::Parser;
use otgi::{GaugeClient, GaugeConfig, GaugeHandle, HostRequest, JsonFileStore};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "otgi")]
#[command(about = "Track fuel usage from an OTGI sensor over Bluetooth")]
#[command(version)]
struct Cli {
    /// JSON config file; missing means defaults
    #[arg(short, long, default_value = "otgi.json")]
    config: PathBuf,

    /// Override the account file from the config
    #[arg(long)]
    store: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(level: Level) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn max_level(config: &GaugeConfig, verbose: u8) -> Level {
    match verbose {
        0 => config.max_level(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Turn lines on stdin into host requests: `refuel`, `save`, `clear`, `quit`
async fn read_commands(handle: GaugeHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request = match line.trim() {
            "refuel" => HostRequest::Refuel,
            "save" => HostRequest::Save,
            "clear" => HostRequest::ClearError,
            "quit" | "exit" => HostRequest::Shutdown,
            "" => continue,
            other => {
                warn!("Unknown command {other:?}, expected refuel, save, clear or quit");
                continue;
            }
        };
        handle.request(request)?;
    }
    // stdin closed, treat like quit
    handle.shutdown()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GaugeConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    init_logging(max_level(&config, cli.verbose))?;

    info!("=== otgi v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Fuel account at {}", config.store_path.display());

    let store = JsonFileStore::new(&config.store_path);
    let client = GaugeClient::new(store, &config).await?;
    let handle = client.handle();
    let mut reports = client.reports();

    tokio::spawn(read_commands(handle.clone()));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, saving");
            let _ = ctrl_c.shutdown();
        }
    });

    tokio::spawn(async move {
        while reports.changed().await.is_ok() {
            let report = reports.borrow_and_update().clone();
            info!("{report}");
        }
    });

    client.run().await
}
