use anyhow::{Context, Result};
use bioloid_lib::FileStorage;
use bioloid_lib::config::DEFAULT_ADDR;
use bioloid_lib::io_adapter::{SimulatedAdcs, SimulatedPins, fake_io_adapter};
use bioloid_lib::servo::{LogPeripherals, fake_servo};
use bioloid_lib::transport::serve_device;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[path = "../logging.rs"]
mod logging;

/// A simulated servo (or I/O adapter) served over TCP, one controller at a time.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, env = "BIOLOID_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,
    /// Device ID used until one is saved in the control table file.
    #[arg(short, long, default_value_t = 1)]
    id: u8,
    /// Simulate an I/O adapter instead of a servo.
    #[arg(long)]
    io_adapter: bool,
    /// File holding the persistent part of the control table
    /// [default: fake-servo.ctl or io-adapter.ctl]
    #[arg(short, long)]
    ctl_file: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::setup_logging(cli.log_file, &cli.verbose)?;

    let ctl_file = cli.ctl_file.unwrap_or_else(|| {
        PathBuf::from(if cli.io_adapter { "io-adapter.ctl" } else { "fake-servo.ctl" })
    });
    let storage = FileStorage::new(&ctl_file);
    let mut servo = if cli.io_adapter {
        fake_io_adapter(cli.id, storage, SimulatedPins::default(), SimulatedAdcs::default())
    } else {
        fake_servo(cli.id, storage, LogPeripherals)
    }
    .with_context(|| format!("Unable to load control table from {}", ctl_file.display()))?;

    let listener = TcpListener::bind(cli.addr.as_str())
        .await
        .with_context(|| format!("Unable to listen on {}", cli.addr))?;
    let kind = if cli.io_adapter { "I/O adapter" } else { "servo" };
    info!("Fake {kind} with ID {} listening on {}", servo.dev_id(), cli.addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Controller connected from {peer}");
        if let Err(e) = serve_device(stream, &mut servo).await {
            warn!("Connection from {peer} ended: {e}");
        }
        info!("Waiting for the next controller (ID is now {})", servo.dev_id());
    }
}
