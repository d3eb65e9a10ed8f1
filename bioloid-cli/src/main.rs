use anyhow::{Context, Result, bail};
use bioloid_lib::config::DEFAULT_ADDR;
use bioloid_lib::dump_mem::{DumpOptions, dump_mem};
use bioloid_lib::servo::{LogPeripherals, fake_servo};
use bioloid_lib::{Bus, BusConfig, Id, LoopbackBus, MemoryStorage, Scanner, TcpTransport, Transport};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::error;

mod logging;

/// Send commands to bioloid devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the bus server (e.g. a running fake_servo).
    #[arg(short, long, env = "BIOLOID_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,
    /// Talk to an in-process simulated servo with ID 1 instead of the network.
    #[arg(long)]
    simulate: bool,
    /// How long to wait for each byte of a response, in milliseconds.
    #[arg(short, long, default_value_t = 100)]
    timeout_ms: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Look for devices in the usual ID ranges.
    Scan,
    /// Check whether a device answers.
    Ping {
        #[arg(value_parser = parse_id)]
        id: Id,
    },
    /// Read bytes from a device's control table.
    Read {
        #[arg(value_parser = parse_id)]
        id: Id,
        #[arg(value_parser = parse_u8)]
        offset: u8,
        #[arg(value_parser = parse_u8)]
        len: u8,
    },
    /// Write bytes to a device's control table.
    Write {
        #[arg(value_parser = parse_id)]
        id: Id,
        #[arg(value_parser = parse_u8)]
        offset: u8,
        #[arg(required = true, value_parser = parse_u8)]
        data: Vec<u8>,
    },
    /// Stage a write that takes effect on the next ACTION.
    RegWrite {
        #[arg(value_parser = parse_id)]
        id: Id,
        #[arg(value_parser = parse_u8)]
        offset: u8,
        #[arg(required = true, value_parser = parse_u8)]
        data: Vec<u8>,
    },
    /// Commit every staged write.
    Action,
    /// Restore a device's factory defaults.
    Reset {
        #[arg(value_parser = parse_id)]
        id: Id,
    },
    /// Write a different value to several devices at once.
    SyncWrite {
        #[arg(value_parser = parse_u8)]
        offset: u8,
        /// Entries of the form ID=HEXBYTES, e.g. 1=01 2=0a
        #[arg(required = true, value_parser = parse_entry)]
        entries: Vec<(u8, Vec<u8>)>,
    },
}

/// Accepts decimal or `0x` hex.
fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{s}' is not a byte value: {e}"))
}

/// Like [`parse_u8`], but also takes `broadcast` / `bcast`.
fn parse_id(s: &str) -> Result<Id, String> {
    if s.eq_ignore_ascii_case("broadcast") || s.eq_ignore_ascii_case("bcast") {
        return Ok(Id::BROADCAST);
    }
    let id = Id(parse_u8(s)?);
    if id == Id::INVALID {
        return Err(format!("{id} is not a device ID"));
    }
    Ok(id)
}

fn parse_entry(s: &str) -> Result<(u8, Vec<u8>), String> {
    let (id, data) = s.split_once('=').ok_or_else(|| format!("expected ID=HEXBYTES, got '{s}'"))?;
    let data = hex::decode(data).map_err(|e| format!("bad hex in '{s}': {e}"))?;
    Ok((parse_u8(id)?, data))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let config = BusConfig::default().with_byte_timeout(Duration::from_millis(cli.timeout_ms));
    let result = if cli.simulate {
        let servo = fake_servo(1, MemoryStorage::new(), LogPeripherals)?;
        let mut bus = Bus::with_config(LoopbackBus::new().with_device(servo), config);
        run(&mut bus, cli.command).await
    } else {
        let transport = TcpTransport::connect(cli.addr.as_str(), &config)
            .await
            .with_context(|| format!("Unable to connect to {}", cli.addr))?;
        let mut bus = Bus::with_config(transport, config);
        run(&mut bus, cli.command).await
    };

    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
    Ok(())
}

async fn run<T: Transport>(bus: &mut Bus<T>, command: Commands) -> Result<()> {
    match command {
        Commands::Scan => {
            let devices = Scanner::new(bus).scan().await?;
            for device in &devices {
                println!("{device}");
            }
            if devices.is_empty() {
                bail!("No devices found");
            }
        }
        Commands::Ping { id } => {
            if bus.ping(id).await? {
                println!("ID {} is present", id.value());
            } else {
                bail!("ID {} did not respond", id.value());
            }
        }
        Commands::Read { id, offset, len } => {
            let data = bus
                .read(id, offset, len)
                .await
                .with_context(|| format!("READ from ID {} failed", id.value()))?;
            for line in dump_mem(&data, &DumpOptions::default().addr(offset as usize)) {
                println!("{line}");
            }
        }
        Commands::Write { id, offset, data } => {
            let err = bus.write(id, offset, &data, false).await?;
            println!("WRITE to {id}: {err}");
        }
        Commands::RegWrite { id, offset, data } => {
            let err = bus.write(id, offset, &data, true).await?;
            println!("REG_WRITE to {id}: {err}");
        }
        Commands::Action => bus.action().await?,
        Commands::Reset { id } => {
            let err = bus.reset(id).await?;
            println!("RESET of {id}: {err}");
        }
        Commands::SyncWrite { offset, entries } => {
            let (ids, values): (Vec<u8>, Vec<Vec<u8>>) = entries.into_iter().unzip();
            bus.sync_write(&ids, offset, &values).await?;
        }
    }
    Ok(())
}
