//! voltk - Volume toolkit admin CLI
//!
//! Reads, writes and scans devices through the voltk block cache.

mod scan;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voltk_common::{AccessFlags, EngineKind, IoConfig, LoggingConfig};
use voltk_io::{DeviceHandle, IoManager};

#[derive(Parser, Debug)]
#[command(name = "voltk")]
#[command(about = "Volume toolkit: block device I/O through a shared cache")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/voltk/voltk.toml")]
    config: String,

    /// Log level (overrides the config file; RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// I/O engine
    #[arg(long, value_enum)]
    engine: Option<EngineArg>,

    /// Discard writes instead of issuing them
    #[arg(long)]
    dry_run: bool,

    /// Never open devices with O_DIRECT
    #[arg(long)]
    no_direct: bool,

    /// Number of blocks in the cache
    #[arg(long)]
    cache_blocks: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EngineArg {
    Async,
    Sync,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Async => Self::Async,
            EngineArg::Sync => Self::Sync,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hex dump a byte range
    Read {
        device: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 512)]
        length: usize,
    },
    /// Write hex-encoded bytes at an offset
    Write {
        device: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Data as hex, e.g. 4c4142454c4f4e45
        data: String,
        /// Refuse to share the device with other openers
        #[arg(long)]
        exclusive: bool,
    },
    /// Zero a byte range
    Zero {
        device: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: u64,
        #[arg(long)]
        exclusive: bool,
    },
    /// Fill a byte range with one value
    Fill {
        device: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: u64,
        /// Byte value, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_byte)]
        value: u8,
        #[arg(long)]
        exclusive: bool,
    },
    /// Look for LVM2 physical volume labels
    Scan {
        #[arg(required = true)]
        devices: Vec<PathBuf>,
    },
    /// Show device geometry and cache statistics
    Stats {
        #[arg(required = true)]
        devices: Vec<PathBuf>,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    io: IoConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte value {s:?}: {e}"))
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("cannot read config {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("invalid config file {path}"))
}

const fn write_access(exclusive: bool) -> AccessFlags {
    if exclusive {
        AccessFlags::EXCLUSIVE
    } else {
        AccessFlags::WRITE
    }
}

/// Run `f` with a handle on `path`, releasing it afterwards
fn with_device<T>(
    io: &mut IoManager,
    path: &Path,
    access: AccessFlags,
    f: impl FnOnce(&mut IoManager, &DeviceHandle) -> voltk_common::Result<T>,
) -> Result<T> {
    let handle = io
        .acquire_device(path, access)
        .with_context(|| format!("cannot acquire {}", path.display()))?;
    let result = f(io, &handle);
    io.release_device(handle);
    result.with_context(|| format!("I/O on {} failed", path.display()))
}

fn hex_dump(offset: u64, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    char::from(*b)
                } else {
                    '.'
                }
            })
            .collect();
        println!(
            "{:08x}  {:<47}  |{ascii}|",
            offset + (i * 16) as u64,
            hex.join(" ")
        );
    }
}

fn run(io: &mut IoManager, command: Commands) -> Result<()> {
    match command {
        Commands::Read {
            device,
            offset,
            length,
        } => {
            let mut buf = vec![0u8; length];
            with_device(io, &device, AccessFlags::READ, |io, dev| {
                io.read_bytes(dev, offset, &mut buf)
            })?;
            hex_dump(offset, &buf);
        }
        Commands::Write {
            device,
            offset,
            data,
            exclusive,
        } => {
            let bytes = hex::decode(data.trim()).context("data is not valid hex")?;
            with_device(io, &device, write_access(exclusive), |io, dev| {
                io.write_bytes(dev, offset, &bytes)
            })?;
            io.flush().context("writeback failed")?;
            println!("Wrote {} bytes at offset {offset}", bytes.len());
        }
        Commands::Zero {
            device,
            offset,
            length,
            exclusive,
        } => {
            with_device(io, &device, write_access(exclusive), |io, dev| {
                io.zero_bytes(dev, offset, length)
            })?;
            io.flush().context("writeback failed")?;
            println!("Zeroed {length} bytes at offset {offset}");
        }
        Commands::Fill {
            device,
            offset,
            length,
            value,
            exclusive,
        } => {
            with_device(io, &device, write_access(exclusive), |io, dev| {
                io.set_bytes(dev, offset, length, value)
            })?;
            io.flush().context("writeback failed")?;
            println!("Filled {length} bytes at offset {offset} with {value:#04x}");
        }
        Commands::Scan { devices } => {
            let results = scan::scan(io, &devices);
            println!("{:<32} {:<10} {:<40}", "DEVICE", "TYPE", "PVID");
            let mut failed = 0;
            for result in results {
                let path = result.path.display();
                match result.label {
                    Ok(Some(label)) => {
                        println!("{path:<32} {:<10} {:<40}", label.label_type, label.pvid);
                    }
                    Ok(None) => println!("{path:<32} {:<10} {:<40}", "-", "-"),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{path}: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} device(s) could not be scanned");
            }
        }
        Commands::Stats { devices } => {
            println!(
                "{:<32} {:>16} {:>8} {:>8}",
                "DEVICE", "SIZE", "LOGICAL", "PHYSICAL"
            );
            for path in &devices {
                let (size, geometry) = with_device(io, path, AccessFlags::READ, |io, dev| {
                    let size = io.device_size(dev)?;
                    let geometry = io.block_geometry(dev)?;
                    // Reads the label area so the cache statistics reflect real I/O
                    let mut label_area = vec![0u8; scan::LABEL_SCAN_SIZE.min(size as usize)];
                    io.read_bytes(dev, 0, &mut label_area)?;
                    Ok((size, geometry))
                })?;
                println!(
                    "{:<32} {:>16} {:>8} {:>8}",
                    path.display(),
                    size,
                    geometry.logical_sector_size,
                    geometry.physical_block_size
                );
            }

            let stats = io.stats();
            println!();
            println!("Cache ({} engine)", io.engine_name());
            println!("==================");
            println!(
                "Blocks:       {} x {} bytes",
                io.nr_blocks(),
                io.block_size()
            );
            println!("Hits:         {}", stats.hits);
            println!("Misses:       {}", stats.misses);
            println!("Hit ratio:    {:.2}", stats.hit_ratio());
            println!("Reads:        {}", stats.reads);
            println!("Writes:       {}", stats.writes);
            println!("Read errors:  {}", stats.read_errors);
            println!("Write errors: {}", stats.write_errors);
            println!("Evictions:    {}", stats.evictions);
            println!("Open devices: {}", io.open_devices());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let config = load_config(&args.config)?;

    // Initialize logging
    let log_level = args.log_level.unwrap_or(config.logging.level);
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }

    // Merge CLI args with config file (CLI takes precedence)
    let mut io_config = config.io;
    if let Some(engine) = args.engine {
        io_config.engine = engine.into();
    }
    io_config.dry_run |= args.dry_run;
    if args.no_direct {
        io_config.use_direct_io = false;
    }
    if let Some(cache_blocks) = args.cache_blocks {
        io_config.cache_blocks = cache_blocks;
    }
    debug!(?io_config, "effective configuration");

    let mut io = IoManager::new(io_config).context("cannot create I/O manager")?;
    info!(engine = io.engine_name(), "I/O manager ready");

    let result = run(&mut io, args.command);
    // Dirty data left by a failed command is still written back
    let shutdown = io.shutdown().context("final writeback failed");
    result?;
    shutdown
}
