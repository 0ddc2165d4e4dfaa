use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cellminer::backend::evaluator::DEFAULT_CHECK_INTERVAL;
use cellminer::Realization;
use cellminer_work_spec::{DATA_LEN, NSLICES, TARGET_LEN};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Engines the launcher leaves to the rest of the system by default.
const RESERVED_ENGINES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliRealization {
    Local,
    Isolated,
}

impl From<CliRealization> for Realization {
    fn from(value: CliRealization) -> Self {
        match value {
            CliRealization::Local => Realization::Local,
            CliRealization::Isolated => Realization::Isolated,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Nonce search over local or isolated compute engines")]
struct Cli {
    /// Enable engine-side debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search a nonce range for a value that meets the target
    Search(SearchArgs),
    /// Measure hash rate against an impossible target
    Bench(BenchArgs),
    /// Print engine counts reported by the platform
    Info,
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Engine realization
    #[arg(long, value_enum, default_value_t = CliRealization::Isolated)]
    realization: CliRealization,

    /// Number of engines (default: usable engines minus two)
    #[arg(short = 'e', long, value_name = "N")]
    engines: Option<usize>,

    /// Pin isolated engine threads to cores
    #[arg(long)]
    pin_cores: bool,

    /// Nonces tested between stop-signal checks
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CHECK_INTERVAL)]
    check_interval: u64,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// 128-byte data block, hex encoded
    #[arg(long, value_name = "HEX")]
    data: String,

    /// 32-byte target, hex encoded, big-endian
    #[arg(long, value_name = "HEX")]
    target: String,

    /// First nonce to test (decimal or 0x-prefixed hex)
    #[arg(long, value_name = "NONCE", default_value = "0", value_parser = parse_u64)]
    start_nonce: u64,

    /// Number of nonces to test (default: the rest of the 32-bit space)
    #[arg(long, value_name = "N", value_parser = parse_u64)]
    range: Option<u64>,

    /// Slices of the nonce space handed out as separate work units
    #[arg(long, value_name = "N", default_value_t = NSLICES)]
    slices: u64,

    /// Seconds between status lines
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    status_secs: u64,

    #[command(flatten)]
    engines: EngineArgs,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Seconds per benchmark round
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    secs: u64,

    /// Number of benchmark rounds
    #[arg(long, value_name = "N", default_value_t = 3)]
    rounds: u32,

    /// Write the benchmark report as JSON
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Compare against an earlier JSON report
    #[arg(long, value_name = "PATH")]
    baseline: Option<PathBuf>,

    #[command(flatten)]
    engines: EngineArgs,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub realization: Realization,
    pub engines: usize,
    pub pin_cores: bool,
    pub check_interval: u64,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub data: [u8; DATA_LEN],
    pub target: [u8; TARGET_LEN],
    pub start_nonce: u64,
    pub range: u64,
    pub slices: u64,
    pub status_interval: Duration,
    pub engines: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub secs: u64,
    pub rounds: u32,
    pub output: Option<PathBuf>,
    pub baseline: Option<PathBuf>,
    pub engines: EngineConfig,
}

#[derive(Debug, Clone)]
pub enum Config {
    Search(SearchConfig),
    Bench(BenchConfig),
    Info,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        match cli.command {
            Command::Search(args) => {
                let data = decode_fixed::<DATA_LEN>(&args.data, "data")?;
                let target = decode_fixed::<TARGET_LEN>(&args.target, "target")?;
                if args.start_nonce > u64::from(u32::MAX) {
                    bail!("start nonce {:#x} is outside the 32-bit nonce space", args.start_nonce);
                }
                let remaining = (1u64 << 32) - args.start_nonce;
                let range = args.range.unwrap_or(remaining);
                if range == 0 {
                    bail!("range must be at least 1");
                }
                if range > remaining {
                    bail!(
                        "range {range:#x} runs past the 32-bit nonce space ({remaining:#x} nonces left from {:#x})",
                        args.start_nonce
                    );
                }
                if args.slices == 0 {
                    bail!("slices must be at least 1");
                }
                Ok(Self::Search(SearchConfig {
                    data,
                    target,
                    start_nonce: args.start_nonce,
                    range,
                    slices: args.slices,
                    status_interval: Duration::from_secs(args.status_secs.max(1)),
                    engines: engine_config(&args.engines, cli.debug)?,
                }))
            }
            Command::Bench(args) => {
                if args.rounds == 0 {
                    bail!("rounds must be at least 1");
                }
                Ok(Self::Bench(BenchConfig {
                    secs: args.secs.max(1),
                    rounds: args.rounds,
                    output: args.output,
                    baseline: args.baseline,
                    engines: engine_config(&args.engines, cli.debug)?,
                }))
            }
            Command::Info => Ok(Self::Info),
        }
    }
}

fn engine_config(args: &EngineArgs, debug: bool) -> Result<EngineConfig> {
    let realization = Realization::from(args.realization);
    let engines = match args.engines {
        Some(0) => bail!("engine count must be at least 1"),
        Some(count) => count,
        None => default_engines(cellminer::usable_engines(realization)),
    };
    if args.check_interval == 0 {
        bail!("check interval must be at least 1");
    }
    Ok(EngineConfig {
        realization,
        engines,
        pin_cores: args.pin_cores,
        check_interval: args.check_interval,
        debug,
    })
}

fn default_engines(usable: Option<usize>) -> usize {
    usable
        .map(|usable| usable.saturating_sub(RESERVED_ENGINES))
        .unwrap_or(1)
        .max(1)
}

pub fn parse_u64(value: &str) -> std::result::Result<u64, String> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|err| format!("invalid hex value '{value}': {err}")),
        None => value
            .parse::<u64>()
            .map_err(|err| format!("invalid decimal value '{value}': {err}")),
    }
}

fn decode_fixed<const N: usize>(text: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(text.trim()).with_context(|| format!("{field} is not valid hex"))?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("{field} must be {N} bytes, got {}", bytes.len()))
}
