use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Config, OutputFormat};
use crate::logging::LogArgs;

/// Accept `0x`-prefixed hex as well as decimal.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let v = parse_u32(s)?;
    u8::try_from(v).map_err(|_| format!("{} does not fit in a byte", s))
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Rounds to harvest before stopping
    #[arg(short = 'n', long)]
    pub target_rounds: Option<u32>,

    /// Records the routine generates per trigger
    #[arg(long, value_parser = parse_u32)]
    pub rounds_per_trigger: Option<u32>,

    /// Address the routine is installed at
    #[arg(long, value_parser = parse_u32)]
    pub load_address: Option<u32>,

    /// Address of the result buffer
    #[arg(long, value_parser = parse_u32)]
    pub result_address: Option<u32>,

    /// Sentinel byte closing every record
    #[arg(long, value_parser = parse_u8)]
    pub sentinel: Option<u8>,

    /// Failed attempts tolerated per round
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Completion event timeout in milliseconds (0 waits forever)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct SimulatorArgs {
    /// Simulator RNG seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Chance per mille that a round is disturbed
    #[arg(long)]
    pub corruption_per_mille: Option<u32>,

    /// Chance per mille that a completion event is lost
    #[arg(long)]
    pub drop_per_mille: Option<u32>,
}

#[derive(Debug, Parser)]
#[command(name = "rngharvest", about = "Harvest hardware randomness from a patched CYW20735")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Directory the dataset is written to
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Dataset encoding
    #[arg(short = 'f', long = "format", value_enum)]
    pub format: Option<OutputFormat>,

    /// Configuration file path (default: /etc/rngharvest.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub simulator: SimulatorArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the patch image and patch sites without touching a device
    Assemble(AssembleArgs),
}

#[derive(Debug, Parser)]
pub struct AssembleArgs {
    /// Configuration file path (default: /etc/rngharvest.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

impl SessionArgs {
    pub fn apply(&self, cfg: &mut Config) {
        let s = &mut cfg.session;
        if let Some(v) = self.target_rounds {
            s.target_rounds = v;
        }
        if let Some(v) = self.rounds_per_trigger {
            s.rounds_per_trigger = v;
        }
        if let Some(v) = self.load_address {
            s.load_address = v;
        }
        if let Some(v) = self.result_address {
            s.result_address = v;
        }
        if let Some(v) = self.sentinel {
            s.sentinel = v;
        }
        if let Some(v) = self.max_retries {
            s.max_retries = v;
        }
        if let Some(v) = self.timeout_ms {
            s.signal_timeout_ms = v;
        }
    }
}

impl SimulatorArgs {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(v) = self.seed {
            cfg.simulator.seed = v;
        }
        if let Some(v) = self.corruption_per_mille {
            cfg.simulator.corruption_per_mille = v;
        }
        if let Some(v) = self.drop_per_mille {
            cfg.simulator.drop_per_mille = v;
        }
    }
}
