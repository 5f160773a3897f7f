use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asm::routine;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw binary bytes
    Raw,
    /// Hexadecimal (lowercase), one line
    Hex,
    /// Base64 (standard, with padding)
    Base64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub load_address: u32,
    pub result_address: u32,
    pub rounds_per_trigger: u32,
    pub record_stride: usize,
    pub sentinel: u8,
    pub target_rounds: u32,
    pub marker: String,
    pub max_retries: u32,
    /// 0 waits forever.
    pub signal_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            load_address: routine::CYW20735_LOAD_ADDRESS,
            result_address: routine::CYW20735_LOAD_ADDRESS + 0xf0,
            rounds_per_trigger: 0x500,
            record_stride: routine::CYW20735_RECORD_STRIDE,
            sentinel: 0x42,
            target_rounds: 1000,
            marker: "RAND".into(),
            max_retries: 32,
            signal_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Clamp fields to valid ranges.
    pub fn validate(&mut self) {
        if self.record_stride != routine::CYW20735_RECORD_STRIDE {
            log::warn!(
                "record_stride {} does not match the routine's {}-byte records, using {}",
                self.record_stride,
                routine::CYW20735_RECORD_STRIDE,
                routine::CYW20735_RECORD_STRIDE
            );
            self.record_stride = routine::CYW20735_RECORD_STRIDE;
        }
        self.rounds_per_trigger = self.rounds_per_trigger.clamp(1, 0x4000);
        self.target_rounds = self.target_rounds.max(1);
        self.max_retries = self.max_retries.min(10_000);
        self.signal_timeout_ms = self.signal_timeout_ms.min(600_000);
        if self.marker.len() != 4 {
            log::warn!("marker {:?} is not 4 bytes, using \"RAND\"", self.marker);
            self.marker = "RAND".into();
        }
    }

    pub fn marker_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        for (dst, src) in out.iter_mut().zip(self.marker.bytes()) {
            *dst = src;
        }
        out
    }

    /// Bytes the routine writes per trigger.
    pub fn buffer_len(&self) -> usize {
        self.rounds_per_trigger as usize * self.record_stride
    }

    pub fn signal_timeout(&self) -> Option<Duration> {
        match self.signal_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Entry of the ROM routine that competes for the hardware RNG.
    pub neutralize_address: u32,
    /// Dispatch-table slot redirected to the installed routine.
    pub dispatch_entry: u32,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            neutralize_address: routine::CYW20735_RNG_FUNCTION,
            dispatch_entry: routine::CYW20735_LAUNCH_RAM_ENTRY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub seed: u64,
    pub corruption_per_mille: u32,
    pub drop_per_mille: u32,
    pub read_fail_per_mille: u32,
    pub event_latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            corruption_per_mille: 20,
            drop_per_mille: 0,
            read_fail_per_mille: 0,
            event_latency_ms: 2,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&mut self) {
        self.corruption_per_mille = self.corruption_per_mille.min(1000);
        self.drop_per_mille = self.drop_per_mille.min(1000);
        self.read_fail_per_mille = self.read_fail_per_mille.min(1000);
        self.event_latency_ms = self.event_latency_ms.min(10_000);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            prefix: "cyw20735".into(),
            format: OutputFormat::Raw,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub patch: PatchConfig,
    pub simulator: SimulatorConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn validate(&mut self) {
        self.session.validate();
        self.simulator.validate();
    }
}

/// Load configuration from a TOML file.
///
/// - If `explicit_path` is `Some` and the file is missing, returns an error.
/// - If `explicit_path` is `None`, tries `/etc/rngharvest.toml`; if missing, returns defaults.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config, Error> {
    let path = match explicit_path {
        Some(p) => {
            if !p.exists() {
                return Err(Error::InvalidArgs(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            p.to_path_buf()
        }
        None => {
            let default = Path::new("/etc/rngharvest.toml");
            if !default.exists() {
                return Ok(Config::default());
            }
            default.to_path_buf()
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        Error::InvalidArgs(format!("failed to read config {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&contents).map_err(|e| {
        Error::InvalidArgs(format!("failed to parse config {}: {}", path.display(), e))
    })?;

    Ok(config)
}
