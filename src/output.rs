use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{OutputConfig, OutputFormat, SessionConfig};
use crate::digest;
use crate::error::Error;
use crate::harvest::{Dataset, HarvestReport};
use crate::patcher::hex;

/// Everything a reader of the artifact needs to interpret it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub rounds: u32,
    pub rounds_per_trigger: u32,
    pub record_stride: usize,
    pub sentinel: u8,
    pub load_address: u32,
    pub result_address: u32,
    pub timestamp: DateTime<Utc>,
    pub cancelled: bool,
    /// Round that used up its retries, if that ended the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted_at_round: Option<u32>,
    pub discarded: u32,
    pub payload_bytes: usize,
    pub format: OutputFormat,
    pub blake2b: String,
}

impl SessionMetadata {
    pub fn new(
        session: &SessionConfig,
        report: &HarvestReport,
        format: OutputFormat,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let dataset = &report.dataset;
        Self {
            rounds: dataset.rounds(),
            rounds_per_trigger: session.rounds_per_trigger,
            record_stride: session.record_stride,
            sentinel: session.sentinel,
            load_address: session.load_address,
            result_address: session.result_address,
            timestamp,
            cancelled: report.cancelled,
            exhausted_at_round: report.exhausted.map(|e| e.round),
            discarded: report.discarded,
            payload_bytes: dataset.len(),
            format,
            blake2b: hex(&digest::dataset_digest(
                dataset.bytes(),
                dataset.rounds(),
                session.record_stride,
            )),
        }
    }
}

/// Final home of a harvested dataset.
pub trait Persistence {
    /// Store `dataset` and return where it went.
    fn persist(&mut self, dataset: &Dataset, meta: &SessionMetadata) -> Result<PathBuf, Error>;
}

/// Writes the dataset to a file plus a `.toml` metadata sidecar.
pub struct FilePersistence {
    directory: PathBuf,
    prefix: String,
    format: OutputFormat,
}

impl FilePersistence {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            prefix: config.prefix.clone(),
            format: config.format,
        }
    }

    fn artifact_name(&self, meta: &SessionMetadata) -> String {
        let ext = match self.format {
            OutputFormat::Raw => "bin",
            OutputFormat::Hex => "hex",
            OutputFormat::Base64 => "b64",
        };
        format!(
            "{}-randomdata-{}rounds-0x{:x}-{}.{}",
            self.prefix,
            meta.rounds,
            meta.rounds_per_trigger,
            meta.timestamp.format("%Y%m%dT%H%M%SZ"),
            ext
        )
    }
}

impl Persistence for FilePersistence {
    fn persist(&mut self, dataset: &Dataset, meta: &SessionMetadata) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(self.artifact_name(meta));

        let f = File::create(&path)?;
        let mut out = BufWriter::new(f);
        format_output(dataset.bytes(), self.format, &mut out)?;
        out.flush()?;

        let sidecar = toml::to_string(meta)
            .map_err(|e| Error::InvalidArgs(format!("cannot serialize metadata: {}", e)))?;
        let mut sidecar_path = OsString::from(path.as_os_str());
        sidecar_path.push(".toml");
        fs::write(PathBuf::from(sidecar_path), sidecar)?;

        log::info!("wrote {} bytes to {}", dataset.len(), path.display());
        Ok(path)
    }
}

fn format_output(bytes: &[u8], format: OutputFormat, out: &mut dyn Write) -> io::Result<()> {
    match format {
        OutputFormat::Raw => {
            out.write_all(bytes)?;
        }
        OutputFormat::Hex => {
            for b in bytes {
                write!(out, "{:02x}", b)?;
            }
            writeln!(out)?;
        }
        OutputFormat::Base64 => {
            writeln!(out, "{}", STANDARD.encode(bytes))?;
        }
    }
    Ok(())
}
