use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::asm::thumb::ThumbAssembler;
use crate::asm::{routine, PatchAssembler, PatchParams};
use crate::config::{Config, PatchConfig, SessionConfig, SimulatorConfig};
use crate::device::sim::{SimConfig, SimDevice, SimRoutine};
use crate::device::Transport;
use crate::error::{Error, Phase};
use crate::harvest::{HarvestReport, Harvester};
use crate::output::{FilePersistence, Persistence, SessionMetadata};
use crate::patcher::{hex, PatchKind, PatchSite};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

/// Board model matching what the session is going to install.
fn sim_config(session: &SessionConfig, patch: &PatchConfig, sim: &SimulatorConfig) -> SimConfig {
    SimConfig {
        seed: sim.seed,
        corruption_per_mille: sim.corruption_per_mille,
        drop_per_mille: sim.drop_per_mille,
        read_fail_per_mille: sim.read_fail_per_mille,
        event_latency: Duration::from_millis(sim.event_latency_ms),
        routine: SimRoutine {
            load_address: session.load_address,
            result_address: session.result_address,
            rounds: session.rounds_per_trigger,
            stride: session.record_stride,
            sentinel: session.sentinel,
            marker: session.marker_bytes(),
            rng_function: patch.neutralize_address,
            launch_entry: patch.dispatch_entry,
        },
    }
}

/// Connect, harvest and hand the dataset to `persistence`.
///
/// Whatever was collected is stored before a retry-exhausted session is
/// reported as an error.
pub fn harvest<T: Transport, P: Persistence>(
    mut transport: T,
    config: &Config,
    persistence: &mut P,
    cancel: &AtomicBool,
) -> Result<(HarvestReport, PathBuf), Error> {
    transport
        .connect()
        .map_err(|e| Error::transport(Phase::Connect, e))?;
    log::info!(
        target: "rngharvest::session",
        "connected: target={} rounds, 0x{:x} rounds/trigger, stride {}",
        config.session.target_rounds,
        config.session.rounds_per_trigger,
        config.session.record_stride,
    );

    let mut harvester = Harvester::new(
        transport,
        ThumbAssembler,
        config.session.clone(),
        config.patch.clone(),
    );
    let result = harvester.run(cancel);
    if let Err(e) = harvester.restore() {
        log::warn!(target: "rngharvest::session", "could not restore patch sites: {}", e);
    }
    let report = result?;
    let exhausted = report.exhausted.map(|e| Error::RetryExhausted {
        round: e.round,
        attempts: e.attempts,
    });

    if report.dataset.is_empty() {
        return Err(exhausted
            .unwrap_or_else(|| Error::InvalidArgs("no rounds harvested, nothing to store".into())));
    }

    let meta = SessionMetadata::new(&config.session, &report, config.output.format, Utc::now());
    let path = persistence.persist(&report.dataset, &meta)?;
    log::info!(
        target: "rngharvest::session",
        "stored {} rounds ({} bytes, blake2b {}) in {}",
        meta.rounds,
        meta.payload_bytes,
        meta.blake2b,
        path.display(),
    );
    match exhausted {
        Some(e) => Err(e),
        None => Ok((report, path)),
    }
}

/// Harvest against the simulated board until done or interrupted.
pub fn run(config: &Config) -> Result<(), Error> {
    install_signal_handlers();
    if config.session.signal_timeout_ms == 0 {
        log::warn!(
            target: "rngharvest::session",
            "signal_timeout_ms = 0: a lost completion event stalls the session until interrupted"
        );
    }

    let device = SimDevice::new(sim_config(&config.session, &config.patch, &config.simulator));
    let mut persistence = FilePersistence::new(&config.output);
    let (report, _) = harvest(device, config, &mut persistence, &SHUTDOWN)?;

    if report.cancelled {
        log::warn!(
            target: "rngharvest::session",
            "interrupted, stored partial dataset of {} rounds",
            report.dataset.rounds()
        );
    }
    Ok(())
}

/// Print the image and patch sites a session would install, without
/// touching a device.
pub fn print_patches(config: &Config, out: &mut dyn Write) -> Result<(), Error> {
    let session = &config.session;
    let assembler = PatchAssembler::new(ThumbAssembler);
    let params = PatchParams {
        rounds: session.rounds_per_trigger,
        dst: session.result_address,
        sentinel: session.sentinel,
        marker: session.marker_bytes(),
    };
    let image = assembler.assemble(routine::CYW20735_HARVEST, &params, session.load_address)?;
    let ret = assembler.assemble_snippet(routine::NEUTRALIZE, config.patch.neutralize_address)?;
    let sites = [
        PatchSite::new(PatchKind::Neutralize, config.patch.neutralize_address, &ret)?,
        PatchSite::redirect(config.patch.dispatch_entry, session.load_address),
    ];

    write_patches(out, image.load_address(), image.bytes(), &sites)?;
    Ok(())
}

fn write_patches(
    out: &mut dyn Write,
    load_address: u32,
    bytes: &[u8],
    sites: &[PatchSite],
) -> io::Result<()> {
    writeln!(out, "image 0x{:x} ({} bytes):", load_address, bytes.len())?;
    for (i, chunk) in bytes.chunks(16).enumerate() {
        writeln!(out, "  {:08x}  {}", load_address as usize + i * 16, hex(chunk))?;
    }
    for site in sites {
        writeln!(out, "{} 0x{:x}: {}", site.kind, site.address, hex(&site.replacement))?;
    }
    Ok(())
}
