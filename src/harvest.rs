use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::asm::{routine, Assembler, PatchAssembler, PatchParams};
use crate::config::{PatchConfig, SessionConfig};
use crate::device::{Transport, TransportError, TransportOp};
use crate::error::{Error, Phase};
use crate::patcher::{MemoryPatcher, PatchKind, PatchSite};
use crate::signal::{self, SignalHandle, WaitError};
use crate::validate::{strip_sentinels, validate, Validation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Idle,
    Installed,
    Triggering,
    Waiting,
    Reading,
    Validating,
    Done,
}

/// Payload bytes of every accepted round, sentinels removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    bytes: Vec<u8>,
    rounds: u32,
}

impl Dataset {
    pub fn append_round(&mut self, payload: &[u8]) {
        self.bytes.extend_from_slice(payload);
        self.rounds += 1;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Round that used up its retry budget and ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub round: u32,
    pub attempts: u32,
}

/// Outcome of `run`. The dataset holds every accepted round even when the
/// session stopped early.
#[derive(Debug)]
pub struct HarvestReport {
    pub dataset: Dataset,
    /// Round attempts thrown away because of recoverable failures.
    pub discarded: u32,
    /// Stopped by the cancellation flag before reaching the target.
    pub cancelled: bool,
    /// Set when a round failed more than `max_retries` times in a row.
    pub exhausted: Option<Exhausted>,
}

/// Why a single round attempt was thrown away. Never leaves `run`.
#[derive(Debug)]
enum RoundFailure {
    Corrupted { offset: usize, address: u32 },
    Timeout,
    Transport(TransportError),
    ShortRead { expected: usize, got: usize },
    SignalClosed,
    Cancelled,
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundFailure::Corrupted { offset, address } => {
                write!(f, "data corrupted at 0x{:x} (offset {})", address, offset)
            }
            RoundFailure::Timeout => write!(f, "{}", WaitError::Timeout),
            RoundFailure::Transport(e) => write!(f, "{}", e),
            RoundFailure::ShortRead { expected, got } => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            RoundFailure::SignalClosed => write!(f, "{}", WaitError::Closed),
            RoundFailure::Cancelled => write!(f, "{}", WaitError::Cancelled),
        }
    }
}

fn enter(state: &mut HarvestState, next: HarvestState) {
    log::trace!("{:?} -> {:?}", state, next);
    *state = next;
}

/// Drives one harvesting session against one device.
pub struct Harvester<T: Transport, A: Assembler> {
    patcher: MemoryPatcher<T>,
    assembler: PatchAssembler<A>,
    session: SessionConfig,
    patch: PatchConfig,
    template: String,
    template_stride: usize,
    state: HarvestState,
    signal: Option<SignalHandle>,
    dataset: Dataset,
    discarded: u32,
}

impl<T: Transport, A: Assembler> Harvester<T, A> {
    /// `transport` must already be connected.
    pub fn new(transport: T, assembler: A, session: SessionConfig, patch: PatchConfig) -> Self {
        Self {
            patcher: MemoryPatcher::new(transport),
            assembler: PatchAssembler::new(assembler),
            session,
            patch,
            template: routine::CYW20735_HARVEST.to_string(),
            template_stride: routine::CYW20735_RECORD_STRIDE,
            state: HarvestState::Idle,
            signal: None,
            dataset: Dataset::default(),
            discarded: 0,
        }
    }

    /// Use another routine. `record_stride` is the record size it writes.
    pub fn with_template(mut self, template: impl Into<String>, record_stride: usize) -> Self {
        self.template = template.into();
        self.template_stride = record_stride;
        self
    }

    pub fn state(&self) -> HarvestState {
        self.state
    }

    pub fn patcher(&self) -> &MemoryPatcher<T> {
        &self.patcher
    }

    /// Assemble and install the routine, neutralize the ROM RNG, redirect the
    /// launch path and subscribe to completion events. Every failure here is
    /// fatal for the session.
    pub fn install(&mut self) -> Result<(), Error> {
        if self.state != HarvestState::Idle {
            return Ok(());
        }

        if self.session.record_stride != self.template_stride {
            return Err(Error::InvalidArgs(format!(
                "record stride {} does not match the routine's {}-byte records",
                self.session.record_stride, self.template_stride
            )));
        }

        let load_address = self.session.load_address;
        let result_address = self.session.result_address;
        let marker = self.session.marker_bytes();
        let params = PatchParams {
            rounds: self.session.rounds_per_trigger,
            dst: result_address,
            sentinel: self.session.sentinel,
            marker,
        };

        log::info!("installing assembly patches...");
        let image = self.assembler.assemble(&self.template, &params, load_address)?;

        let buf_start = result_address as u64;
        let buf_end = buf_start + self.session.buffer_len() as u64;
        if (image.load_address() as u64) < buf_end && buf_start < image.end() as u64 {
            return Err(Error::InvalidArgs(format!(
                "patch image 0x{:x}..0x{:x} overlaps result buffer 0x{:x}..0x{:x}",
                image.load_address(),
                image.end(),
                buf_start,
                buf_end
            )));
        }

        let neutralize_at = self.patch.neutralize_address;
        let ret = self.assembler.assemble_snippet(routine::NEUTRALIZE, neutralize_at)?;
        let neutralize = PatchSite::new(PatchKind::Neutralize, neutralize_at, &ret)?;
        let redirect = PatchSite::redirect(self.patch.dispatch_entry, load_address);

        self.patcher
            .install(image)
            .map_err(|e| Error::transport(Phase::Install, e))?;
        self.patcher
            .patch_site(neutralize)
            .map_err(|e| Error::transport(Phase::PatchSite, e))?;
        self.patcher
            .patch_site(redirect)
            .map_err(|e| Error::transport(Phase::PatchSite, e))?;

        let handle = signal::subscribe(self.patcher.transport_mut(), signal::marker_predicate(marker))
            .map_err(|e| Error::transport(Phase::Subscribe, e))?;
        self.signal = Some(handle);

        enter(&mut self.state, HarvestState::Installed);
        log::info!("installed all RNG hooks");
        Ok(())
    }

    /// Harvest until the target round count is reached or `cancel` is set.
    ///
    /// `cancel` is checked before every trigger, never while the device is
    /// executing or being patched.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<HarvestReport, Error> {
        if self.state == HarvestState::Done {
            return Err(Error::InvalidArgs("harvest session already finished".into()));
        }
        self.install()?;

        let target = self.session.target_rounds;
        let mut attempts = 0u32;
        let mut cancelled = false;
        let mut exhausted = None;

        while self.dataset.rounds() < target {
            if cancel.load(Ordering::Relaxed) {
                log::warn!(
                    "cancelled after {} of {} rounds",
                    self.dataset.rounds(),
                    target
                );
                cancelled = true;
                break;
            }

            let round = self.dataset.rounds();
            log::info!("RNG round {}...", round);
            match self.harvest_round(cancel) {
                Ok(payload) => {
                    self.dataset.append_round(&payload);
                    attempts = 0;
                }
                Err(RoundFailure::SignalClosed) => {
                    return Err(Error::transport(
                        Phase::Subscribe,
                        TransportError::new(TransportOp::Subscribe, None, "completion event channel closed"),
                    ));
                }
                Err(RoundFailure::Cancelled) => {
                    self.discarded += 1;
                    log::debug!("round {} abandoned while waiting", round);
                }
                Err(failure) => {
                    attempts += 1;
                    self.discarded += 1;
                    log::warn!("    {}, repeating round {}", failure, round);
                    if attempts > self.session.max_retries {
                        log::error!(
                            "round {} failed {} times, stopping with {} rounds",
                            round,
                            attempts,
                            self.dataset.rounds()
                        );
                        exhausted = Some(Exhausted { round, attempts });
                        break;
                    }
                }
            }
        }

        enter(&mut self.state, HarvestState::Done);
        self.signal = None;
        log::info!(
            "finished acquiring random data: {} rounds, {} bytes, {} discarded",
            self.dataset.rounds(),
            self.dataset.len(),
            self.discarded
        );
        Ok(HarvestReport {
            dataset: std::mem::take(&mut self.dataset),
            discarded: self.discarded,
            cancelled,
            exhausted,
        })
    }

    /// Put every patched site back the way it was found. The routine image
    /// stays in RAM; nothing dispatches to it once the redirect is gone.
    pub fn restore(&mut self) -> Result<(), Error> {
        self.signal = None;
        self.patcher
            .revert_all()
            .map_err(|e| Error::transport(Phase::PatchSite, e))?;
        if let Some(image) = self.patcher.installed() {
            log::debug!(
                "patch sites restored, image left at 0x{:x}..0x{:x}",
                image.load_address(),
                image.end()
            );
        }
        Ok(())
    }

    /// One scrub → trigger → wait → read → validate cycle.
    ///
    /// The result buffer is overwritten with a non-sentinel byte before the
    /// trigger, so a late notification from an earlier round can only
    /// release a read of records this round has not written, and those fail
    /// validation.
    fn harvest_round(&mut self, cancel: &AtomicBool) -> Result<Vec<u8>, RoundFailure> {
        let handle = self.signal.as_ref().ok_or(RoundFailure::SignalClosed)?;
        let stride = self.session.record_stride;
        let result_address = self.session.result_address;
        let expected = self.session.buffer_len();

        let stale = handle.drain();
        if stale > 0 {
            log::debug!("discarded {} late completion event(s)", stale);
        }

        enter(&mut self.state, HarvestState::Triggering);
        let scrub = vec![!self.session.sentinel; expected];
        self.patcher
            .transport_mut()
            .write(result_address, &scrub)
            .map_err(RoundFailure::Transport)?;
        self.patcher
            .transport_mut()
            .trigger(self.session.load_address)
            .map_err(RoundFailure::Transport)?;

        enter(&mut self.state, HarvestState::Waiting);
        handle
            .await_one(self.session.signal_timeout(), cancel)
            .map_err(|e| match e {
                WaitError::Timeout => RoundFailure::Timeout,
                WaitError::Closed => RoundFailure::SignalClosed,
                WaitError::Cancelled => RoundFailure::Cancelled,
            })?;
        log::debug!("random data done");

        enter(&mut self.state, HarvestState::Reading);
        let buffer = self
            .patcher
            .read(result_address, expected)
            .map_err(RoundFailure::Transport)?;
        if buffer.len() != expected {
            return Err(RoundFailure::ShortRead {
                expected,
                got: buffer.len(),
            });
        }

        enter(&mut self.state, HarvestState::Validating);
        match validate(&buffer, stride, self.session.sentinel) {
            Validation::Valid => Ok(strip_sentinels(&buffer, stride)),
            Validation::Corrupted { offset } => Err(RoundFailure::Corrupted {
                offset,
                address: result_address.wrapping_add(offset as u32),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::thumb::ThumbAssembler;
    use crate::device::sim::tests::quiet_config;
    use crate::device::sim::{SimDevice, SimRoutine};
    use crate::device::{EventCallback, PATCH_WIDTH};
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Outcome {
        Valid,
        Corrupted,
        DropEvent,
        ReadFail,
        /// Completion event arrives but the routine never ran.
        Stale,
    }

    /// Device double that plays back one scripted outcome per trigger and
    /// delivers the completion event before `trigger` returns.
    struct Scripted {
        outcomes: VecDeque<Outcome>,
        current: Outcome,
        callbacks: Vec<EventCallback>,
        ops: Vec<&'static str>,
        fail_write: bool,
        fail_patch_at: Option<u32>,
        fail_subscribe: bool,
        scrubbed: Vec<u8>,
        next_byte: u8,
    }

    impl Scripted {
        fn new(outcomes: &[Outcome]) -> Self {
            Self {
                outcomes: outcomes.iter().copied().collect(),
                current: Outcome::Valid,
                callbacks: Vec::new(),
                ops: Vec::new(),
                fail_write: false,
                fail_patch_at: None,
                fail_subscribe: false,
                scrubbed: Vec::new(),
                next_byte: 0,
            }
        }

        fn triggers(&self) -> usize {
            self.ops.iter().filter(|op| **op == "trigger").count()
        }
    }

    impl Transport for Scripted {
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn write(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
            if self.fail_write {
                return Err(TransportError::new(TransportOp::Write, Some(address), "no ack"));
            }
            if address == session(1).result_address {
                self.ops.push("scrub");
                self.scrubbed = data.to_vec();
            } else {
                self.ops.push("write");
            }
            Ok(())
        }

        fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TransportError> {
            if address != session(1).result_address {
                return Ok(vec![0; length]);
            }
            self.ops.push("read");
            if self.current == Outcome::ReadFail {
                return Err(TransportError::new(TransportOp::Read, Some(address), "timeout"));
            }
            if self.current == Outcome::Stale {
                return Ok(self.scrubbed.clone());
            }
            let mut buf = Vec::with_capacity(length);
            for i in 0..length {
                if i % 5 == 4 {
                    buf.push(0x42);
                } else {
                    buf.push(self.next_byte % 0x40);
                    self.next_byte = self.next_byte.wrapping_add(1);
                }
            }
            if self.current == Outcome::Corrupted {
                buf[length - 1] = 0x00;
            }
            Ok(buf)
        }

        fn patch_rom(&mut self, address: u32, _word: [u8; PATCH_WIDTH]) -> Result<(), TransportError> {
            if self.fail_patch_at == Some(address) {
                return Err(TransportError::new(TransportOp::PatchRom, Some(address), "no free patchram slot"));
            }
            self.ops.push("patch");
            Ok(())
        }

        fn subscribe_events(&mut self, callback: EventCallback) -> Result<(), TransportError> {
            if self.fail_subscribe {
                return Err(TransportError::new(TransportOp::Subscribe, None, "event mask rejected"));
            }
            self.callbacks.push(callback);
            Ok(())
        }

        fn trigger(&mut self, _address: u32) -> Result<(), TransportError> {
            self.ops.push("trigger");
            self.current = self.outcomes.pop_front().unwrap_or(Outcome::Valid);
            if self.current != Outcome::DropEvent {
                for cb in &self.callbacks {
                    cb(b"RAND\x00\x00\x00\x00");
                }
            }
            Ok(())
        }
    }

    fn session(target_rounds: u32) -> SessionConfig {
        SessionConfig {
            rounds_per_trigger: 4,
            target_rounds,
            max_retries: 3,
            signal_timeout_ms: 20,
            ..Default::default()
        }
    }

    fn harvester(t: Scripted, target_rounds: u32) -> Harvester<Scripted, ThumbAssembler> {
        Harvester::new(t, ThumbAssembler, session(target_rounds), PatchConfig::default())
    }

    fn round_ops(ops: &[&'static str]) -> Vec<&'static str> {
        ops.iter().copied().filter(|op| *op == "trigger" || *op == "read").collect()
    }

    #[test]
    fn test_install_sequence() {
        let mut h = harvester(Scripted::new(&[]), 1);
        h.install().unwrap();
        assert_eq!(h.state(), HarvestState::Installed);
        assert_eq!(h.patcher().applied_sites().len(), 2);
        assert_eq!(h.patcher().applied_sites()[0].kind, PatchKind::Neutralize);
        assert_eq!(h.patcher().applied_sites()[1].kind, PatchKind::Redirect);
        assert_eq!(
            h.patcher().applied_sites()[1].replacement,
            (0x217000u32 | 1).to_le_bytes()
        );
    }

    #[test]
    fn test_corrupted_rounds_do_not_advance() {
        let t = Scripted::new(&[Outcome::Corrupted, Outcome::Corrupted, Outcome::Valid]);
        let mut h = harvester(t, 1);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.rounds(), 1);
        assert_eq!(report.dataset.len(), 4 * 4);
        assert_eq!(report.discarded, 2);
        assert!(!report.cancelled);
        assert_eq!(h.patcher.transport_mut().triggers(), 3);
        assert_eq!(h.state(), HarvestState::Done);
    }

    #[test]
    fn test_dataset_length_and_no_sentinels() {
        let mut h = harvester(Scripted::new(&[]), 3);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.len(), 3 * 4 * (5 - 1));
        assert!(!report.dataset.bytes().contains(&0x42));
    }

    #[test]
    fn test_one_trigger_per_notification() {
        let mut h = harvester(Scripted::new(&[]), 20);
        h.run(&AtomicBool::new(false)).unwrap();
        let ops = round_ops(&h.patcher.transport_mut().ops);
        assert_eq!(ops.len(), 40);
        for pair in ops.chunks(2) {
            assert_eq!(pair, ["trigger", "read"]);
        }
    }

    #[test]
    fn test_retry_exhausted() {
        let t = Scripted::new(&[Outcome::Corrupted; 10]);
        let mut h = harvester(t, 1);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.exhausted, Some(Exhausted { round: 0, attempts: 4 }));
        assert!(report.dataset.is_empty());
        assert_eq!(h.patcher.transport_mut().triggers(), 4);
        assert_eq!(h.state(), HarvestState::Done);
    }

    #[test]
    fn test_exhausted_keeps_collected_rounds() {
        let mut outcomes = vec![Outcome::Valid, Outcome::Valid];
        outcomes.extend([Outcome::Corrupted; 10]);
        let mut h = harvester(Scripted::new(&outcomes), 5);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.exhausted, Some(Exhausted { round: 2, attempts: 4 }));
        assert_eq!(report.dataset.rounds(), 2);
        assert_eq!(report.dataset.len(), 2 * 4 * 4);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_buffer_scrubbed_before_every_trigger() {
        let mut h = harvester(Scripted::new(&[]), 3);
        h.run(&AtomicBool::new(false)).unwrap();
        let t = h.patcher.transport_mut();
        let ops: Vec<_> = t
            .ops
            .iter()
            .copied()
            .filter(|op| *op == "scrub" || *op == "trigger")
            .collect();
        assert_eq!(ops, ["scrub", "trigger"].repeat(3));
        assert_eq!(t.scrubbed.len(), 4 * 5);
        assert!(!t.scrubbed.contains(&0x42));
    }

    #[test]
    fn test_stale_notification_fails_validation() {
        let t = Scripted::new(&[Outcome::Stale, Outcome::Valid]);
        let mut h = harvester(t, 1);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.rounds(), 1);
        assert_eq!(report.discarded, 1);
        assert!(!report.dataset.bytes().contains(&!0x42u8));
    }

    #[test]
    fn test_cancel_interrupts_wait_without_timeout() {
        let mut cfg = session(3);
        cfg.signal_timeout_ms = 0;
        let t = Scripted::new(&[Outcome::Valid, Outcome::DropEvent]);
        let mut h = Harvester::new(t, ThumbAssembler, cfg, PatchConfig::default());
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let setter = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                cancel.store(true, Ordering::Relaxed);
            })
        };
        let report = h.run(&cancel).unwrap();
        setter.join().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.dataset.rounds(), 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.exhausted, None);
        assert_eq!(h.patcher.transport_mut().triggers(), 2);
    }

    #[test]
    fn test_neutralize_failure_is_fatal() {
        let mut t = Scripted::new(&[]);
        t.fail_patch_at = Some(0xa562e);
        let mut h = harvester(t, 1);
        match h.run(&AtomicBool::new(false)) {
            Err(Error::Transport { phase, source }) => {
                assert_eq!(phase, Phase::PatchSite);
                assert_eq!(source.op, TransportOp::PatchRom);
                assert_eq!(source.address, Some(0xa562e));
            }
            other => panic!("expected patch site failure, got {:?}", other.map(|r| r.dataset)),
        }
        assert_eq!(h.patcher.transport_mut().triggers(), 0);
        assert!(h.patcher().applied_sites().is_empty());
    }

    #[test]
    fn test_redirect_failure_is_fatal_and_restorable() {
        let mut t = Scripted::new(&[]);
        t.fail_patch_at = Some(0x1425bc);
        let mut h = harvester(t, 1);
        match h.run(&AtomicBool::new(false)) {
            Err(Error::Transport { phase, source }) => {
                assert_eq!(phase, Phase::PatchSite);
                assert_eq!(source.address, Some(0x1425bc));
            }
            other => panic!("expected patch site failure, got {:?}", other.map(|r| r.dataset)),
        }
        assert_eq!(h.patcher.transport_mut().triggers(), 0);
        assert_eq!(h.patcher().applied_sites().len(), 1);
        assert_eq!(h.state(), HarvestState::Idle);

        h.restore().unwrap();
        assert!(h.patcher().applied_sites().is_empty());
        // neutralize applied, then reverted
        let patches = h.patcher.transport_mut().ops.iter().filter(|op| **op == "patch").count();
        assert_eq!(patches, 2);
    }

    #[test]
    fn test_subscribe_failure_is_fatal() {
        let mut t = Scripted::new(&[]);
        t.fail_subscribe = true;
        let mut h = harvester(t, 1);
        match h.run(&AtomicBool::new(false)) {
            Err(Error::Transport { phase, source }) => {
                assert_eq!(phase, Phase::Subscribe);
                assert_eq!(source.op, TransportOp::Subscribe);
            }
            other => panic!("expected subscribe failure, got {:?}", other.map(|r| r.dataset)),
        }
        assert_eq!(h.patcher.transport_mut().triggers(), 0);
        assert_eq!(h.patcher().applied_sites().len(), 2);
        h.restore().unwrap();
        assert!(h.patcher().applied_sites().is_empty());
    }

    #[test]
    fn test_stride_mismatch_rejected_before_device_access() {
        let mut cfg = session(1);
        cfg.record_stride = 9;
        let mut h = Harvester::new(Scripted::new(&[]), ThumbAssembler, cfg, PatchConfig::default());
        assert!(matches!(h.install(), Err(Error::InvalidArgs(_))));
        assert!(h.patcher.transport_mut().ops.is_empty());

        // a routine that writes 9-byte records is accepted
        let mut cfg = session(1);
        cfg.record_stride = 9;
        let mut h = Harvester::new(Scripted::new(&[]), ThumbAssembler, cfg, PatchConfig::default())
            .with_template(routine::CYW20735_HARVEST, 9);
        assert!(h.install().is_ok());
    }

    #[test]
    fn test_dropped_event_times_out_and_retries() {
        let t = Scripted::new(&[Outcome::DropEvent, Outcome::Valid]);
        let mut h = harvester(t, 1);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.rounds(), 1);
        assert_eq!(report.discarded, 1);
        // no read for the round whose event never came
        assert_eq!(
            round_ops(&h.patcher.transport_mut().ops),
            vec!["trigger", "trigger", "read"]
        );
    }

    #[test]
    fn test_read_failure_is_retried() {
        let t = Scripted::new(&[Outcome::ReadFail, Outcome::Valid]);
        let mut h = harvester(t, 1);
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.rounds(), 1);
        assert_eq!(report.discarded, 1);
    }

    #[test]
    fn test_cancel_before_trigger() {
        let mut h = harvester(Scripted::new(&[]), 5);
        let report = h.run(&AtomicBool::new(true)).unwrap();
        assert!(report.cancelled);
        assert!(report.dataset.is_empty());
        assert_eq!(h.patcher.transport_mut().triggers(), 0);
        // the device was fully patched before the flag was honoured
        assert_eq!(h.patcher().applied_sites().len(), 2);
    }

    #[test]
    fn test_install_failure_is_fatal() {
        let mut t = Scripted::new(&[]);
        t.fail_write = true;
        let mut h = harvester(t, 1);
        match h.run(&AtomicBool::new(false)) {
            Err(Error::Transport { phase, source }) => {
                assert_eq!(phase, Phase::Install);
                assert_eq!(source.address, Some(0x217000));
            }
            other => panic!("expected install failure, got {:?}", other.map(|r| r.dataset)),
        }
        assert_eq!(h.patcher.transport_mut().triggers(), 0);
        assert!(h.patcher().applied_sites().is_empty());
    }

    #[test]
    fn test_overlapping_buffer_rejected() {
        let mut cfg = session(1);
        cfg.result_address = cfg.load_address + 8;
        let mut h = Harvester::new(Scripted::new(&[]), ThumbAssembler, cfg, PatchConfig::default());
        assert!(matches!(h.install(), Err(Error::InvalidArgs(_))));
        assert_eq!(h.state(), HarvestState::Idle);
    }

    #[test]
    fn test_unresolved_template_fails_before_device_access() {
        let mut h = harvester(Scripted::new(&[]), 1).with_template("ldr r0, =${missing}", 5);
        assert!(matches!(h.install(), Err(Error::Assembly(_))));
        assert!(h.patcher.transport_mut().ops.is_empty());
    }

    #[test]
    fn test_finished_session_cannot_rerun() {
        let mut h = harvester(Scripted::new(&[]), 1);
        h.run(&AtomicBool::new(false)).unwrap();
        assert!(h.run(&AtomicBool::new(false)).is_err());
    }

    #[test]
    fn test_restore_reverts_sites() {
        let mut h = harvester(Scripted::new(&[]), 1);
        h.run(&AtomicBool::new(false)).unwrap();
        h.restore().unwrap();
        assert!(h.patcher().applied_sites().is_empty());
        let patches = h.patcher.transport_mut().ops.iter().filter(|op| **op == "patch").count();
        assert_eq!(patches, 4);
    }

    fn sim_session(target_rounds: u32) -> (SessionConfig, SimRoutine) {
        let cfg = SessionConfig {
            rounds_per_trigger: 8,
            target_rounds,
            max_retries: 50,
            signal_timeout_ms: 2000,
            ..Default::default()
        };
        let routine = SimRoutine {
            rounds: cfg.rounds_per_trigger,
            ..quiet_config(0).routine
        };
        (cfg, routine)
    }

    #[test]
    fn test_end_to_end_against_simulator() {
        let (cfg, routine) = sim_session(5);
        let mut sim_cfg = quiet_config(42);
        sim_cfg.routine = routine;
        sim_cfg.corruption_per_mille = 300;
        let mut dev = SimDevice::new(sim_cfg);
        dev.connect().unwrap();

        let mut h = Harvester::new(dev, ThumbAssembler, cfg, PatchConfig::default());
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.dataset.rounds(), 5);
        assert_eq!(report.dataset.len(), 5 * 8 * 4);
        assert_eq!(
            h.patcher.transport_mut().triggers(),
            5 + report.discarded as u64
        );
    }

    #[test]
    fn test_simulator_dropping_every_event_gives_up() {
        let (mut cfg, routine) = sim_session(1);
        cfg.max_retries = 2;
        cfg.signal_timeout_ms = 20;
        let mut sim_cfg = quiet_config(5);
        sim_cfg.routine = routine;
        sim_cfg.drop_per_mille = 1000;
        let mut dev = SimDevice::new(sim_cfg);
        dev.connect().unwrap();

        let mut h = Harvester::new(dev, ThumbAssembler, cfg, PatchConfig::default());
        let report = h.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.exhausted, Some(Exhausted { round: 0, attempts: 3 }));
        assert!(report.dataset.is_empty());
    }
}
