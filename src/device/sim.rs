//! In-process stand-in for a CYW20735 reached over HCI.
//!
//! Models the parts of the board the harvesting protocol depends on:
//! sparse memory, a limited number of 4-byte ROM patch slots, a launch-RAM
//! handler that only works once its dispatch entry is redirected, a ROM RNG
//! routine that competes for the hardware RNG until neutralized, and
//! completion events delivered from another thread. Corruption, dropped
//! events and read failures are injected at configurable rates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};

use super::{EventCallback, Transport, TransportError, TransportOp, PATCH_WIDTH};

/// First word of `rbg_rand` in ROM: `push {r4, lr}; sub sp, #16`.
pub const ROM_RNG_PROLOGUE: [u8; PATCH_WIDTH] = [0x10, 0xb5, 0x84, 0xb0];

/// Stock launch-RAM handler pointer in the vendor command table.
pub const ROM_LAUNCH_RAM_HANDLER: u32 = 0x0009_3b1d;

/// Patch slots the firmware leaves free for us.
const PATCH_SLOTS: usize = 16;

/// Command Complete for HCI_VSC_Launch_RAM (0xfc4e), status success.
const LAUNCH_RAM_COMPLETE: [u8; 4] = [0x01, 0x4e, 0xfc, 0x00];

/// What the injected routine does when it runs.
#[derive(Debug, Clone)]
pub struct SimRoutine {
    pub load_address: u32,
    pub result_address: u32,
    pub rounds: u32,
    pub stride: usize,
    pub sentinel: u8,
    pub marker: [u8; 4],
    pub rng_function: u32,
    pub launch_entry: u32,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub corruption_per_mille: u32,
    pub drop_per_mille: u32,
    pub read_fail_per_mille: u32,
    pub event_latency: Duration,
    pub routine: SimRoutine,
}

pub struct SimDevice {
    config: SimConfig,
    rng: ChaCha20Rng,
    memory: BTreeMap<u32, u8>,
    patched: BTreeSet<u32>,
    callbacks: Arc<Mutex<Vec<EventCallback>>>,
    connected: bool,
    triggers: u64,
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let mut dev = Self {
            rng: ChaCha20Rng::seed_from_u64(config.seed),
            config,
            memory: BTreeMap::new(),
            patched: BTreeSet::new(),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            connected: false,
            triggers: 0,
        };
        let routine = dev.config.routine.clone();
        dev.store(routine.rng_function, &ROM_RNG_PROLOGUE);
        dev.store(routine.launch_entry, &ROM_LAUNCH_RAM_HANDLER.to_le_bytes());
        dev
    }

    /// Number of triggers accepted so far.
    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    fn store(&mut self, address: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u32), b);
        }
    }

    fn load(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length)
            .map(|i| {
                self.memory
                    .get(&address.wrapping_add(i as u32))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn roll(&mut self, per_mille: u32) -> bool {
        per_mille > 0 && self.rng.next_u32() % 1000 < per_mille
    }

    fn ensure_connected(&self, op: TransportOp, address: Option<u32>) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::new(op, address, "not connected"));
        }
        Ok(())
    }

    /// Run the routine the way the board would: fill the result buffer one
    /// record at a time, then queue the completion event.
    fn execute_routine(&mut self) {
        let r = self.config.routine.clone();
        if r.stride == 0 {
            return;
        }
        let mut buffer = vec![0u8; r.rounds as usize * r.stride];
        for record in buffer.chunks_exact_mut(r.stride) {
            self.rng.fill_bytes(&mut record[..r.stride - 1]);
            record[r.stride - 1] = r.sentinel;
        }

        let rom_rng_active = self.load(r.rng_function, PATCH_WIDTH) == ROM_RNG_PROLOGUE;
        if (rom_rng_active || self.roll(self.config.corruption_per_mille)) && r.rounds > 0 {
            // another writer touched the region while we were filling it
            let victim = (self.rng.next_u32() % r.rounds) as usize;
            let pos = victim * r.stride + r.stride - 1;
            let delta = 1 + (self.rng.next_u32() % 255) as u8;
            buffer[pos] = r.sentinel.wrapping_add(delta);
            log::debug!(
                target: "rngharvest::sim",
                "corrupted record {} at 0x{:x}{}",
                victim,
                r.result_address.wrapping_add(pos as u32),
                if rom_rng_active { " (ROM RNG still live)" } else { "" },
            );
        }
        self.store(r.result_address, &buffer);

        let deliver = !self.roll(self.config.drop_per_mille);
        if !deliver {
            log::debug!(target: "rngharvest::sim", "dropping completion event");
        }
        let mut done = r.marker.to_vec();
        done.extend_from_slice(&[0u8; 4]);
        let callbacks = Arc::clone(&self.callbacks);
        let latency = self.config.event_latency;
        thread::spawn(move || {
            thread::sleep(latency);
            if let Ok(cbs) = callbacks.lock() {
                for cb in cbs.iter() {
                    cb(&LAUNCH_RAM_COMPLETE);
                    if deliver {
                        cb(&done);
                    }
                }
            }
        });
    }
}

impl Transport for SimDevice {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        log::debug!(target: "rngharvest::sim", "connected, seed={}", self.config.seed);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected(TransportOp::Write, Some(address))?;
        self.store(address, data);
        Ok(())
    }

    fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected(TransportOp::Read, Some(address))?;
        if self.roll(self.config.read_fail_per_mille) {
            return Err(TransportError::new(
                TransportOp::Read,
                Some(address),
                "Read_RAM response lost",
            ));
        }
        Ok(self.load(address, length))
    }

    fn patch_rom(&mut self, address: u32, word: [u8; PATCH_WIDTH]) -> Result<(), TransportError> {
        self.ensure_connected(TransportOp::PatchRom, Some(address))?;
        if address % 2 != 0 {
            return Err(TransportError::new(
                TransportOp::PatchRom,
                Some(address),
                "patch address must be halfword aligned",
            ));
        }
        if !self.patched.contains(&address) && self.patched.len() >= PATCH_SLOTS {
            return Err(TransportError::new(
                TransportOp::PatchRom,
                Some(address),
                "no free patchram slot",
            ));
        }
        self.patched.insert(address);
        self.store(address, &word);
        Ok(())
    }

    fn subscribe_events(&mut self, callback: EventCallback) -> Result<(), TransportError> {
        self.ensure_connected(TransportOp::Subscribe, None)?;
        match self.callbacks.lock() {
            Ok(mut cbs) => {
                cbs.push(callback);
                Ok(())
            }
            Err(_) => Err(TransportError::new(
                TransportOp::Subscribe,
                None,
                "event dispatcher poisoned",
            )),
        }
    }

    fn trigger(&mut self, address: u32) -> Result<(), TransportError> {
        self.ensure_connected(TransportOp::Trigger, Some(address))?;
        let r = self.config.routine.clone();

        let entry = self.load(r.launch_entry, PATCH_WIDTH);
        if entry != (r.load_address | 1).to_le_bytes() {
            return Err(TransportError::new(
                TransportOp::Trigger,
                Some(address),
                "launch_RAM handler is broken on this revision",
            ));
        }
        if self.load(r.load_address, 2) == [0, 0] {
            return Err(TransportError::new(
                TransportOp::Trigger,
                Some(address),
                "dispatch target holds no code",
            ));
        }

        self.triggers += 1;
        self.execute_routine();
        Ok(())
    }
}
