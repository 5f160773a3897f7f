pub mod sim;

use std::fmt;

/// Width of a single atomic ROM patch on the target.
pub const PATCH_WIDTH: usize = 4;

/// Callback invoked with the parameter bytes of each asynchronous device event.
pub type EventCallback = Box<dyn Fn(&[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    Connect,
    Write,
    Read,
    PatchRom,
    Subscribe,
    Trigger,
}

impl TransportOp {
    fn name(&self) -> &'static str {
        match self {
            TransportOp::Connect => "connect",
            TransportOp::Write => "write",
            TransportOp::Read => "read",
            TransportOp::PatchRom => "patch",
            TransportOp::Subscribe => "subscribe",
            TransportOp::Trigger => "trigger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub op: TransportOp,
    pub address: Option<u32>,
    pub message: String,
}

impl TransportError {
    pub fn new(op: TransportOp, address: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            op,
            address,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{} at 0x{:x} failed: {}", self.op.name(), addr, self.message),
            None => write!(f, "{} failed: {}", self.op.name(), self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Debug/control link to the target device.
///
/// All operations may fail; whether a failure is fatal depends on the phase
/// the caller is in, not on the transport.
pub trait Transport {
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Write `data` into device RAM starting at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError>;

    fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TransportError>;

    /// Overwrite one patch-width word at `address` through the device's
    /// patch mechanism. Works on ROM as well as RAM.
    fn patch_rom(&mut self, address: u32, word: [u8; PATCH_WIDTH]) -> Result<(), TransportError>;

    /// Register a callback for asynchronous device events. Callbacks may run
    /// on a transport-owned thread.
    fn subscribe_events(&mut self, callback: EventCallback) -> Result<(), TransportError>;

    /// Ask the device to execute code at `address` through its regular
    /// command dispatch path.
    fn trigger(&mut self, address: u32) -> Result<(), TransportError>;
}
