use std::fmt;
use std::io;

use crate::asm::AssemblyError;
use crate::device::TransportError;

/// Session phase a device operation belonged to when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Install,
    PatchSite,
    Subscribe,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Install => "install",
            Phase::PatchSite => "patch site",
            Phase::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    InvalidArgs(String),
    Assembly(AssemblyError),
    InvalidPatch { address: u32, len: usize },
    Transport { phase: Phase, source: TransportError },
    RetryExhausted { round: u32, attempts: u32 },
}

impl Error {
    pub fn transport(phase: Phase, source: TransportError) -> Self {
        Error::Transport { phase, source }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidArgs(msg) => write!(f, "invalid arguments: {}", msg),
            Error::Assembly(e) => write!(f, "assembly error: {}", e),
            Error::InvalidPatch { address, len } => write!(
                f,
                "invalid patch at 0x{:x}: {} replacement bytes, device patches exactly {}",
                address,
                len,
                crate::device::PATCH_WIDTH
            ),
            Error::Transport { phase, source } => {
                write!(f, "transport error during {}: {}", phase, source)
            }
            Error::RetryExhausted { round, attempts } => write!(
                f,
                "round {} failed {} consecutive attempts, giving up",
                round, attempts
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Assembly(e) => Some(e),
            Error::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<AssemblyError> for Error {
    fn from(e: AssemblyError) -> Self {
        Error::Assembly(e)
    }
}
