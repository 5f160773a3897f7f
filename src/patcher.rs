use std::fmt;

use crate::asm::PatchImage;
use crate::device::{Transport, TransportError, TransportOp, PATCH_WIDTH};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Function entry overwritten with an immediate return.
    Neutralize,
    /// Dispatch-table entry pointed at the installed routine.
    Redirect,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchKind::Neutralize => f.write_str("neutralize"),
            PatchKind::Redirect => f.write_str("redirect"),
        }
    }
}

/// One patch-width overwrite of existing device code or data.
///
/// The original bytes are captured when the site is applied, so the
/// installed and original state of the device stay inspectable and the
/// overwrite can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    pub kind: PatchKind,
    pub address: u32,
    pub replacement: [u8; PATCH_WIDTH],
    original: Option<[u8; PATCH_WIDTH]>,
}

impl PatchSite {
    pub fn new(kind: PatchKind, address: u32, replacement: &[u8]) -> Result<Self, Error> {
        let replacement: [u8; PATCH_WIDTH] =
            replacement.try_into().map_err(|_| Error::InvalidPatch {
                address,
                len: replacement.len(),
            })?;
        Ok(Self {
            kind,
            address,
            replacement,
            original: None,
        })
    }

    /// Dispatch entry at `address` rewritten to call Thumb code at `target`.
    pub fn redirect(address: u32, target: u32) -> Self {
        Self {
            kind: PatchKind::Redirect,
            address,
            replacement: (target | 1).to_le_bytes(),
            original: None,
        }
    }

    /// Bytes found at the site before it was applied.
    pub fn original(&self) -> Option<&[u8; PATCH_WIDTH]> {
        self.original.as_ref()
    }

    pub fn is_applied(&self) -> bool {
        self.original.is_some()
    }

    /// Capture the current word at the site, then overwrite it. Applying an
    /// already applied site is a no-op.
    pub fn apply<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        if self.is_applied() {
            return Ok(());
        }
        let current = transport.read(self.address, PATCH_WIDTH)?;
        let original: [u8; PATCH_WIDTH] = current.as_slice().try_into().map_err(|_| {
            TransportError::new(
                TransportOp::Read,
                Some(self.address),
                format!("expected {} bytes, got {}", PATCH_WIDTH, current.len()),
            )
        })?;
        transport.patch_rom(self.address, self.replacement)?;
        self.original = Some(original);
        Ok(())
    }

    /// Put the captured original bytes back.
    pub fn revert<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        if let Some(original) = self.original {
            transport.patch_rom(self.address, original)?;
            self.original = None;
        }
        Ok(())
    }
}

/// Owns the transport for the session and every change made to device memory.
pub struct MemoryPatcher<T: Transport> {
    transport: T,
    installed: Option<PatchImage>,
    applied: Vec<PatchSite>,
}

impl<T: Transport> MemoryPatcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            installed: None,
            applied: Vec::new(),
        }
    }

    /// Write the whole image at its load address.
    pub fn install(&mut self, image: PatchImage) -> Result<(), TransportError> {
        self.transport.write(image.load_address(), image.bytes())?;
        log::info!(
            "installed {} bytes at 0x{:x}..0x{:x}",
            image.bytes().len(),
            image.load_address(),
            image.end(),
        );
        self.installed = Some(image);
        Ok(())
    }

    pub fn patch_site(&mut self, mut site: PatchSite) -> Result<(), TransportError> {
        site.apply(&mut self.transport)?;
        if let Some(original) = site.original() {
            log::info!(
                "{} patch at 0x{:x}: {} -> {}",
                site.kind,
                site.address,
                hex(original),
                hex(&site.replacement),
            );
        }
        self.applied.push(site);
        Ok(())
    }

    /// Undo applied sites, newest first.
    pub fn revert_all(&mut self) -> Result<(), TransportError> {
        while let Some(mut site) = self.applied.pop() {
            if let Err(e) = site.revert(&mut self.transport) {
                self.applied.push(site);
                return Err(e);
            }
            log::info!("reverted {} patch at 0x{:x}", site.kind, site.address);
        }
        Ok(())
    }

    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TransportError> {
        self.transport.read(address, length)
    }

    pub fn applied_sites(&self) -> &[PatchSite] {
        &self.applied
    }

    pub fn installed(&self) -> Option<&PatchImage> {
        self.installed.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
