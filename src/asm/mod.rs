pub mod routine;
pub mod thumb;

use std::fmt;

/// Machine-code assembler collaborator: source text in, bytes out.
pub trait Assembler {
    /// Assemble `source` as if it will be loaded at `load_address`, which is
    /// used to resolve PC-relative references.
    fn assemble(&self, source: &str, load_address: u32) -> Result<Vec<u8>, AssemblyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    UnresolvedParameter(String),
    UnknownMnemonic { line: usize, mnemonic: String },
    BadOperand { line: usize, message: String },
    UndefinedLabel { line: usize, label: String },
    DuplicateLabel { line: usize, label: String },
    OutOfRange { line: usize, message: String },
    EmptyImage,
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::UnresolvedParameter(name) => {
                write!(f, "template parameter ${{{}}} was not supplied", name)
            }
            AssemblyError::UnknownMnemonic { line, mnemonic } => {
                write!(f, "line {}: unknown mnemonic '{}'", line, mnemonic)
            }
            AssemblyError::BadOperand { line, message } => write!(f, "line {}: {}", line, message),
            AssemblyError::UndefinedLabel { line, label } => {
                write!(f, "line {}: undefined label '{}'", line, label)
            }
            AssemblyError::DuplicateLabel { line, label } => {
                write!(f, "line {}: label '{}' defined twice", line, label)
            }
            AssemblyError::OutOfRange { line, message } => {
                write!(f, "line {}: out of range: {}", line, message)
            }
            AssemblyError::EmptyImage => write!(f, "template assembled to zero bytes"),
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Values substituted into a routine template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchParams {
    /// Records the routine produces per execution.
    pub rounds: u32,
    /// Device address the records are written to.
    pub dst: u32,
    pub sentinel: u8,
    /// Tag at the start of the completion event payload.
    pub marker: [u8; 4],
}

/// An assembled routine bound to the address it was assembled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchImage {
    bytes: Vec<u8>,
    load_address: u32,
}

impl PatchImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    /// First address past the image.
    pub fn end(&self) -> u32 {
        self.load_address.wrapping_add(self.bytes.len() as u32)
    }
}

pub struct PatchAssembler<A: Assembler> {
    assembler: A,
}

impl<A: Assembler> PatchAssembler<A> {
    pub fn new(assembler: A) -> Self {
        Self { assembler }
    }

    /// Substitute `params` into `template` and assemble the result at
    /// `load_address`.
    pub fn assemble(
        &self,
        template: &str,
        params: &PatchParams,
        load_address: u32,
    ) -> Result<PatchImage, AssemblyError> {
        let source = substitute(template, params)?;
        let bytes = self.assembler.assemble(&source, load_address)?;
        if bytes.is_empty() {
            return Err(AssemblyError::EmptyImage);
        }
        Ok(PatchImage {
            bytes,
            load_address,
        })
    }

    /// Assemble a parameterless snippet, e.g. a patch-site replacement.
    pub fn assemble_snippet(&self, source: &str, load_address: u32) -> Result<Vec<u8>, AssemblyError> {
        if let Some(name) = first_placeholder(source) {
            return Err(AssemblyError::UnresolvedParameter(name));
        }
        self.assembler.assemble(source, load_address)
    }
}

/// Replace `${rounds}`, `${dst}`, `${sentinel}` and `${marker}` with hex
/// literals. Any other `${...}` left behind is an error.
pub fn substitute(template: &str, params: &PatchParams) -> Result<String, AssemblyError> {
    let source = template
        .replace("${rounds}", &format!("0x{:x}", params.rounds))
        .replace("${dst}", &format!("0x{:x}", params.dst))
        .replace("${sentinel}", &format!("0x{:x}", params.sentinel))
        .replace("${marker}", &format!("0x{:x}", u32::from_le_bytes(params.marker)));

    match first_placeholder(&source) {
        Some(name) => Err(AssemblyError::UnresolvedParameter(name)),
        None => Ok(source),
    }
}

fn first_placeholder(source: &str) -> Option<String> {
    let start = source.find("${")?;
    let rest = &source[start + 2..];
    let name = match rest.find('}') {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(name.trim().to_string())
}
