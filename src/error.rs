use thiserror::Error;

use crate::kexec::ErrKexec;
use crate::range::Range;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not enough space to allocate {size:#x} bytes")]
    NotEnoughSpace { size: u64 },

    #[error("{what}: expected {expected} program headers, found {found}")]
    ProgramHeaderCount {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("object has no program headers and is not relocatable (ET_REL), type is {0:#x}")]
    NotRelocatableObject(u16),

    #[error("bad magic: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u64, found: u64 },

    #[error("big-endian kernel images are not supported")]
    BadEndianness,

    #[error("boot protocol version {0:#06x} is not supported (need 0x0205 or newer)")]
    UnsupportedProtocol(u16),

    #[error("kernel is not relocatable, real mode entry is not supported")]
    KernelNotRelocatable,

    #[error("segments {first} and {second} have conflicting contents at {at:#x}")]
    ContentConflict { first: Range, second: Range, at: u64 },

    #[error("{0}")]
    Kexec(Box<ErrKexec>),

    #[error("entry point {0:#x} is not contained in any segment")]
    EntryNotLoaded(u64),

    #[error("not an ELF ({elf}) nor a Plan 9 object ({plan9})")]
    UnknownObjectFormat { elf: elf::ParseError, plan9: String },

    #[error("malformed Plan 9 object: {0}")]
    Plan9(&'static str),

    #[error("ELF: {0}")]
    Elf(#[from] elf::ParseError),

    #[error("malformed object: {0}")]
    MalformedObject(String),

    #[error("relocation {kind} ({r_type}) is not supported")]
    UnsupportedRelocation { kind: &'static str, r_type: u32 },

    #[error("relocation against undefined symbol {0}")]
    UndefinedSymbol(u32),

    #[error("relocation value {value:#x} does not fit {kind}")]
    RelocationOverflow { kind: &'static str, value: i128 },

    #[error("device tree: {0}")]
    Fdt(String),

    #[error("device tree has no /chosen node")]
    NoChosenNode,

    #[error("memory map: {0}")]
    MemoryMap(String),

    #[error("memory map contains no usable RAM")]
    EmptyMemoryMap,

    #[error("bzImage: {0}")]
    BzImage(String),

    #[error("{name}: no such purgatory, try one of {available:?}")]
    UnknownPurgatory {
        name: String,
        available: Vec<&'static str>,
    },

    #[error("purgatory is linked at {link:#x} but was placed at {got}")]
    PurgatoryPlacement { link: u64, got: Range },

    #[error("{what} segment: {source}")]
    Segment {
        what: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps `self` with the name of the boot segment whose placement failed.
    pub fn in_segment(self, what: &'static str) -> Self {
        Self::Segment {
            what,
            source: Box::new(self),
        }
    }

    /// Looks through segment wrappers for the underlying cause.
    pub fn root(&self) -> &Self {
        match self {
            Self::Segment { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<ErrKexec> for Error {
    fn from(e: ErrKexec) -> Self {
        Self::Kexec(Box::new(e))
    }
}
