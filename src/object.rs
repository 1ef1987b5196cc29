use elf::ElfBytes;
use elf::endian::AnyEndian;
use elf::segment::ProgramHeader;

use crate::error::{Error, Result};
use crate::plan9;

/// A loadable object: an ELF file or a Plan 9 a.out.
pub enum Object<'data> {
    Elf(ElfBytes<'data, AnyEndian>),
    Plan9(plan9::Header),
}

impl<'data> Object<'data> {
    /// Parses `data` as ELF, falling back to Plan 9.
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let elf = match ElfBytes::<AnyEndian>::minimal_parse(data) {
            Ok(file) => return Ok(Self::Elf(file)),
            Err(e) => e,
        };
        match plan9::Header::parse(data) {
            Ok(hdr) => Ok(Self::Plan9(hdr)),
            Err(e) => Err(Error::UnknownObjectFormat {
                elf,
                plan9: e.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Elf(_) => "ELF",
            Self::Plan9(_) => "Plan 9",
        }
    }

    pub fn progs(&self) -> Vec<ProgramHeader> {
        match self {
            Self::Elf(file) => file
                .segments()
                .map(|table| table.iter().collect())
                .unwrap_or_default(),
            Self::Plan9(hdr) => hdr.progs(),
        }
    }

    pub fn entry(&self) -> u64 {
        match self {
            Self::Elf(file) => file.ehdr.e_entry,
            Self::Plan9(hdr) => hdr.entry,
        }
    }
}
