//! Plan 9 a.out headers.
//!
//! The layout is eight big-endian 32-bit words, optionally followed by a
//! 64-bit entry point when the magic carries [`HDR_MAGIC`].

use elf::abi::{PF_R, PF_W, PF_X, PT_LOAD};
use elf::segment::ProgramHeader;

use crate::error::{Error, Result};
use crate::range::align_up_page;

/// Set in the magic of formats with the 64-bit header extension.
pub const HDR_MAGIC: u32 = 0x0000_8000;

const fn magic(flags: u32, b: u32) -> u32 {
    flags | ((4 * b) * b + 7)
}

pub const MAGIC_386: u32 = magic(0, 11);
pub const MAGIC_AMD64: u32 = magic(HDR_MAGIC, 26);
pub const MAGIC_ARM: u32 = magic(0, 20);

const HEADER_SIZE: usize = 32;
const HEADER_SIZE_64: usize = HEADER_SIZE + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub text: u32,
    pub data: u32,
    pub bss: u32,
    pub syms: u32,
    pub entry: u64,
    pub spsz: u32,
    pub pcsz: u32,
}

fn be32(data: &[u8], off: usize) -> u32 {
    let mut w = [0; 4];
    w.copy_from_slice(&data[off..off + 4]);
    u32::from_be_bytes(w)
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Plan9("short header"));
        }
        let magic = be32(data, 0);
        if !matches!(magic, MAGIC_386 | MAGIC_AMD64 | MAGIC_ARM) {
            return Err(Error::Plan9("bad magic"));
        }
        let mut hdr = Self {
            magic,
            text: be32(data, 4),
            data: be32(data, 8),
            bss: be32(data, 12),
            syms: be32(data, 16),
            entry: be32(data, 20) as u64,
            spsz: be32(data, 24),
            pcsz: be32(data, 28),
        };
        if magic & HDR_MAGIC != 0 {
            if data.len() < HEADER_SIZE_64 {
                return Err(Error::Plan9("short 64-bit header"));
            }
            let mut w = [0; 8];
            w.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE_64]);
            hdr.entry = u64::from_be_bytes(w);
        }
        let end = hdr.header_size() as u64 + hdr.text as u64 + hdr.data as u64;
        if end > data.len() as u64 {
            return Err(Error::Plan9("text and data exceed file"));
        }
        Ok(hdr)
    }

    pub fn header_size(&self) -> usize {
        if self.magic & HDR_MAGIC != 0 {
            HEADER_SIZE_64
        } else {
            HEADER_SIZE
        }
    }

    /// Address the header and text are linked at.
    pub fn load_address(&self) -> u64 {
        match self.magic {
            MAGIC_AMD64 => 0x200000,
            _ => 0x1000,
        }
    }

    /// Text (header included) and data as two `PT_LOAD` programs.
    pub fn progs(&self) -> Vec<ProgramHeader> {
        let hdr = self.header_size() as u64;
        let text_size = hdr + self.text as u64;
        let data_addr = align_up_page(self.load_address() + text_size);
        vec![
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0,
                p_vaddr: self.load_address(),
                p_paddr: self.load_address(),
                p_filesz: text_size,
                p_memsz: text_size,
                p_align: 0x1000,
            },
            ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: text_size,
                p_vaddr: data_addr,
                p_paddr: data_addr,
                p_filesz: self.data as u64,
                p_memsz: self.data as u64 + self.bss as u64,
                p_align: 0x1000,
            },
        ]
    }
}

#[cfg(test)]
pub(crate) fn build(magic: u32, text: &[u8], data: &[u8], bss: u32, entry: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for w in [magic, text.len() as u32, data.len() as u32, bss, 0, entry as u32, 0, 0] {
        out.extend_from_slice(&w.to_be_bytes());
    }
    if magic & HDR_MAGIC != 0 {
        out.extend_from_slice(&entry.to_be_bytes());
    }
    out.extend_from_slice(text);
    out.extend_from_slice(data);
    out
}
