//! Trampolines run between the old and the new kernel.
//!
//! Every purgatory is a tiny ELF executable with one program header linked
//! at [`LINK_ADDRESS`]. Its loaded image starts with a short jump over two
//! quadword slots: the kernel entry point at offset 8 and the value for
//! `rsi` (the boot parameters) at offset 16. Both are patched at load time.

use log::debug;

use crate::error::{Error, Result};
use crate::loader;
use crate::memory::PhysPlanner;
use crate::range::{PAGE_SIZE, Range, align_down_page};
use crate::segment::Segment;

pub const LINK_ADDRESS: u64 = 0x3000;

/// Purgatories must stay below 2 GiB.
const MAX_ADDRESS: u64 = 0x7fff_ffff;

const ENTRY_SLOT: usize = 8;
const PARAM_SLOT: usize = 16;

const CODE_SIZE: usize = 40;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const IMAGE_SIZE: usize = EHDR_SIZE + PHDR_SIZE + CODE_SIZE;

const fn put(out: &mut [u8; IMAGE_SIZE], at: usize, bytes: &[u8]) {
    let mut i = 0;
    while i < bytes.len() {
        out[at + i] = bytes[i];
        i += 1;
    }
}

/// Wraps `code` into an x86_64 ELF executable loaded at [`LINK_ADDRESS`].
const fn wrap(code: [u8; CODE_SIZE]) -> [u8; IMAGE_SIZE] {
    let mut out = [0u8; IMAGE_SIZE];
    put(&mut out, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1]);
    put(&mut out, 16, &2u16.to_le_bytes());
    put(&mut out, 18, &0x3eu16.to_le_bytes());
    put(&mut out, 20, &1u32.to_le_bytes());
    put(&mut out, 24, &LINK_ADDRESS.to_le_bytes());
    put(&mut out, 32, &(EHDR_SIZE as u64).to_le_bytes());
    put(&mut out, 52, &(EHDR_SIZE as u16).to_le_bytes());
    put(&mut out, 54, &(PHDR_SIZE as u16).to_le_bytes());
    put(&mut out, 56, &1u16.to_le_bytes());
    put(&mut out, 58, &64u16.to_le_bytes());

    let ph = EHDR_SIZE;
    put(&mut out, ph, &1u32.to_le_bytes());
    put(&mut out, ph + 4, &5u32.to_le_bytes());
    put(&mut out, ph + 8, &((EHDR_SIZE + PHDR_SIZE) as u64).to_le_bytes());
    put(&mut out, ph + 16, &LINK_ADDRESS.to_le_bytes());
    put(&mut out, ph + 24, &LINK_ADDRESS.to_le_bytes());
    put(&mut out, ph + 32, &(CODE_SIZE as u64).to_le_bytes());
    put(&mut out, ph + 40, &(CODE_SIZE as u64).to_le_bytes());
    put(&mut out, ph + 48, &PAGE_SIZE.to_le_bytes());

    put(&mut out, EHDR_SIZE + PHDR_SIZE, &code);
    out
}

#[rustfmt::skip]
const JUMP_TO_ENTRY: [u8; CODE_SIZE] = [
    0xeb, 0x16,                                 // jmp 1f
    0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0,                     // kernel entry
    0, 0, 0, 0, 0, 0, 0, 0,                     // rsi
    0x48, 0x8b, 0x35, 0xf1, 0xff, 0xff, 0xff,   // 1: mov -15(%rip), %rsi
    0x48, 0x8b, 0x05, 0xe2, 0xff, 0xff, 0xff,   // mov -30(%rip), %rax
    0xff, 0xe0,                                 // jmp *%rax
];

#[rustfmt::skip]
const SPIN: [u8; CODE_SIZE] = {
    let mut code = [0u8; CODE_SIZE];
    code[0] = 0xeb;                             // 1: jmp 1b
    code[1] = 0xfe;
    code
};

static DEFAULT_IMAGE: [u8; IMAGE_SIZE] = wrap(JUMP_TO_ENTRY);
static SPIN_IMAGE: [u8; IMAGE_SIZE] = wrap(SPIN);

/// A named trampoline image.
#[derive(Clone, Copy, Debug)]
pub struct Purgatory {
    pub name: &'static str,
    pub image: &'static [u8],
}

static PURGATORIES: [Purgatory; 2] = [
    Purgatory {
        name: "default",
        image: &DEFAULT_IMAGE,
    },
    // Never reaches the kernel. Tells a hang in the new kernel apart from
    // one in the handover.
    Purgatory {
        name: "loop",
        image: &SPIN_IMAGE,
    },
];

pub fn names() -> Vec<&'static str> {
    PURGATORIES.iter().map(|p| p.name).collect()
}

/// Looks up a purgatory by name.
pub fn select(name: &str) -> Result<Purgatory> {
    PURGATORIES
        .iter()
        .find(|p| p.name == name)
        .copied()
        .ok_or_else(|| Error::UnknownPurgatory {
            name: name.into(),
            available: names(),
        })
}

impl Default for Purgatory {
    fn default() -> Self {
        PURGATORIES[0]
    }
}

impl Purgatory {
    /// Places the purgatory at its link address with both parameter slots
    /// filled in. Returns the purgatory's entry point.
    pub fn load(&self, mem: &mut impl PhysPlanner, kernel_entry: u64, rsi: u64) -> Result<u64> {
        let mut p = loader::single_program(self.image)?;
        let Some(slots) = p.buf.get_mut(ENTRY_SLOT..PARAM_SLOT + 8) else {
            return Err(Error::MalformedObject(format!(
                "purgatory {} is too short for its parameters",
                self.name
            )));
        };
        slots[..8].copy_from_slice(&kernel_entry.to_le_bytes());
        slots[8..].copy_from_slice(&rsi.to_le_bytes());

        let paddr = p.header.p_paddr;
        let link = align_down_page(paddr);
        let limit = Range::from_inclusive_interval(link.max(LINK_ADDRESS), MAX_ADDRESS);
        let r = mem.reserve(p.header.p_memsz + (paddr - link), PAGE_SIZE, limit)?;
        if r.start != link {
            return Err(Error::PurgatoryPlacement { link, got: r });
        }
        let phys = Range::new(paddr, p.header.p_memsz);
        debug!("purgatory {} at {phys}, entry {:#x}", self.name, p.entry);
        mem.insert(Segment::new(p.buf, phys));
        Ok(p.entry)
    }
}
