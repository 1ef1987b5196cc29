//! RELA relocation of `ET_REL` objects after their sections are placed.

use elf::ElfBytes;
use elf::abi::{EM_AARCH64, EM_X86_64, SHN_ABS, SHN_UNDEF, SHT_RELA};
use elf::endian::AnyEndian;
use elf::relocation::Rela;
use log::trace;

use crate::error::{Error, Result};

pub mod r_x86_64 {
    pub const R_X86_64_NONE: u32 = 0;
    pub const R_X86_64_64: u32 = 1;
    pub const R_X86_64_PC32: u32 = 2;
    pub const R_X86_64_PLT32: u32 = 4;
    pub const R_X86_64_32: u32 = 10;
    pub const R_X86_64_32S: u32 = 11;
    pub const R_X86_64_PC64: u32 = 24;
}

pub mod r_aarch64 {
    pub const R_AARCH64_NONE: u32 = 0;
    pub const R_AARCH64_NONE_GNU: u32 = 256;
    pub const R_AARCH64_ABS64: u32 = 257;
    pub const R_AARCH64_ABS32: u32 = 258;
    pub const R_AARCH64_PREL64: u32 = 260;
    pub const R_AARCH64_PREL32: u32 = 261;
    pub const R_AARCH64_JUMP26: u32 = 282;
    pub const R_AARCH64_CALL26: u32 = 283;
}

use r_aarch64::*;
use r_x86_64::*;

/// A value to be written back into the image.
enum Fixup {
    None,
    U64(u64),
    U32(u32),
    /// 26-bit word offset patched into a branch instruction.
    Branch26(u32),
}

fn fit_u64(value: i128) -> u64 {
    value as u64
}

fn fit_u32(kind: &'static str, value: i128) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::RelocationOverflow { kind, value })
}

fn fit_i32(kind: &'static str, value: i128) -> Result<u32> {
    i32::try_from(value)
        .map(|v| v as u32)
        .map_err(|_| Error::RelocationOverflow { kind, value })
}

/// Either signed or unsigned 32-bit.
fn fit_any32(kind: &'static str, value: i128) -> Result<u32> {
    if (i32::MIN as i128..=u32::MAX as i128).contains(&value) {
        Ok(value as u32)
    } else {
        Err(Error::RelocationOverflow { kind, value })
    }
}

fn fit_branch26(kind: &'static str, value: i128) -> Result<u32> {
    if value % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&value) {
        return Err(Error::RelocationOverflow { kind, value });
    }
    Ok(((value >> 2) as u32) & 0x03ff_ffff)
}

/// S + A for absolute, S + A - P for PC-relative relocations.
fn x86_64(r_type: u32, s: i128, a: i128, p: i128) -> Result<Fixup> {
    Ok(match r_type {
        R_X86_64_NONE => Fixup::None,
        R_X86_64_64 => Fixup::U64(fit_u64(s + a)),
        R_X86_64_PC32 => Fixup::U32(fit_i32("R_X86_64_PC32", s + a - p)?),
        R_X86_64_PLT32 => Fixup::U32(fit_i32("R_X86_64_PLT32", s + a - p)?),
        R_X86_64_32 => Fixup::U32(fit_u32("R_X86_64_32", s + a)?),
        R_X86_64_32S => Fixup::U32(fit_i32("R_X86_64_32S", s + a)?),
        R_X86_64_PC64 => Fixup::U64(fit_u64(s + a - p)),
        r_type => {
            return Err(Error::UnsupportedRelocation {
                kind: "x86_64",
                r_type,
            });
        }
    })
}

fn aarch64(r_type: u32, s: i128, a: i128, p: i128) -> Result<Fixup> {
    Ok(match r_type {
        R_AARCH64_NONE | R_AARCH64_NONE_GNU => Fixup::None,
        R_AARCH64_ABS64 => Fixup::U64(fit_u64(s + a)),
        R_AARCH64_ABS32 => Fixup::U32(fit_any32("R_AARCH64_ABS32", s + a)?),
        R_AARCH64_PREL64 => Fixup::U64(fit_u64(s + a - p)),
        R_AARCH64_PREL32 => Fixup::U32(fit_any32("R_AARCH64_PREL32", s + a - p)?),
        R_AARCH64_JUMP26 => Fixup::Branch26(fit_branch26("R_AARCH64_JUMP26", s + a - p)?),
        R_AARCH64_CALL26 => Fixup::Branch26(fit_branch26("R_AARCH64_CALL26", s + a - p)?),
        r_type => {
            return Err(Error::UnsupportedRelocation {
                kind: "aarch64",
                r_type,
            });
        }
    })
}

fn patch(buf: &mut [u8], at: usize, fixup: Fixup) -> Result<()> {
    let width = match fixup {
        Fixup::None => return Ok(()),
        Fixup::U64(_) => 8,
        Fixup::U32(_) | Fixup::Branch26(_) => 4,
    };
    let Some(dst) = buf.get_mut(at..at + width) else {
        return Err(Error::MalformedObject(format!(
            "relocation at {at:#x} outside of section data"
        )));
    };
    match fixup {
        Fixup::None => {}
        Fixup::U64(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Fixup::U32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        Fixup::Branch26(imm) => {
            let mut insn = [0; 4];
            insn.copy_from_slice(dst);
            let insn = (u32::from_le_bytes(insn) & !0x03ff_ffff) | imm;
            dst.copy_from_slice(&insn.to_le_bytes());
        }
    }
    Ok(())
}

/// Applies every `SHT_RELA` section that targets a placed section.
///
/// `offsets[i]` is the offset of section `i` inside `buf`, which will be
/// loaded at physical address `base`. Unplaced sections have no offset and
/// relocations against them are skipped.
pub fn apply(
    file: &ElfBytes<'_, AnyEndian>,
    buf: &mut [u8],
    base: u64,
    offsets: &[Option<u64>],
) -> Result<()> {
    if file.ehdr.endianness != AnyEndian::Little {
        return Err(Error::BadEndianness);
    }
    let compute: fn(u32, i128, i128, i128) -> Result<Fixup> = match file.ehdr.e_machine {
        EM_X86_64 => x86_64,
        EM_AARCH64 => aarch64,
        m => {
            return Err(Error::MalformedObject(format!(
                "relocations for machine {m} are not supported"
            )));
        }
    };
    let Some(shdrs) = file.section_headers() else {
        return Ok(());
    };
    let mut symtab = None;

    for shdr in shdrs.iter().filter(|s| s.sh_type == SHT_RELA) {
        let Some(Some(target)) = offsets.get(shdr.sh_info as usize).copied() else {
            continue;
        };
        if symtab.is_none() {
            symtab = file.symbol_table()?.map(|(syms, _)| syms);
        }
        for rela in file.section_data_as_relas(&shdr)? {
            let Rela {
                r_offset,
                r_sym,
                r_type,
                r_addend,
                ..
            } = rela;
            let s = if r_sym == 0 {
                0
            } else {
                let sym = symtab
                    .as_ref()
                    .ok_or_else(|| Error::MalformedObject("relocations without symbols".into()))?
                    .get(r_sym as usize)?;
                match sym.st_shndx {
                    SHN_ABS => sym.st_value,
                    SHN_UNDEF => return Err(Error::UndefinedSymbol(r_sym)),
                    shndx => {
                        let off = offsets.get(shndx as usize).copied().flatten().ok_or_else(
                            || {
                                Error::MalformedObject(format!(
                                    "symbol {r_sym} refers to unplaced section {shndx}"
                                ))
                            },
                        )?;
                        base + off + sym.st_value
                    }
                }
            };
            let at = target + r_offset;
            let p = base + at;
            trace!("reloc type {r_type} at {p:#x}: S={s:#x} A={r_addend:#x}");
            let fixup = compute(r_type, s as i128, r_addend as i128, p as i128)?;
            patch(buf, at as usize, fixup)?;
        }
    }
    Ok(())
}
