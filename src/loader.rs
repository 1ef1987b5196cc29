//! Loading objects into a physical memory plan.

use elf::abi::{ET_REL, SHF_ALLOC, SHF_EXECINSTR, SHT_NOBITS};
use elf::segment::ProgramHeader;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::PhysPlanner;
use crate::object::Object;
use crate::range::{PAGE_SIZE, Range, align_up};
use crate::reloc;
use crate::segment::Segment;

/// The single loadable program of an object, read into a buffer that spans
/// its whole memory size.
pub struct LoadedProgram {
    pub entry: u64,
    pub header: ProgramHeader,
    pub buf: Vec<u8>,
}

fn program_bytes(data: &[u8], p: &ProgramHeader) -> Result<Vec<u8>> {
    let file = data
        .get(p.p_offset as usize..)
        .and_then(|d| d.get(..p.p_filesz as usize))
        .ok_or_else(|| {
            Error::MalformedObject(format!(
                "program at {:#x} ({:#x} bytes) exceeds the file",
                p.p_offset, p.p_filesz
            ))
        })?;
    let mut buf = vec![0; p.p_memsz.max(p.p_filesz) as usize];
    buf[..file.len()].copy_from_slice(file);
    Ok(buf)
}

/// Parses `data` and finds its one program header. More or fewer headers
/// are an error.
fn single_header(data: &[u8]) -> Result<(u64, ProgramHeader)> {
    let obj = Object::parse(data)?;
    let progs = obj.progs();
    let [header] = progs.as_slice() else {
        return Err(Error::ProgramHeaderCount {
            what: obj.kind(),
            expected: 1,
            found: progs.len(),
        });
    };
    Ok((obj.entry(), *header))
}

/// Parses `data` and reads its one program header. More or fewer headers
/// are an error.
pub fn single_program(data: &[u8]) -> Result<LoadedProgram> {
    let (entry, header) = single_header(data)?;
    Ok(LoadedProgram {
        entry,
        header,
        buf: program_bytes(data, &header)?,
    })
}

/// Reserves room for `header` and only then reads it, so a program that
/// claims more memory than is free fails without being allocated.
fn load_program(
    mem: &mut impl PhysPlanner,
    data: &[u8],
    header: &ProgramHeader,
    limit: Range,
) -> Result<Range> {
    let r = mem.reserve(header.p_memsz, PAGE_SIZE, limit)?;
    let buf = program_bytes(data, header)?;
    debug!("program {:#x} bytes at {r}", header.p_memsz);
    mem.insert(Segment::new(buf, r));
    Ok(r)
}

/// Loads an object with exactly one program header anywhere in
/// `[min_addr, max_addr]`. The entry point is returned as linked.
pub fn elf_load(
    mem: &mut impl PhysPlanner,
    data: &[u8],
    min_addr: u64,
    max_addr: u64,
) -> Result<u64> {
    let (entry, header) = single_header(data)?;
    let limit = Range::from_inclusive_interval(min_addr, max_addr);
    load_program(mem, data, &header, limit)?;
    Ok(entry)
}

/// Loads either a pre-linked object with two program headers or a
/// relocatable object without any, somewhere in `[min_addr, max_addr]`.
///
/// Pre-linked objects only get their first program loaded and keep their
/// entry point. Relocatable objects have their allocated sections laid out
/// in one block, relocations applied, and the entry point rebased by the
/// displacement of the section that contains it.
pub fn relocate_and_load(
    mem: &mut impl PhysPlanner,
    data: &[u8],
    min_addr: u64,
    max_addr: u64,
) -> Result<u64> {
    let limit = Range::from_inclusive_interval(min_addr, max_addr);
    let obj = Object::parse(data)?;
    let progs = obj.progs();
    match progs.len() {
        2 => {
            load_program(mem, data, &progs[0], limit)?;
            Ok(obj.entry())
        }
        0 => match obj {
            Object::Elf(file) => load_relocatable(mem, &file, limit),
            Object::Plan9(_) => Err(Error::Plan9("no program headers")),
        },
        found => Err(Error::ProgramHeaderCount {
            what: obj.kind(),
            expected: 2,
            found,
        }),
    }
}

/// Offsets of allocated sections inside the load block.
#[derive(Debug, Default, PartialEq, Eq)]
struct Layout {
    offsets: Vec<Option<u64>>,
    data_size: u64,
    bss_offset: u64,
    bss_size: u64,
    align: u64,
}

impl Layout {
    fn size(&self) -> u64 {
        self.bss_offset.saturating_add(self.bss_size)
    }
}

struct Alloc {
    index: usize,
    size: u64,
    align: u64,
    nobits: bool,
}

/// Data sections first, then bss starting on the larger of the two groups'
/// alignments.
fn layout(sections: &[Alloc], count: usize) -> Layout {
    let (mut data_size, mut data_align) = (0, 1);
    let (mut bss_size, mut bss_align) = (0, 1);
    for s in sections {
        if s.nobits {
            bss_align = bss_align.max(s.align);
            bss_size = align_up(bss_size, s.align).saturating_add(s.size);
        } else {
            data_align = data_align.max(s.align);
            data_size = align_up(data_size, s.align).saturating_add(s.size);
        }
    }
    let align = data_align.max(bss_align);
    let bss_offset = align_up(data_size, align);

    let mut offsets = vec![None; count];
    let (mut data_at, mut bss_at) = (0, bss_offset);
    for s in sections {
        let at = if s.nobits { &mut bss_at } else { &mut data_at };
        let off = align_up(*at, s.align);
        offsets[s.index] = Some(off);
        *at = off.saturating_add(s.size);
    }
    Layout {
        offsets,
        data_size,
        bss_offset,
        bss_size,
        align,
    }
}

fn load_relocatable(
    mem: &mut impl PhysPlanner,
    file: &elf::ElfBytes<'_, elf::endian::AnyEndian>,
    limit: Range,
) -> Result<u64> {
    if file.ehdr.e_type != ET_REL {
        return Err(Error::NotRelocatableObject(file.ehdr.e_type));
    }
    let shdrs = file
        .section_headers()
        .ok_or_else(|| Error::MalformedObject("relocatable object without sections".into()))?;

    let allocs: Vec<Alloc> = shdrs
        .iter()
        .enumerate()
        .filter(|(_, s)| s.sh_flags & SHF_ALLOC as u64 != 0)
        .map(|(index, s)| Alloc {
            index,
            size: s.sh_size,
            align: s.sh_addralign.max(1),
            nobits: s.sh_type == SHT_NOBITS,
        })
        .collect();
    let layout = layout(&allocs, shdrs.len());

    let block = mem.reserve(layout.size(), layout.align.max(PAGE_SIZE), limit)?;
    debug!(
        "relocatable object: {:#x} data, {:#x} bss at {block}",
        layout.data_size, layout.bss_size
    );

    let mut buf = vec![0; layout.data_size as usize];
    for a in allocs.iter().filter(|a| !a.nobits) {
        let shdr = shdrs.get(a.index)?;
        let (bytes, _) = file.section_data(&shdr)?;
        let off = layout.offsets[a.index].unwrap_or_default() as usize;
        let dst = buf.get_mut(off..off + bytes.len()).ok_or_else(|| {
            Error::MalformedObject(format!("section {} larger than its header says", a.index))
        })?;
        dst.copy_from_slice(bytes);
    }
    reloc::apply(file, &mut buf, block.start, &layout.offsets)?;

    let old_entry = file.ehdr.e_entry;
    let exec = (SHF_ALLOC | SHF_EXECINSTR) as u64;
    let entry = allocs
        .iter()
        .filter_map(|a| {
            let shdr = shdrs.get(a.index).ok()?;
            let old = Range::new(shdr.sh_addr, shdr.sh_size);
            if shdr.sh_flags & exec != exec || !old.contains(old_entry) {
                return None;
            }
            Some(block.start + layout.offsets[a.index]? + (old_entry - old.start))
        })
        .next();
    let entry = match entry {
        Some(e) => e,
        None => {
            warn!("entry {old_entry:#x} is in no executable section, leaving it as is");
            old_entry
        }
    };

    mem.insert(Segment::new(buf, block));
    Ok(entry)
}
