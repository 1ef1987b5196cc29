//! Little-endian ELF64 images for tests.

use elf::abi::{EM_X86_64, ET_EXEC, ET_REL, PF_R, PF_X, PT_LOAD, SHT_NOBITS, SHT_STRTAB};

pub struct Prog {
    pub paddr: u64,
    pub vaddr: u64,
    pub flags: u32,
    pub data: Vec<u8>,
    pub memsz: u64,
}

impl Prog {
    /// A read-execute `PT_LOAD` linked at `paddr`.
    pub fn load(paddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        Self {
            paddr,
            vaddr: paddr,
            flags: PF_R | PF_X,
            data,
            memsz,
        }
    }
}

pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub data: Vec<u8>,
    /// Only used for `SHT_NOBITS`.
    pub size: u64,
    pub align: u64,
    pub link: u32,
    pub info: u32,
    pub entsize: u64,
}

impl Section {
    pub fn new(name: &str, sh_type: u32, flags: u64, data: Vec<u8>, align: u64) -> Self {
        Self {
            name: name.into(),
            sh_type,
            flags,
            addr: 0,
            size: data.len() as u64,
            data,
            align,
            link: 0,
            info: 0,
            entsize: 0,
        }
    }

    pub fn nobits(name: &str, flags: u64, size: u64, align: u64) -> Self {
        Self {
            size,
            ..Self::new(name, SHT_NOBITS, flags, Vec::new(), align)
        }
    }

    pub fn link(mut self, link: u32, info: u32, entsize: u64) -> Self {
        self.link = link;
        self.info = info;
        self.entsize = entsize;
        self
    }
}

/// `Elf64_Sym`.
pub fn sym(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&name.to_le_bytes());
    out.push(info);
    out.push(0);
    out.extend_from_slice(&shndx.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

/// `Elf64_Rela`.
pub fn rela(offset: u64, sym: u32, r_type: u32, addend: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(((sym as u64) << 32) | r_type as u64).to_le_bytes());
    out.extend_from_slice(&addend.to_le_bytes());
    out
}

fn push_shdr(shdrs: &mut Vec<u8>, name: u32, s: &Section, offset: u64) {
    shdrs.extend_from_slice(&name.to_le_bytes());
    shdrs.extend_from_slice(&s.sh_type.to_le_bytes());
    for v in [s.flags, s.addr, offset, s.size] {
        shdrs.extend_from_slice(&v.to_le_bytes());
    }
    shdrs.extend_from_slice(&s.link.to_le_bytes());
    shdrs.extend_from_slice(&s.info.to_le_bytes());
    shdrs.extend_from_slice(&s.align.to_le_bytes());
    shdrs.extend_from_slice(&s.entsize.to_le_bytes());
}

pub struct ElfBuilder {
    e_type: u16,
    machine: u16,
    entry: u64,
    progs: Vec<Prog>,
    sections: Vec<Section>,
}

impl ElfBuilder {
    pub fn exec(entry: u64) -> Self {
        Self {
            e_type: ET_EXEC,
            machine: EM_X86_64,
            entry,
            progs: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn object(entry: u64) -> Self {
        Self {
            e_type: ET_REL,
            ..Self::exec(entry)
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn prog(mut self, p: Prog) -> Self {
        self.progs.push(p);
        self
    }

    /// Adds a section. The first one added gets index 1.
    pub fn section(mut self, s: Section) -> Self {
        self.sections.push(s);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        let phoff = if self.progs.is_empty() { 0 } else { 64u64 };
        out.resize(64 + 56 * self.progs.len(), 0);

        let mut phdrs = Vec::new();
        for p in &self.progs {
            let offset = out.len() as u64;
            out.extend_from_slice(&p.data);
            let mut h = Vec::with_capacity(56);
            h.extend_from_slice(&PT_LOAD.to_le_bytes());
            h.extend_from_slice(&p.flags.to_le_bytes());
            for v in [offset, p.vaddr, p.paddr, p.data.len() as u64, p.memsz, 0x1000] {
                h.extend_from_slice(&v.to_le_bytes());
            }
            phdrs.extend_from_slice(&h);
        }
        out[64..64 + phdrs.len()].copy_from_slice(&phdrs);

        let (shoff, shnum, shstrndx) = if self.sections.is_empty() {
            (0, 0, 0)
        } else {
            let mut shstrtab = vec![0u8];
            let mut shdrs = vec![0u8; 64];
            for s in &self.sections {
                let name = shstrtab.len() as u32;
                shstrtab.extend_from_slice(s.name.as_bytes());
                shstrtab.push(0);
                let offset = out.len() as u64;
                out.extend_from_slice(&s.data);
                push_shdr(&mut shdrs, name, s, offset);
            }
            let name = shstrtab.len() as u32;
            shstrtab.extend_from_slice(b".shstrtab\0");
            let offset = out.len() as u64;
            out.extend_from_slice(&shstrtab);
            let strtab = Section::new(".shstrtab", SHT_STRTAB, 0, shstrtab, 1);
            push_shdr(&mut shdrs, name, &strtab, offset);

            while out.len() % 8 != 0 {
                out.push(0);
            }
            let shoff = out.len() as u64;
            let shnum = (shdrs.len() / 64) as u16;
            out.extend_from_slice(&shdrs);
            (shoff, shnum, shnum - 1)
        };

        out[..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.machine.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&phoff.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&(self.progs.len() as u16).to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());
        out[60..62].copy_from_slice(&shnum.to_le_bytes());
        out[62..64].copy_from_slice(&shstrndx.to_le_bytes());
        out
    }
}
