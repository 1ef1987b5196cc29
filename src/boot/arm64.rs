//! arm64 Image loading: the kernel, an initrd and the edited device tree,
//! entered through a small trampoline that sets up `x0` the way the
//! kernel's boot protocol expects.

use std::sync::Arc;

use log::{debug, info};

use super::{BootImage, LinuxImage};
use crate::bzimage::le32;
use crate::error::{Error, Result};
use crate::fdt::{Fdt, Property};
use crate::memory::Memory;
use crate::range::align_up;

/// "ARM\x64"
pub const IMAGE_MAGIC: u32 = 0x644d_5241;

pub const HEADER_SIZE: usize = 64;

/// The kernel must sit at `text_offset` above a 2 MiB boundary.
pub const KERNEL_ALIGN: u64 = 2 << 20;

/// Bit 0 of the header flags: kernel is big-endian.
const FLAG_BE: u64 = 1;

/// Stale properties a previous boot loader left in `/chosen`.
const STALE_CHOSEN: [&str; 6] = [
    "linux,elfcorehdr",
    "linux,usable-memory-range",
    "kaslr-seed",
    "rng-seed",
    "linux,initrd-start",
    "linux,initrd-end",
];

fn le64(data: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(w)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub text_offset: u64,
    pub image_size: u64,
    pub flags: u64,
    pub magic: u32,
}

impl ImageHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedObject(format!(
                "arm64 Image is only {} bytes",
                data.len()
            )));
        }
        let h = Self {
            text_offset: le64(data, 8),
            image_size: le64(data, 16),
            flags: le64(data, 24),
            magic: le32(data, 56),
        };
        if h.magic != IMAGE_MAGIC {
            return Err(Error::BadMagic {
                expected: IMAGE_MAGIC as u64,
                found: h.magic as u64,
            });
        }
        if h.flags & FLAG_BE != 0 {
            return Err(Error::BadEndianness);
        }
        Ok(h)
    }

    /// Bytes to reserve past `text_offset`. Kernels older than 3.17 leave
    /// `image_size` zero.
    pub fn load_size(&self, file_len: usize) -> u64 {
        match self.image_size {
            0 => align_up(file_len as u64, KERNEL_ALIGN),
            n => n,
        }
    }
}

#[rustfmt::skip]
const TRAMPOLINE_CODE: [u32; 6] = [
    0x5800_00c4,    // ldr x4, kernel
    0x5800_00e0,    // ldr x0, dtb
    0xaa1f_03e1,    // mov x1, xzr
    0xaa1f_03e2,    // mov x2, xzr
    0xaa1f_03e3,    // mov x3, xzr
    0xd61f_0080,    // br x4
];

/// The trampoline followed by its two data words.
pub fn trampoline(kernel: u64, dtb: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(TRAMPOLINE_CODE.len() * 4 + 16);
    for insn in TRAMPOLINE_CODE {
        out.extend_from_slice(&insn.to_le_bytes());
    }
    out.extend_from_slice(&kernel.to_le_bytes());
    out.extend_from_slice(&dtb.to_le_bytes());
    out
}

/// Plans `image` into `mem`, rewriting `fdt` to describe it. The boot image
/// enters through the trampoline.
pub fn load(mut mem: Memory, mut fdt: Fdt, image: LinuxImage) -> Result<BootImage> {
    if mem.phys.ram().is_empty() {
        return Err(Error::EmptyMemoryMap);
    }
    let hdr = ImageHeader::parse(image.kernel.bytes())?;
    debug!("arm64 Image {hdr:x?}");

    let chosen = fdt.node_mut("/chosen").ok_or(Error::NoChosenNode)?;
    for name in STALE_CHOSEN {
        if chosen.remove_property(name).is_some() {
            debug!("dropped /chosen/{name}");
        }
    }

    let kernel = mem
        .add_kexec_segment_explicit(
            Arc::clone(&image.kernel),
            hdr.load_size(image.kernel.len()),
            hdr.text_offset,
            KERNEL_ALIGN,
        )
        .map_err(|e| e.in_segment("kernel"))?;
    info!("kernel at {kernel}");

    if let Some(initrd) = &image.initrd {
        let r = mem
            .add_kexec_segment(Arc::clone(initrd))
            .map_err(|e| e.in_segment("initrd"))?;
        chosen.set_property(Property::u64("linux,initrd-start", r.start));
        chosen.set_property(Property::u64("linux,initrd-end", r.start + initrd.len() as u64));
        info!("initrd at {r}");
    }

    if image.cmdline.is_empty() {
        chosen.remove_property("bootargs");
    } else {
        chosen.set_property(Property::string("bootargs", &image.cmdline));
    }

    let dtb = mem
        .add_kexec_segment(fdt.to_bytes())
        .map_err(|e| e.in_segment("device tree"))?;
    debug!("device tree at {dtb}");

    let entry = mem
        .add_kexec_segment(trampoline(kernel.start, dtb.start))
        .map_err(|e| e.in_segment("trampoline"))?;
    debug!("trampoline at {entry}");
    Ok(BootImage::planned(entry.start, mem, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::Node;
    use crate::memmap;
    use crate::range::{MemoryMap, Range, RangeType, TypedRange};
    use crate::segment::Segments;

    fn header(text_offset: u64, image_size: u64, flags: u64, magic: u32) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_SIZE];
        h[8..16].copy_from_slice(&text_offset.to_le_bytes());
        h[16..24].copy_from_slice(&image_size.to_le_bytes());
        h[24..32].copy_from_slice(&flags.to_le_bytes());
        h[56..60].copy_from_slice(&magic.to_le_bytes());
        h
    }

    fn fdt() -> Fdt {
        let mut root = Node::new("");
        let mut chosen = Node::new("chosen");
        chosen.set_property(Property::string("bootargs", "old"));
        chosen.set_property(Property::u64("kaslr-seed", 7));
        chosen.set_property(Property::u64("linux,initrd-start", 0x4000_0000));
        chosen.set_property(Property::string("stdout-path", "serial0"));
        let mut memory = Node::new("memory@100000");
        memory.set_property(Property::string("device_type", "memory"));
        let mut reg = 0x10_0000u64.to_be_bytes().to_vec();
        reg.extend_from_slice(&0xf0_0000u64.to_be_bytes());
        memory.set_property(Property::new("reg", reg));
        root.children.push(chosen);
        root.children.push(memory);
        Fdt {
            root,
            ..Fdt::default()
        }
    }

    fn dtb_at(segments: &Segments, start: u64) -> Fdt {
        let seg = segments
            .iter()
            .find(|s| s.phys().start == start)
            .unwrap();
        Fdt::parse(seg.buf()).unwrap()
    }

    #[test]
    fn header_errors() {
        let good = header(0, 0x10000, 0, IMAGE_MAGIC);
        assert_eq!(ImageHeader::parse(&good).unwrap().image_size, 0x10000);
        assert!(matches!(
            ImageHeader::parse(&header(0, 0, 0, 0x1234)),
            Err(Error::BadMagic {
                expected: 0x644d_5241,
                found: 0x1234
            })
        ));
        assert!(matches!(
            ImageHeader::parse(&header(0, 0, FLAG_BE, IMAGE_MAGIC)),
            Err(Error::BadEndianness)
        ));
        assert!(matches!(
            ImageHeader::parse(&good[..32]),
            Err(Error::MalformedObject(_))
        ));
    }

    #[test]
    fn old_kernels_use_file_size() {
        let h = ImageHeader::parse(&header(0x80000, 0, 0, IMAGE_MAGIC)).unwrap();
        assert_eq!(h.load_size(0x30_0001), 0x40_0000);
    }

    #[test]
    fn trampoline_layout() {
        let t = trampoline(0x20_0000, 0x10_0000);
        assert_eq!(t.len(), 40);
        assert_eq!(&t[..4], &0x5800_00c4u32.to_le_bytes());
        assert_eq!(u64::from_le_bytes(t[24..32].try_into().unwrap()), 0x20_0000);
        assert_eq!(u64::from_le_bytes(t[32..40].try_into().unwrap()), 0x10_0000);
    }

    #[test]
    fn places_kernel_dtb_and_trampoline() {
        let fdt = fdt();
        let mem = Memory::new(memmap::from_fdt(&fdt).unwrap());
        let image = LinuxImage::new(header(0, 0x10000, 0, IMAGE_MAGIC), "");
        let kernel = Arc::clone(&image.kernel);
        let boot = load(mem, fdt, image).unwrap();
        assert_eq!(boot.entry, 0x10_1000);

        let tramp = boot.segments.get_phys(Range::new(boot.entry, 40)).unwrap();
        assert_eq!(tramp, trampoline(0x20_0000, 0x10_0000));
        let kernel_seg = boot
            .segments
            .iter()
            .find(|s| s.phys().start == 0x20_0000)
            .unwrap();
        assert_eq!(kernel_seg.buf().as_ptr(), kernel.bytes().as_ptr());

        let dtb = dtb_at(&boot.segments, 0x10_0000);
        let chosen = dtb.node("/chosen").unwrap();
        assert!(chosen.property("kaslr-seed").is_none());
        assert!(chosen.property("linux,initrd-start").is_none());
        assert!(chosen.property("bootargs").is_none());
        assert_eq!(chosen.property("stdout-path").unwrap().as_str(), Some("serial0"));
    }

    #[test]
    fn initrd_and_bootargs_in_chosen() {
        let fdt = fdt();
        let mem = Memory::new(memmap::from_fdt(&fdt).unwrap());
        let image = LinuxImage::new(header(0x80000, 0x10000, 0, IMAGE_MAGIC), "console=ttyAMA0")
            .with_initrd(b"initramfs".to_vec());
        let boot = load(mem, fdt, image).unwrap();
        assert_eq!(boot.held(), 2);

        assert!(boot.segments.phys_contains(0x28_0000));
        let tramp = boot.segments.get_phys(Range::new(boot.entry, 40)).unwrap();
        let kernel_at = u64::from_le_bytes(tramp[24..32].try_into().unwrap());
        let dtb_addr = u64::from_le_bytes(tramp[32..40].try_into().unwrap());
        assert_eq!(kernel_at, 0x28_0000);

        let dtb = dtb_at(&boot.segments, dtb_addr);
        let chosen = dtb.node("/chosen").unwrap();
        let start = chosen.property("linux,initrd-start").unwrap().as_u64().unwrap();
        let end = chosen.property("linux,initrd-end").unwrap().as_u64().unwrap();
        assert_eq!(start, 0x10_0000);
        assert_eq!(end - start, 9);
        assert_eq!(chosen.property("bootargs").unwrap().as_str(), Some("console=ttyAMA0"));
    }

    #[test]
    fn needs_chosen_and_ram() {
        let image = LinuxImage::new(header(0, 0x10000, 0, IMAGE_MAGIC), "");
        let mut fdt = fdt();
        let mem = Memory::new(memmap::from_fdt(&fdt).unwrap());
        fdt.root.children.retain(|c| c.name != "chosen");
        assert!(matches!(
            load(mem, fdt.clone(), image.clone()),
            Err(Error::NoChosenNode)
        ));

        let empty = Memory::new(MemoryMap::from_entries([TypedRange::new(
            Range::new(0x10_0000, 0x1000),
            RangeType::Reserved,
        )]));
        assert!(matches!(load(empty, fdt, image), Err(Error::EmptyMemoryMap)));
    }

    #[test]
    fn kernel_failure_names_the_segment() {
        let fdt = fdt();
        let mem = Memory::new(memmap::from_fdt(&fdt).unwrap());
        let image = LinuxImage::new(header(0, 0x100_0000, 0, IMAGE_MAGIC), "");
        let err = load(mem, fdt, image).unwrap_err();
        assert!(matches!(err, Error::Segment { what: "kernel", .. }));
    }

    #[test]
    fn hostile_text_offset_is_an_error() {
        for (text_offset, image_size) in [(u64::MAX - 0x1000, 0x10000), (0x80000, u64::MAX)] {
            let fdt = fdt();
            let mem = Memory::new(memmap::from_fdt(&fdt).unwrap());
            let image = LinuxImage::new(header(text_offset, image_size, 0, IMAGE_MAGIC), "");
            let err = load(mem, fdt, image).unwrap_err();
            assert!(matches!(err, Error::Segment { what: "kernel", .. }));
            assert!(matches!(err.root(), Error::NotEnoughSpace { .. }));
        }
    }
}
