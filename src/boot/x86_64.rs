//! Linux/x86 boot protocol: a bzImage, its zero page and a purgatory that
//! jumps to the kernel's 64-bit entry point.

use std::sync::Arc;

use log::{debug, info, warn};

use super::{BootImage, LinuxImage};
use crate::bzimage::offsets::*;
use crate::bzimage::{BzImage, SETUP_HEADER_OFFSET};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::object::Object;
use crate::purgatory::Purgatory;
use crate::range::{M1, Range};

pub const ZERO_PAGE_SIZE: usize = 4096;

/// Oldest protocol with a relocatable kernel and `initrd_addr_max`.
const MIN_PROTOCOL: u16 = 0x0205;

/// Highest address an initrd may end at, whatever the header claims.
const INITRD_ADDR_MAX: u64 = 0x37ff_ffff;

/// Low memory the zero page and command line are placed in.
const LOW_MEMORY: Range = Range::from_interval(0x1_0000, 0xa_0000);

const E820_MAX: usize = 128;
const E820_ENTRY_SIZE: usize = 20;

const LOADER_UNDEFINED: u8 = 0xff;

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Stores a 64-bit address split between a setup header field and its
/// `ext_` high half.
fn put_split(buf: &mut [u8], lo: usize, hi: usize, v: u64) {
    put32(buf, lo, v as u32);
    put32(buf, hi, (v >> 32) as u32);
}

fn write_e820(zp: &mut [u8], table: &[(u64, u64, u32)]) {
    if table.len() > E820_MAX {
        warn!("memory map has {} entries, only {E820_MAX} fit", table.len());
    }
    let table = &table[..table.len().min(E820_MAX)];
    zp[E820_ENTRIES] = table.len() as u8;
    for (i, &(addr, size, kind)) in table.iter().enumerate() {
        let off = E820_TABLE + i * E820_ENTRY_SIZE;
        zp[off..off + 8].copy_from_slice(&addr.to_le_bytes());
        zp[off + 8..off + 16].copy_from_slice(&size.to_le_bytes());
        zp[off + 16..off + 20].copy_from_slice(&kind.to_le_bytes());
    }
}

/// Plans `image` into `mem`. The boot image enters through the purgatory.
///
/// `params` is the running kernel's zero page; it supplies everything the
/// new kernel would otherwise ask firmware for.
pub fn load(
    mut mem: Memory,
    params: &[u8],
    image: LinuxImage,
    purgatory: &Purgatory,
) -> Result<BootImage> {
    // The e820 table describes firmware memory, not our reservations.
    let e820 = mem.phys.as_e820();

    let bz = BzImage::parse(image.kernel.bytes())?;
    let hdr = bz.header;
    if hdr.version < MIN_PROTOCOL {
        return Err(Error::UnsupportedProtocol(hdr.version));
    }
    if hdr.relocatable_kernel == 0 {
        return Err(Error::KernelNotRelocatable);
    }

    let kernel = bz.kernel().map_err(|e| e.in_segment("kernel"))?;
    mem.load_elf_segments(&kernel)
        .map_err(|e| e.in_segment("kernel"))?;
    let entry = Object::parse(&kernel)
        .map_err(|e| e.in_segment("kernel"))?
        .entry();
    info!("kernel entry {entry:#x}, protocol {:#06x}", hdr.version);

    let mut zp = vec![0u8; ZERO_PAGE_SIZE];
    let n = params.len().min(ZERO_PAGE_SIZE);
    zp[..n].copy_from_slice(&params[..n]);
    let setup = bz.setup_header();
    zp[SETUP_HEADER_OFFSET..SETUP_HEADER_OFFSET + setup.len()].copy_from_slice(setup);
    zp[TYPE_OF_LOADER] = LOADER_UNDEFINED;

    if let Some(initrd) = &image.initrd {
        let max = match hdr.initrd_addr_max {
            0 => INITRD_ADDR_MAX,
            m => (m as u64).min(INITRD_ADDR_MAX),
        };
        let r = mem
            .add_phys_segment(Arc::clone(initrd), Range::from_inclusive_interval(M1, max))
            .map_err(|e| e.in_segment("initrd"))?;
        put_split(&mut zp, RAMDISK_IMAGE, EXT_RAMDISK_IMAGE, r.start);
        put_split(&mut zp, RAMDISK_SIZE, EXT_RAMDISK_SIZE, initrd.len() as u64);
        info!("initrd at {r}");
    }

    if !image.cmdline.is_empty() {
        let limit = hdr.cmdline_size as usize;
        if limit != 0 && image.cmdline.len() > limit {
            return Err(Error::BzImage(format!(
                "command line is {} bytes, the kernel takes at most {limit}",
                image.cmdline.len()
            ))
            .in_segment("command line"));
        }
        let mut cmdline = image.cmdline.as_bytes().to_vec();
        cmdline.push(0);
        let r = match mem.add_phys_segment(cmdline.clone(), LOW_MEMORY) {
            Err(Error::NotEnoughSpace { .. }) => {
                debug!("no room for the command line in low memory");
                mem.add_kexec_segment(cmdline)
            }
            other => other,
        }
        .map_err(|e| e.in_segment("command line"))?;
        put_split(&mut zp, CMD_LINE_PTR, EXT_CMD_LINE_PTR, r.start);
        debug!("command line at {r}");
    }

    write_e820(&mut zp, &e820);
    let params = mem
        .add_phys_segment(zp, LOW_MEMORY)
        .map_err(|e| e.in_segment("boot parameters"))?;
    debug!("boot parameters at {params}");

    let entry = purgatory
        .load(&mut mem, entry, params.start)
        .map_err(|e| e.in_segment("purgatory"))?;
    Ok(BootImage::planned(entry, mem, image))
}
