//! Reading the firmware memory map.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::fdt::{Fdt, Node};
use crate::range::{MemoryMap, Range, RangeType, TypedRange};

pub const SYSFS_MEMMAP: &str = "/sys/firmware/memmap";
pub const PROC_IOMEM: &str = "/proc/iomem";
pub const DEBUGFS_MEMBLOCK: &str = "/sys/kernel/debug/memblock";

/// Hexadecimal with a `0x` prefix, decimal otherwise.
fn parse_num(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| Error::MemoryMap(format!("{s:?}: {e}")))
}

/// Reads `/sys/firmware/memmap`: one directory per entry holding `start`,
/// `end` (inclusive) and `type` files.
pub fn from_sysfs(dir: &Path) -> Result<MemoryMap> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let read = |name: &str| -> Result<String> {
            Ok(fs::read_to_string(path.join(name))?.trim().to_owned())
        };
        let start = parse_num(&read("start")?)?;
        let end = parse_num(&read("end")?)?;
        let label = read("type")?;
        let kind = RangeType::from_label(&label).unwrap_or_else(|| {
            warn!(
                "{}: unrecognized memory map type {label:?}, defaulting to Reserved",
                path.display()
            );
            RangeType::Reserved
        });
        entries.push(TypedRange::new(
            Range::from_inclusive_interval(start, end),
            kind,
        ));
    }
    entries.sort_by_key(|e| e.range.start);
    Ok(MemoryMap::from_entries(entries))
}

/// Parses `/proc/iomem` lines of the form `start-end : label`.
///
/// Every line is inserted in order, so nested resources carve the ranges
/// that contain them. Labels other than the memory map types count as
/// reserved.
pub fn from_iomem(r: impl Read) -> Result<MemoryMap> {
    let mut mm = MemoryMap::new();
    for line in BufReader::new(r).lines() {
        let line = line?;
        let Some((addrs, label)) = line.split_once(" : ") else {
            continue;
        };
        let Some((start, end)) = addrs.trim().split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        // Empty resources show up as "0000-0000".
        if start == end {
            continue;
        }
        let label = label.trim();
        let kind = RangeType::from_label(label).unwrap_or_else(|| {
            debug!("iomem: treating {label:?} as reserved");
            RangeType::Reserved
        });
        mm.insert(TypedRange::new(
            Range::from_inclusive_interval(start, end),
            kind,
        ));
    }
    Ok(mm)
}

pub fn from_iomem_file(path: &Path) -> Result<MemoryMap> {
    from_iomem(fs::File::open(path)?)
}

fn memblock_ranges(text: &str) -> Result<Vec<Range>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((_, span)) = line.split_once(':') else {
            continue;
        };
        let Some((start, end)) = span.trim().split_once("..") else {
            return Err(Error::MemoryMap(format!("bad memblock line {line:?}")));
        };
        out.push(Range::from_inclusive_interval(
            parse_num(start)?,
            parse_num(end)?,
        ));
    }
    Ok(out)
}

/// Reads the debugfs memblock tables: `memory` gives RAM, `reserved` is
/// carved out of it.
pub fn from_memblock(dir: &Path) -> Result<MemoryMap> {
    let memory = memblock_ranges(&fs::read_to_string(dir.join("memory"))?)?;
    let reserved = match fs::read_to_string(dir.join("reserved")) {
        Ok(text) => memblock_ranges(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(MemoryMap::from_entries(
        memory
            .into_iter()
            .map(|r| TypedRange::new(r, RangeType::Ram))
            .chain(
                reserved
                    .into_iter()
                    .map(|r| TypedRange::new(r, RangeType::Reserved)),
            ),
    ))
}

fn cells(node: &Node, name: &str, default: u32) -> u32 {
    node.property(name)
        .and_then(|p| p.as_u32())
        .unwrap_or(default)
}

fn read_cells(b: &[u8]) -> u64 {
    b.chunks(4).fold(0, |acc, c| {
        let mut w = [0; 4];
        w.copy_from_slice(c);
        (acc << 32) | u32::from_be_bytes(w) as u64
    })
}

/// `(address, size)` pairs of a `reg` property.
fn regions(node: &Node, address_cells: u32, size_cells: u32) -> Result<Vec<Range>> {
    let Some(reg) = node.property("reg") else {
        return Ok(Vec::new());
    };
    let (a, s) = (address_cells as usize * 4, size_cells as usize * 4);
    if a == 0 || a > 8 || s > 8 || reg.value.is_empty() || reg.value.len() % (a + s) != 0 {
        return Err(Error::Fdt(format!(
            "{}: reg of {} bytes does not fit {address_cells}/{size_cells} cells",
            node.name,
            reg.value.len()
        )));
    }
    Ok(reg
        .value
        .chunks(a + s)
        .map(|t| Range::new(read_cells(&t[..a]), read_cells(&t[a..])))
        .collect())
}

/// Builds the memory map from `device_type = "memory"` nodes, then carves
/// out `/reserved-memory` children and the memory reservation block.
pub fn from_fdt(fdt: &Fdt) -> Result<MemoryMap> {
    let ac = cells(&fdt.root, "#address-cells", 2);
    let sc = cells(&fdt.root, "#size-cells", 2);

    let mut memory = Vec::new();
    fdt.root.walk(&mut |n| {
        if n.property("device_type").and_then(|p| p.as_str()) == Some("memory") {
            memory.push(n);
        }
    });
    let mut mm = MemoryMap::new();
    for n in memory {
        for r in regions(n, ac, sc)? {
            mm.insert(TypedRange::new(r, RangeType::Ram));
        }
    }

    if let Some(resv) = fdt.node("/reserved-memory") {
        let (ac, sc) = (cells(resv, "#address-cells", ac), cells(resv, "#size-cells", sc));
        for child in &resv.children {
            for r in regions(child, ac, sc)? {
                mm.insert(TypedRange::new(r, RangeType::Reserved));
            }
        }
    }
    for e in &fdt.reserve_entries {
        mm.insert(TypedRange::new(
            Range::new(e.address, e.size),
            RangeType::Reserved,
        ));
    }
    Ok(mm)
}
