//! Physical memory planning for one load attempt.

use elf::ElfBytes;
use elf::abi::PT_LOAD;
use elf::endian::AnyEndian;
use log::debug;

use crate::error::{Error, Result};
use crate::range::{
    FindOptions, M1, MAX_ADDR, MemoryMap, PAGE_SIZE, Range, RangeType, Ranges, TypedRange,
    align_up_page,
};
use crate::segment::{Buffer, Segment, Segments};

/// What loaders need from a planner: carve out physical space, place a
/// segment, and look at what is still free.
pub trait PhysPlanner {
    /// Reserves `size` bytes (rounded up to a page) inside `limit`, starting
    /// on an `align` boundary.
    fn reserve(&mut self, size: u64, align: u64, limit: Range) -> Result<Range>;

    fn insert(&mut self, seg: Segment);

    /// RAM not yet claimed by a segment.
    fn available(&self) -> Ranges;
}

/// The physical memory map together with the segments planned so far.
#[derive(Clone, Debug, Default)]
pub struct Memory {
    pub phys: MemoryMap,
    pub segments: Segments,
}

impl Memory {
    pub fn new(phys: MemoryMap) -> Self {
        Self {
            phys,
            segments: Segments::new(),
        }
    }

    /// RAM minus every segment, each piece starting on a page boundary.
    pub fn available_ram(&self) -> Ranges {
        let mut ram = self.phys.ram();
        for s in self.segments.iter() {
            ram = ram.minus(s.phys());
        }
        ram.into_iter()
            .filter_map(|r| {
                let start = align_up_page(r.start);
                (start < r.end()).then(|| r.with_start(start))
            })
            .collect()
    }

    fn reserve_with(&mut self, size: u64, opts: FindOptions) -> Result<Range> {
        let size = align_up_page(size).max(PAGE_SIZE);
        let r = self.available_ram().find_space(size, opts)?;
        self.phys.insert(TypedRange::new(r, RangeType::Reserved));
        debug!("reserved {r}");
        Ok(r)
    }

    /// Reserves a page-rounded `size` inside `limit` and marks it reserved.
    pub fn reserve_phys(&mut self, size: u64, limit: Range) -> Result<Range> {
        self.reserve_with(size, FindOptions::new().within(limit))
    }

    /// Finds and reserves `size` bytes above 1 MiB aligned to `align`.
    pub fn find_space(&mut self, size: u64, align: u64) -> Result<Range> {
        self.reserve_with(
            size,
            FindOptions::new()
                .above(M1)
                .start_alignment(align.max(PAGE_SIZE)),
        )
    }

    /// Places `data` somewhere inside `limit`.
    pub fn add_phys_segment(&mut self, data: impl Into<Buffer>, limit: Range) -> Result<Range> {
        let data = data.into();
        let r = self.reserve_phys(data.len() as u64, limit)?;
        self.segments.insert(Segment::with_buffer(data, r));
        Ok(r)
    }

    /// Places `data` anywhere above 1 MiB.
    pub fn add_kexec_segment(&mut self, data: impl Into<Buffer>) -> Result<Range> {
        self.add_phys_segment(data, Range::from_interval(M1, MAX_ADDR))
    }

    /// Places `data` at `offset` inside a fresh block of `offset + size`
    /// bytes whose start is aligned to `align`. The returned range begins at
    /// the data.
    pub fn add_kexec_segment_explicit(
        &mut self,
        data: impl Into<Buffer>,
        size: u64,
        offset: u64,
        align: u64,
    ) -> Result<Range> {
        let total = offset
            .checked_add(size)
            .ok_or(Error::NotEnoughSpace { size: u64::MAX })?;
        let block = self.find_space(total, align)?;
        let start = block
            .start
            .checked_add(offset)
            .ok_or(Error::NotEnoughSpace { size: total })?;
        let r = Range::from_interval(start, block.end());
        self.segments.insert(Segment::with_buffer(data.into(), r));
        Ok(r)
    }

    /// Marks every range of `ranges` reserved so no segment lands there.
    pub fn reserve_ranges(&mut self, ranges: &[Range]) {
        for r in ranges {
            self.phys
                .insert(TypedRange::new(*r, RangeType::Reserved));
        }
    }

    /// Total size of the RAM in the memory map.
    pub fn total_ram(&self) -> u64 {
        self.phys
            .ram()
            .iter()
            .fold(0, |sum, r| sum.saturating_add(r.size))
    }

    /// Loads every `PT_LOAD` program of `data` at its physical address,
    /// zero-extended to its memory size.
    ///
    /// Programs that wrap the address space or are larger than all of RAM
    /// are rejected before anything is allocated.
    pub fn load_elf_segments(&mut self, data: &[u8]) -> Result<()> {
        let file = ElfBytes::<AnyEndian>::minimal_parse(data)?;
        let Some(segments) = file.segments() else {
            return Ok(());
        };
        let ram = self.total_ram();
        for program_header in segments.iter().filter(|p| p.p_type == PT_LOAD) {
            let (paddr, memsz) = (program_header.p_paddr, program_header.p_memsz);
            if paddr.checked_add(memsz).is_none() {
                return Err(Error::MalformedObject(format!(
                    "program at {paddr:#x} with {memsz:#x} bytes wraps the address space"
                )));
            }
            if memsz > ram {
                return Err(Error::MalformedObject(format!(
                    "program at {paddr:#x} needs {memsz:#x} bytes, RAM has {ram:#x}"
                )));
            }
            let segment = file.segment_data(&program_header)?;
            let mut buf = vec![0; program_header.p_memsz as usize];
            let filesz = segment.len().min(buf.len());
            buf[..filesz].copy_from_slice(&segment[..filesz]);
            let phys = Range::new(program_header.p_paddr, program_header.p_memsz);
            debug!("ELF segment {phys}");
            self.segments.insert(Segment::new(buf, phys));
        }
        Ok(())
    }

    pub fn into_segments(self) -> Segments {
        self.segments
    }
}

impl PhysPlanner for Memory {
    fn reserve(&mut self, size: u64, align: u64, limit: Range) -> Result<Range> {
        self.reserve_with(
            size,
            FindOptions::new()
                .within(limit)
                .start_alignment(align.max(PAGE_SIZE)),
        )
    }

    fn insert(&mut self, seg: Segment) {
        self.segments.insert(seg);
    }

    fn available(&self) -> Ranges {
        self.available_ram()
    }
}
