//! Interval arithmetic over physical addresses and the typed memory map built
//! on top of it.

use core::fmt;
use core::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 4096;

/// Memory below this address is never handed out by the "anywhere" searches.
pub const M1: u64 = 1 << 20;

/// Highest address in a 64-bit address space.
pub const MAX_ADDR: u64 = u64::MAX;

pub const fn align_up(v: u64, align: u64) -> u64 {
    if align <= 1 {
        return v;
    }
    match v % align {
        0 => v,
        rem => v.saturating_add(align - rem),
    }
}

pub const fn align_down(v: u64, align: u64) -> u64 {
    if align <= 1 { v } else { v - v % align }
}

pub const fn is_aligned(v: u64, align: u64) -> bool {
    align <= 1 || v % align == 0
}

pub const fn align_up_page(v: u64) -> u64 {
    align_up(v, PAGE_SIZE)
}

pub const fn align_down_page(v: u64) -> u64 {
    align_down(v, PAGE_SIZE)
}

/// A contiguous interval `[start, start + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

impl Range {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// `[start, end)`
    pub const fn from_interval(start: u64, end: u64) -> Self {
        Self {
            start,
            size: end.saturating_sub(start),
        }
    }

    /// `[start, last]`
    pub const fn from_inclusive_interval(start: u64, last: u64) -> Self {
        Self {
            start,
            size: last.saturating_sub(start).saturating_add(1),
        }
    }

    /// First address after the interval.
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// Last address inside the interval. Meaningless for empty ranges.
    pub const fn last(&self) -> u64 {
        self.end().saturating_sub(1)
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub const fn contains(&self, p: u64) -> bool {
        self.start <= p && p < self.end()
    }

    pub const fn overlaps(&self, other: Range) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub const fn disjunct(&self, other: Range) -> bool {
        !self.overlaps(other)
    }

    /// True if the two ranges touch without sharing a point.
    pub const fn adjacent(&self, other: Range) -> bool {
        other.end() == self.start || self.end() == other.start
    }

    pub const fn is_superset_of(&self, other: Range) -> bool {
        self.start <= other.start && self.end() >= other.end()
    }

    pub fn intersect(&self, other: Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Range::from_interval(
            self.start.max(other.start),
            self.end().min(other.end()),
        ))
    }

    /// Removes every point of `other` from `self`.
    ///
    /// Yields `self` when the two are disjoint, nothing when `other` covers
    /// `self`, and otherwise the left remainder followed by the right one.
    pub fn minus(&self, other: Range) -> Vec<Range> {
        if self.disjunct(other) {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if other.start > self.start {
            rest.push(Range::from_interval(self.start, other.start));
        }
        if other.end() < self.end() {
            rest.push(Range::from_interval(other.end(), self.end()));
        }
        rest
    }

    /// Returns a range beginning at `start` and ending at `self.end()`.
    pub const fn with_start(&self, start: u64) -> Range {
        Range::from_interval(start, self.end())
    }

    /// Smallest superset of `self` whose start and size are multiples of
    /// `align`. Empty ranges stay empty.
    pub const fn align(&self, align: u64) -> Range {
        let start = align_down(self.start, align);
        if self.size == 0 {
            return Range { start, size: 0 };
        }
        Range {
            start,
            size: align_up(self.size.saturating_add(self.start - start), align),
        }
    }

    pub const fn align_page(&self) -> Range {
        self.align(PAGE_SIZE)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Constraints for [`Ranges::find_space`].
#[derive(Clone, Copy, Debug)]
pub struct FindOptions {
    limit: Range,
    align: u64,
    start_align: u64,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: Range::from_interval(0, MAX_ADDR),
            align: 0,
            start_align: 0,
        }
    }
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The result must lie within `limit`.
    pub fn within(mut self, limit: Range) -> Self {
        self.limit = limit;
        self
    }

    /// The result must start at or above `min`.
    pub fn above(mut self, min: u64) -> Self {
        let start = self.limit.start.max(min);
        self.limit = Range::from_interval(start, self.limit.end().max(start));
        self
    }

    /// Start address and size are both rounded to `align`.
    pub fn alignment(mut self, align: u64) -> Self {
        self.align = align;
        self.start_align = align;
        self
    }

    /// Only the start address is rounded to `align`.
    pub fn start_alignment(mut self, align: u64) -> Self {
        self.start_align = align;
        self
    }
}

/// An ordered list of ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ranges(Vec<Range>);

impl Ranges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, r: Range) {
        self.0.push(r);
    }

    /// Removes the points of `r` from every range.
    pub fn minus(&self, r: Range) -> Ranges {
        self.0.iter().flat_map(|old| old.minus(r)).collect()
    }

    /// Sorts by start, supersets first among ranges sharing a start.
    pub fn sort(&mut self) {
        self.0
            .sort_by(|a, b| a.start.cmp(&b.start).then(b.size.cmp(&a.size)));
    }

    pub fn find_space(&self, size: u64, opts: FindOptions) -> Result<Range> {
        let size = if opts.align != 0 {
            align_up(size, opts.align)
        } else {
            size
        };
        let mut limit = opts.limit;
        if opts.start_align != 0 && !is_aligned(limit.start, opts.start_align) {
            limit = limit.with_start(align_up(limit.start, opts.start_align));
        }
        for r in &self.0 {
            let mut r = *r;
            if opts.start_align != 0 && !is_aligned(r.start, opts.start_align) {
                r = r.with_start(align_up(r.start, opts.start_align));
            }
            if let Some(overlap) = r.intersect(limit) {
                if overlap.size >= size {
                    return Ok(Range::new(overlap.start, size));
                }
            }
        }
        Err(Error::NotEnoughSpace { size })
    }

    /// First-fit search for `size` bytes inside `limit`.
    pub fn find_space_in(&self, size: u64, limit: Range) -> Result<Range> {
        self.find_space(size, FindOptions::new().within(limit))
    }

    pub fn find_space_above(&self, size: u64, min: u64) -> Result<Range> {
        self.find_space(size, FindOptions::new().above(min))
    }
}

impl Deref for Ranges {
    type Target = [Range];

    fn deref(&self) -> &[Range] {
        &self.0
    }
}

impl From<Vec<Range>> for Ranges {
    fn from(v: Vec<Range>) -> Self {
        Self(v)
    }
}

impl FromIterator<Range> for Ranges {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Ranges {
    type Item = Range;
    type IntoIter = std::vec::IntoIter<Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Ranges {
    type Item = &'a Range;
    type IntoIter = core::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Kind of a physical memory range, named after the labels Linux uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeType {
    Ram,
    Default,
    Acpi,
    Nvs,
    Reserved,
}

impl RangeType {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ram => "System RAM",
            Self::Default => "Default",
            Self::Acpi => "ACPI Tables",
            Self::Nvs => "ACPI Non-volatile Storage",
            Self::Reserved => "Reserved",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "System RAM" => Some(Self::Ram),
            "Default" => Some(Self::Default),
            "ACPI Tables" => Some(Self::Acpi),
            "ACPI Non-volatile Storage" => Some(Self::Nvs),
            "Reserved" | "reserved" => Some(Self::Reserved),
            _ => None,
        }
    }

    /// Type code in the x86 e820 table.
    pub const fn e820(self) -> u32 {
        match self {
            Self::Ram => 1,
            Self::Acpi => 3,
            Self::Nvs => 4,
            Self::Reserved | Self::Default => 2,
        }
    }
}

impl fmt::Display for RangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedRange {
    pub range: Range,
    pub kind: RangeType,
}

impl TypedRange {
    pub const fn new(range: Range, kind: RangeType) -> Self {
        Self { range, kind }
    }
}

impl fmt::Display for TypedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{addr: {}, type: {}}}", self.range, self.kind)
    }
}

/// Layout of physical memory: which ranges are usable RAM and which are
/// reserved.
///
/// Kept sorted by start address, without overlaps, and with touching
/// entries of the same type merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryMap(Vec<TypedRange>);

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map by inserting `entries` in order; later entries win where
    /// they overlap earlier ones.
    pub fn from_entries<I: IntoIterator<Item = TypedRange>>(entries: I) -> Self {
        let mut map = Self::new();
        for tr in entries {
            map.insert(tr);
        }
        map
    }

    /// Inserts `tr`, carving it out of every entry it overlaps.
    pub fn insert(&mut self, tr: TypedRange) {
        if tr.range.is_empty() {
            return;
        }
        let mut carved: Vec<TypedRange> = self
            .0
            .iter()
            .flat_map(|old| {
                old.range
                    .minus(tr.range)
                    .into_iter()
                    .map(move |r| TypedRange::new(r, old.kind))
            })
            .collect();
        carved.push(tr);
        carved.sort_by_key(|e| e.range.start);

        let mut merged: Vec<TypedRange> = Vec::with_capacity(carved.len());
        for e in carved {
            match merged.last_mut() {
                Some(last)
                    if last.kind == e.kind
                        && (last.range.overlaps(e.range) || last.range.adjacent(e.range)) =>
                {
                    last.range = Range::from_interval(
                        last.range.start,
                        last.range.end().max(e.range.end()),
                    );
                }
                _ => merged.push(e),
            }
        }
        self.0 = merged;
    }

    pub fn filter_by_type(&self, kind: RangeType) -> Ranges {
        self.0
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.range)
            .collect()
    }

    pub fn ram(&self) -> Ranges {
        self.filter_by_type(RangeType::Ram)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, TypedRange> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(addr, size, type)` triples as stored in the x86 boot parameters.
    pub fn as_e820(&self) -> Vec<(u64, u64, u32)> {
        self.0
            .iter()
            .map(|e| (e.range.start, e.range.size, e.kind.e820()))
            .collect()
    }
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.0 {
            writeln!(f, "{e}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MemoryMap {
    type Item = &'a TypedRange;
    type IntoIter = core::slice::Iter<'a, TypedRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, size: u64) -> Range {
        Range::new(start, size)
    }

    fn ram(start: u64, size: u64) -> TypedRange {
        TypedRange::new(r(start, size), RangeType::Ram)
    }

    fn reserved(start: u64, size: u64) -> TypedRange {
        TypedRange::new(r(start, size), RangeType::Reserved)
    }

    #[test]
    fn intersect() {
        assert_eq!(r(0, 10).intersect(r(5, 10)), Some(r(5, 5)));
        assert_eq!(r(5, 10).intersect(r(0, 10)), Some(r(5, 5)));
        assert_eq!(r(0, 10).intersect(r(2, 3)), Some(r(2, 3)));
        assert_eq!(r(0, 10).intersect(r(10, 3)), None);
        assert_eq!(r(0, 0).intersect(r(0, 3)), None);
    }

    #[test]
    fn minus_cases() {
        // disjoint
        assert_eq!(r(0, 10).minus(r(20, 5)), vec![r(0, 10)]);
        // covered
        assert_eq!(r(5, 5).minus(r(0, 20)), vec![]);
        assert_eq!(r(5, 5).minus(r(5, 5)), vec![]);
        // hole in the middle
        assert_eq!(r(0, 10).minus(r(3, 2)), vec![r(0, 3), r(5, 5)]);
        // left and right cuts
        assert_eq!(r(0, 10).minus(r(0, 4)), vec![r(4, 6)]);
        assert_eq!(r(0, 10).minus(r(6, 10)), vec![r(0, 6)]);
        assert_eq!(r(4, 10).minus(r(0, 6)), vec![r(6, 8)]);
    }

    #[test]
    fn minus_reconstructs_original() {
        let samples = [
            r(0, 10),
            r(3, 2),
            r(0, 4),
            r(8, 8),
            r(10, 1),
            r(0, 0),
            r(9, 1),
            r(0, 20),
        ];
        for a in samples {
            for b in samples {
                let pieces = a.minus(b);
                for (i, p) in pieces.iter().enumerate() {
                    for q in &pieces[i + 1..] {
                        assert!(p.disjunct(*q), "{a} - {b}: {p} overlaps {q}");
                    }
                    assert!(a.is_superset_of(*p));
                }
                let mut covered: u64 = pieces.iter().map(|p| p.size).sum();
                if let Some(i) = a.intersect(b) {
                    covered += i.size;
                    assert!(pieces.iter().all(|p| p.disjunct(i)));
                }
                assert_eq!(covered, a.size, "{a} - {b} = {pieces:?}");
            }
        }
    }

    #[test]
    fn adjacency_and_superset() {
        assert!(r(0, 10).adjacent(r(10, 5)));
        assert!(r(10, 5).adjacent(r(0, 10)));
        assert!(!r(0, 10).adjacent(r(9, 5)));
        assert!(r(0, 10).is_superset_of(r(0, 10)));
        assert!(r(0, 10).is_superset_of(r(2, 3)));
        assert!(!r(0, 10).is_superset_of(r(8, 3)));
        assert!(r(0, 10).contains(9));
        assert!(!r(0, 10).contains(10));
    }

    #[test]
    fn align_range() {
        assert_eq!(r(0x1010, 0x10).align_page(), r(0x1000, 0x1000));
        assert_eq!(r(0x1ff0, 0x20).align_page(), r(0x1000, 0x2000));
        assert_eq!(r(0x1010, 0).align_page(), r(0x1000, 0));
    }

    #[test]
    fn find_space_first_fit() {
        let rs = Ranges::from(vec![r(0, 0x1000), r(0x10000, 0x4000)]);
        assert_eq!(rs.find_space_in(0x2000, r(0, MAX_ADDR)).unwrap(), r(0x10000, 0x2000));
        assert_eq!(rs.find_space_in(0x100, r(0, MAX_ADDR)).unwrap(), r(0, 0x100));
        assert_eq!(
            rs.find_space_in(0x1000, r(0x11000, 0x2000)).unwrap(),
            r(0x11000, 0x1000)
        );
        assert!(matches!(
            rs.find_space_in(0x5000, r(0, MAX_ADDR)),
            Err(Error::NotEnoughSpace { size: 0x5000 })
        ));
        assert!(matches!(
            rs.find_space_in(0x3000, r(0x12000, 0x10000)),
            Err(Error::NotEnoughSpace { .. })
        ));
    }

    #[test]
    fn find_space_respects_limit() {
        let rs = Ranges::from(vec![r(0, 0x100000), r(0x200000, 0x100000)]);
        for (size, limit) in [
            (0x1000, r(0x800, 0x3000)),
            (0x10, r(0xfff00, 0x200000)),
            (0x80000, r(0x250000, 0x100000)),
        ] {
            let got = rs.find_space_in(size, limit).unwrap();
            assert_eq!(got.size, size);
            assert!(limit.is_superset_of(got), "{got} not in {limit}");
            assert!(rs.iter().any(|x| x.is_superset_of(got)));
        }
    }

    #[test]
    fn find_space_alignment() {
        let rs = Ranges::from(vec![r(0x1000, 0x100000), r(0x300000, 0x800000)]);
        let got = rs
            .find_space(0x1000, FindOptions::new().alignment(0x200000))
            .unwrap();
        assert_eq!(got, r(0x400000, 0x200000));
        let got = rs
            .find_space(0x1000, FindOptions::new().start_alignment(0x10000))
            .unwrap();
        assert_eq!(got, r(0x10000, 0x1000));
        let got = rs.find_space_above(0x1000, 0x2345).unwrap();
        assert_eq!(got, r(0x2345, 0x1000));
    }

    #[test]
    fn memory_map_insert_carves_and_merges() {
        let mut mm = MemoryMap::from_entries([ram(0, 0x10000)]);
        mm.insert(reserved(0x2000, 0x1000));
        assert_eq!(
            mm.iter().copied().collect::<Vec<_>>(),
            vec![ram(0, 0x2000), reserved(0x2000, 0x1000), ram(0x3000, 0xd000)]
        );
        mm.insert(reserved(0x3000, 0x1000));
        assert_eq!(
            mm.iter().copied().collect::<Vec<_>>(),
            vec![ram(0, 0x2000), reserved(0x2000, 0x2000), ram(0x4000, 0xc000)]
        );
        assert_eq!(mm.ram(), Ranges::from(vec![r(0, 0x2000), r(0x4000, 0xc000)]));
    }

    #[test]
    fn memory_map_insert_idempotent() {
        let mut mm = MemoryMap::from_entries([ram(0, 0x10000), ram(0x20000, 0x10000)]);
        let tr = reserved(0xf000, 0x12000);
        mm.insert(tr);
        let once = mm.clone();
        mm.insert(tr);
        assert_eq!(mm, once);
        for pair in mm.iter().collect::<Vec<_>>().windows(2) {
            assert!(pair[0].range.end() <= pair[1].range.start);
        }
    }

    #[test]
    fn memory_map_keeps_sorted_non_overlapping() {
        let mut mm = MemoryMap::new();
        for tr in [
            ram(0x100000, 0x100000),
            ram(0, 0x9f000),
            reserved(0x9f000, 0x61000),
            TypedRange::new(r(0xe0000, 0x20000), RangeType::Acpi),
            reserved(0x180000, 0x1000),
        ] {
            mm.insert(tr);
            let entries: Vec<_> = mm.iter().collect();
            for pair in entries.windows(2) {
                assert!(pair[0].range.end() <= pair[1].range.start, "{mm}");
                assert!(
                    !(pair[0].kind == pair[1].kind && pair[0].range.adjacent(pair[1].range)),
                    "unmerged neighbours in {mm}"
                );
            }
        }
        assert_eq!(mm.len(), 6);
    }

    #[test]
    fn e820_codes() {
        let mm = MemoryMap::from_entries([
            ram(0, 0x1000),
            TypedRange::new(r(0x1000, 0x1000), RangeType::Nvs),
        ]);
        assert_eq!(mm.as_e820(), vec![(0, 0x1000, 1), (0x1000, 0x1000, 4)]);
    }
}
