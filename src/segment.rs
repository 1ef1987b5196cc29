//! Segments bind a buffer to the physical range it will be copied to.

use core::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::ImageFile;
use crate::range::{Range, Ranges, align_down_page, align_up_page};

/// The bytes a segment loads: an owned buffer, or a prefix of a mapped file
/// that is only copied once it has to change.
#[derive(Clone, Debug)]
pub enum Buffer {
    Owned(Vec<u8>),
    File { file: Arc<ImageFile>, len: usize },
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::File { file, len } => &file.bytes()[..*len],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Owned(v) => v.len(),
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn truncate(&mut self, n: usize) {
        match self {
            Self::Owned(v) => v.truncate(n),
            Self::File { len, .. } => *len = (*len).min(n),
        }
    }

    fn into_vec(self) -> Vec<u8> {
        match self {
            Self::Owned(v) => v,
            Self::File { file, len } => file.bytes()[..len].to_vec(),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::Owned(Vec::new())
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Buffer {}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Self::Owned(v)
    }
}

impl From<Arc<ImageFile>> for Buffer {
    fn from(file: Arc<ImageFile>) -> Self {
        let len = file.len();
        Self::File { file, len }
    }
}

/// A buffer plus the physical range it is loaded into.
///
/// The buffer may be shorter than the physical range (the remainder is zero
/// filled by the kernel) or empty altogether. Its address stays put for as
/// long as the segment is alive.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    buf: Buffer,
    phys: Range,
}

impl Segment {
    pub fn new(buf: Vec<u8>, phys: Range) -> Self {
        Self::with_buffer(Buffer::Owned(buf), phys)
    }

    pub fn with_buffer(buf: Buffer, phys: Range) -> Self {
        Self { buf, phys }
    }

    /// A segment with no buffer: the whole physical range is zero filled.
    pub fn zeroed(phys: Range) -> Self {
        Self::new(Vec::new(), phys)
    }

    pub fn buf(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn phys(&self) -> Range {
        self.phys
    }

    /// Virtual address range of the buffer in this process.
    pub fn buf_range(&self) -> Range {
        if self.buf.is_empty() {
            return Range::default();
        }
        Range::new(self.buf().as_ptr() as u64, self.buf.len() as u64)
    }

    /// Rounds the physical start down and the size up to whole pages. The
    /// buffer is left-padded with zeros so its bytes keep their addresses.
    #[must_use]
    pub fn align_phys(self) -> Self {
        let mut s = self.align_phys_start();
        s.phys.size = align_up_page(s.phys.size);
        s
    }

    fn align_phys_start(mut self) -> Self {
        let start = align_down_page(self.phys.start);
        let diff = self.phys.start - start;
        self.phys = Range::new(start, self.phys.size.saturating_add(diff));
        if diff != 0 && !self.buf.is_empty() {
            let old = self.buf.as_slice();
            let mut buf = vec![0; diff as usize + old.len()];
            buf[diff as usize..].copy_from_slice(old);
            self.buf = Buffer::Owned(buf);
        }
        self
    }

    /// Buffer bytes that actually land in physical memory.
    fn data(&self) -> &[u8] {
        let buf = self.buf.as_slice();
        &buf[..buf.len().min(self.phys.size as usize)]
    }

    /// Byte that ends up at physical address `addr`, which must lie in
    /// `self.phys`.
    fn byte_at(&self, addr: u64) -> u8 {
        self.data()
            .get((addr - self.phys.start) as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Merges `other` into `self` if their physical ranges overlap.
    ///
    /// Returns `Ok(false)` for disjoint segments. Overlapping bytes must be
    /// identical in both, otherwise the merge fails with
    /// [`Error::ContentConflict`] and `self` is left untouched.
    pub fn try_merge(&mut self, other: &Segment) -> Result<bool> {
        if self.phys.disjunct(other.phys) {
            return Ok(false);
        }
        if other.phys.start < self.phys.start {
            let mut merged = other.clone();
            merged.absorb(self)?;
            *self = merged;
        } else {
            self.absorb(other)?;
        }
        Ok(true)
    }

    /// First address in `[other.phys.start, end)` where `self` and `other`
    /// would load different bytes.
    fn first_conflict(&self, other: &Segment, end: u64) -> Option<u64> {
        let start = other.phys.start;
        if end <= start {
            return None;
        }
        let n = (end - start) as usize;
        let ours = self
            .data()
            .get((start - self.phys.start) as usize..)
            .unwrap_or_default();
        let ours = &ours[..ours.len().min(n)];
        let theirs = &other.data()[..other.data().len().min(n)];
        let common = ours.len().min(theirs.len());
        if ours[..common] != theirs[..common] {
            let i = ours.iter().zip(theirs).position(|(a, b)| a != b)?;
            return Some(start + i as u64);
        }
        // Past the shorter buffer the other side is zero fill.
        let rest = if ours.len() > common {
            &ours[common..]
        } else {
            &theirs[common..]
        };
        rest.iter()
            .position(|&b| b != 0)
            .map(|i| start + (common + i) as u64)
    }

    /// Extends `self` to cover `other`, which must not start before `self`.
    /// Any gap between the two is zero filled.
    fn absorb(&mut self, other: &Segment) -> Result<()> {
        debug_assert!(self.phys.start <= other.phys.start);

        let shared_end = self.phys.end().min(other.phys.end());
        let data_end = (self.phys.start + self.data().len() as u64)
            .max(other.phys.start + other.data().len() as u64);
        if let Some(at) = self.first_conflict(other, shared_end.min(data_end)) {
            return Err(Error::ContentConflict {
                first: self.phys,
                second: other.phys,
                at,
            });
        }

        let own = self.data().len();
        self.buf.truncate(own);
        let offset = (other.phys.start - self.phys.start) as usize;
        let theirs = other.data();
        if offset + theirs.len() > own {
            let from = own.saturating_sub(offset);
            let mut buf = core::mem::take(&mut self.buf).into_vec();
            buf.resize(offset + theirs.len(), 0);
            buf[offset + from..].copy_from_slice(&theirs[from..]);
            self.buf = Buffer::Owned(buf);
        }
        self.phys = Range::from_interval(self.phys.start, self.phys.end().max(other.phys.end()));
        Ok(())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(phys: {}, buffer: size {:#x})", self.phys, self.buf.len())
    }
}

/// Segments of a pending load, ordered by physical start address.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Segments(Vec<Segment>);

impl Segments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `s`, keeping the list ordered by physical start.
    pub fn insert(&mut self, s: Segment) {
        let at = self.0.partition_point(|x| x.phys.start <= s.phys.start);
        self.0.insert(at, s);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Segment> {
        self.0.iter()
    }

    pub fn phys(&self) -> Ranges {
        self.0.iter().map(|s| s.phys).collect()
    }

    pub fn phys_contains(&self, p: u64) -> bool {
        self.0.iter().any(|s| s.phys.contains(p))
    }

    /// Contents of the physical range `r`, if a single segment covers it.
    pub fn get_phys(&self, r: Range) -> Option<Vec<u8>> {
        let seg = self.0.iter().find(|s| s.phys.is_superset_of(r))?;
        Some((r.start..r.end()).map(|a| seg.byte_at(a)).collect())
    }

    /// Checks that every byte `other` would load is loaded identically by
    /// `self`. Returns the first range that is missing or differs.
    pub fn is_superset_of(&self, other: &Segments) -> core::result::Result<(), Range> {
        for seg in other.iter() {
            let data = seg.data();
            if data.is_empty() {
                continue;
            }
            let r = Range::new(seg.phys.start, data.len() as u64);
            match self.get_phys(r) {
                Some(got) if got == data => {}
                _ => return Err(r),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Segments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for Segments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            writeln!(f, "{s}")?;
        }
        Ok(())
    }
}

impl From<Vec<Segment>> for Segments {
    fn from(mut v: Vec<Segment>) -> Self {
        v.sort_by_key(|s| s.phys.start);
        Self(v)
    }
}

impl IntoIterator for Segments {
    type Item = Segment;
    type IntoIter = std::vec::IntoIter<Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Segments {
    type Item = &'a Segment;
    type IntoIter = core::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn sort_supersets_first(segs: &mut [Segment]) {
    segs.sort_by(|a, b| {
        a.phys
            .start
            .cmp(&b.phys.start)
            .then(b.phys.size.cmp(&a.phys.size))
    });
}

/// Brings `segs` into the shape `kexec_load` demands: page-aligned,
/// page-sized and pairwise disjoint.
///
/// Segments whose physical ranges overlap are merged if they agree on the
/// shared bytes. Segments that only end up on a common page after alignment
/// are concatenated with zeros in between. Applying this to its own output
/// changes nothing.
pub fn align_and_merge(segs: Segments) -> Result<Segments> {
    let mut segs = segs.0;
    sort_supersets_first(&mut segs);

    let mut merged: Vec<Segment> = Vec::with_capacity(segs.len());
    for seg in segs {
        if let Some(last) = merged.last_mut() {
            if last.phys.overlaps(seg.phys) {
                last.try_merge(&seg)?;
                continue;
            }
            if seg.clone_phys_aligned_start().overlaps(last.phys) {
                last.absorb(&seg)?;
                continue;
            }
        }
        merged.push(seg.align_phys_start());
    }

    for s in &mut merged {
        let len = s.data().len();
        s.buf.truncate(len);
        s.phys.size = align_up_page(s.phys.size);
    }
    Ok(Segments(merged))
}

impl Segment {
    fn clone_phys_aligned_start(&self) -> Range {
        let start = align_down_page(self.phys.start);
        Range::from_interval(start, self.phys.end())
    }
}

/// Collapses overlapping segments into one another. The result is sorted
/// and pairwise disjoint.
///
/// Supersets sort first, so a segment contained in another is folded into
/// it. The output stays sorted and disjoint, so only its last entry can
/// reach a later segment, however far earlier merges grew it.
pub fn dedup(segs: Segments) -> Result<Segments> {
    let mut segs = segs.0;
    sort_supersets_first(&mut segs);

    let mut out: Vec<Segment> = Vec::with_capacity(segs.len());
    for seg in segs {
        if let Some(last) = out.last_mut() {
            if last.try_merge(&seg)? {
                continue;
            }
        }
        out.push(seg);
    }
    Ok(Segments(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::PAGE_SIZE;

    fn seg(data: &[u8], start: u64) -> Segment {
        Segment::new(data.to_vec(), Range::new(start, data.len() as u64))
    }

    #[test]
    fn align_phys_pads_buffer() {
        let s = seg(b"abc", 0x1010).align_phys();
        assert_eq!(s.phys(), Range::new(0x1000, PAGE_SIZE));
        assert_eq!(s.buf().len(), 0x13);
        assert_eq!(&s.buf()[0x10..], b"abc");
        assert!(s.buf()[..0x10].iter().all(|&b| b == 0));

        let z = Segment::zeroed(Range::new(0x2800, 0x1000)).align_phys();
        assert_eq!(z.phys(), Range::new(0x2000, 0x2000));
        assert!(z.buf().is_empty());
    }

    #[test]
    fn try_merge_disjoint_is_noop() {
        let mut a = seg(b"aaaa", 0);
        assert!(!a.try_merge(&seg(b"bbbb", 4)).unwrap());
        assert_eq!(a, seg(b"aaaa", 0));
    }

    #[test]
    fn try_merge_matching_overlap() {
        let mut a = seg(b"hello wor", 0x100);
        assert!(a.try_merge(&seg(b"world!", 0x106)).unwrap());
        assert_eq!(a, seg(b"hello world!", 0x100));

        // Argument starting first.
        let mut b = seg(b"world!", 0x106);
        assert!(b.try_merge(&seg(b"hello wor", 0x100)).unwrap());
        assert_eq!(b, seg(b"hello world!", 0x100));
    }

    #[test]
    fn try_merge_conflict() {
        let mut a = seg(b"hello", 0x100);
        let err = a.try_merge(&seg(b"LOW", 0x103)).unwrap_err();
        assert!(matches!(err, Error::ContentConflict { at: 0x103, .. }));
        assert_eq!(a, seg(b"hello", 0x100));
    }

    #[test]
    fn try_merge_zero_fill_must_agree() {
        // The first segment zero fills [0x104, 0x110).
        let mut a = Segment::new(b"abcd".to_vec(), Range::new(0x100, 0x10));
        assert!(a.try_merge(&seg(&[0, 0], 0x108)).unwrap());
        let err = a.try_merge(&seg(b"x", 0x10c)).unwrap_err();
        assert!(matches!(err, Error::ContentConflict { at: 0x10c, .. }));
    }

    #[test]
    fn align_and_merge_collapses_one_page() {
        let segs = Segments::from(vec![
            seg(b"AAAAA", 0),
            seg(b"BBBBB", 10),
            seg(b"CCCC", 15),
            seg(b"DD", 0x1000),
        ]);
        let out = align_and_merge(segs).unwrap();
        assert_eq!(out.len(), 2);

        let first = &out.iter().collect::<Vec<_>>()[0];
        assert_eq!(first.phys(), Range::new(0, PAGE_SIZE));
        let mut want = b"AAAAA".to_vec();
        want.extend_from_slice(&[0; 5]);
        want.extend_from_slice(b"BBBBBCCCC");
        assert_eq!(first.buf(), want.as_slice());

        let second = &out.iter().collect::<Vec<_>>()[1];
        assert_eq!(second.phys(), Range::new(0x1000, PAGE_SIZE));
        assert_eq!(second.buf(), b"DD");
    }

    #[test]
    fn align_and_merge_idempotent_and_byte_preserving() {
        let input = Segments::from(vec![
            seg(b"xyz", 0x1ff0),
            seg(b"0123456789", 0x2008),
            Segment::new(b"shared-tail".to_vec(), Range::new(0x5100, 0x2000)),
            seg(b"shared", 0x5100),
            seg(b"q", 0x9000),
        ]);
        let once = align_and_merge(input.clone()).unwrap();
        let twice = align_and_merge(once.clone()).unwrap();
        assert_eq!(once, twice);

        for s in once.iter() {
            assert_eq!(s.phys().start % PAGE_SIZE, 0);
            assert_eq!(s.phys().size % PAGE_SIZE, 0);
            assert!(s.buf().len() as u64 <= s.phys().size);
        }
        let phys = once.phys();
        for (i, a) in phys.iter().enumerate() {
            for b in &phys[i + 1..] {
                assert!(a.disjunct(*b));
            }
        }
        assert_eq!(once.is_superset_of(&input), Ok(()));
    }

    #[test]
    fn align_and_merge_rejects_conflicts() {
        let segs = Segments::from(vec![seg(b"abcd", 0x100), seg(b"xx", 0x102)]);
        assert!(matches!(
            align_and_merge(segs),
            Err(Error::ContentConflict { .. })
        ));
    }

    #[test]
    fn align_and_merge_truncates_long_buffers() {
        let s = Segment::new(vec![7; 0x20], Range::new(0x3000, 0x10));
        let out = align_and_merge(Segments::from(vec![s])).unwrap();
        let only = out.iter().next().unwrap();
        assert_eq!(only.buf(), &[7; 0x10]);
        assert_eq!(only.phys(), Range::new(0x3000, PAGE_SIZE));
    }

    #[test]
    fn dedup_folds_subsets() {
        let segs = Segments::from(vec![
            seg(b"cd", 0x102),
            seg(b"abcdef", 0x100),
            seg(b"zz", 0x200),
        ]);
        let out = dedup(segs).unwrap();
        let all: Vec<_> = out.iter().cloned().collect();
        assert_eq!(all, vec![seg(b"abcdef", 0x100), seg(b"zz", 0x200)]);
    }

    #[test]
    fn dedup_output_is_disjoint_after_growth() {
        // The middle segment bridges the other two.
        let segs = Segments::from(vec![
            seg(b"abcd", 0x100),
            seg(b"cdefgh", 0x102),
            seg(b"ghij", 0x106),
            seg(b"far", 0x300),
        ]);
        let out = dedup(segs).unwrap();
        let all: Vec<_> = out.iter().cloned().collect();
        assert_eq!(all, vec![seg(b"abcdefghij", 0x100), seg(b"far", 0x300)]);
        let phys = out.phys();
        for (i, a) in phys.iter().enumerate() {
            for b in &phys[i + 1..] {
                assert!(a.disjunct(*b));
            }
        }
    }

    #[test]
    fn large_identical_overlap_merges() {
        let big = vec![0x5a; 0x10_0000];
        let mut a = Segment::new(big.clone(), Range::new(0x10_0000, 0x10_0000));
        let b = Segment::new(big[0x1000..].to_vec(), Range::new(0x10_1000, 0xff000));
        assert!(a.try_merge(&b).unwrap());
        assert_eq!(a.buf(), big.as_slice());

        let mut changed = big[0x1000..].to_vec();
        changed[0x7000] = 0;
        let err = a
            .try_merge(&Segment::new(changed, Range::new(0x10_1000, 0xff000)))
            .unwrap_err();
        assert!(matches!(err, Error::ContentConflict { at: 0x10_8000, .. }));
    }

    #[test]
    fn mapped_buffers_load_in_place() {
        let file = Arc::new(ImageFile::from(b"mapped kernel".to_vec()));
        let s = Segment::with_buffer(Arc::clone(&file).into(), Range::new(0x20_0000, 0x1000));
        assert_eq!(s.buf().as_ptr(), file.bytes().as_ptr());

        // Padding the start has to copy.
        let moved = Segment::with_buffer(Arc::clone(&file).into(), Range::new(0x20_0010, 0x10));
        let moved = moved.align_phys();
        assert_eq!(&moved.buf()[0x10..], b"mapped kernel");
        assert_ne!(moved.buf().as_ptr(), file.bytes().as_ptr());

        let out = align_and_merge(Segments::from(vec![s])).unwrap();
        let only = out.iter().next().unwrap();
        assert_eq!(only.buf().as_ptr(), file.bytes().as_ptr());
    }

    #[test]
    fn segments_stay_sorted() {
        let mut segs = Segments::new();
        segs.insert(seg(b"b", 0x2000));
        segs.insert(seg(b"a", 0x1000));
        segs.insert(seg(b"c", 0x3000));
        let starts: Vec<_> = segs.iter().map(|s| s.phys().start).collect();
        assert_eq!(starts, vec![0x1000, 0x2000, 0x3000]);
        assert!(segs.phys_contains(0x2000));
        assert!(!segs.phys_contains(0x2001));
        assert_eq!(segs.get_phys(Range::new(0x1000, 1)), Some(b"a".to_vec()));
    }
}
