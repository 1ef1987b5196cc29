//! Handing the planned segments to the running kernel.

use core::marker::PhantomData;

use log::{debug, info};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::segment::{Segments, align_and_merge};
use crate::sys::{self, Errno};

pub const KEXEC_ARCH_DEFAULT: usize = 0;
pub const KEXEC_ON_CRASH: usize = 1;
pub const KEXEC_PRESERVE_CONTEXT: usize = 2;

/// One `struct kexec_segment` as the kernel reads it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RawSegment {
    buf: *const u8,
    bufsz: usize,
    mem: usize,
    memsz: usize,
}

/// The syscall's view of a set of segments.
///
/// Holds raw pointers into the buffers of the borrowed [`Segments`], so it
/// can't outlive them and they can't be changed while it exists.
pub struct KexecSegments<'a> {
    raw: Vec<RawSegment>,
    _segments: PhantomData<&'a Segments>,
}

impl<'a> KexecSegments<'a> {
    pub fn new(segments: &'a Segments) -> Self {
        let raw = segments
            .iter()
            .map(|s| {
                let phys = s.phys();
                RawSegment {
                    buf: s.buf().as_ptr(),
                    bufsz: s.buf().len(),
                    mem: phys.start as usize,
                    memsz: phys.size as usize,
                }
            })
            .collect();
        Self {
            raw,
            _segments: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn as_ptr(&self) -> *const u8 {
        self.raw.as_ptr().cast()
    }
}

/// A failed `kexec_load` together with everything it was given.
#[derive(Debug, Error)]
#[error(
    "kexec_load(entry {entry:#x}, {} segments, flags {flags:#x}): {errno}",
    .segments.len()
)]
pub struct ErrKexec {
    pub entry: u64,
    pub segments: Segments,
    pub flags: usize,
    #[source]
    pub errno: std::io::Error,
}

/// Aligns and merges `segments` and loads them for a later reboot into
/// `entry`.
pub fn load(entry: u64, segments: Segments, flags: usize) -> Result<()> {
    let segments = align_and_merge(segments)?;
    if !segments.phys_contains(entry) {
        return Err(Error::EntryNotLoaded(entry));
    }
    debug!("kexec segments:\n{segments}");

    let ret = {
        let raw = KexecSegments::new(&segments);
        // SAFETY: `raw` borrows `segments`, every buffer outlives the call.
        unsafe { sys::kexec_load(entry, raw.len(), raw.as_ptr(), flags) }
    };
    match ret {
        Ok(()) => {
            info!("loaded {} segments, entry {entry:#x}", segments.len());
            Ok(())
        }
        Err(Errno(errno)) => Err(ErrKexec {
            entry,
            segments,
            flags,
            errno: std::io::Error::from_raw_os_error(errno),
        }
        .into()),
    }
}
