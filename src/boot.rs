//! Turning a kernel, initrd and command line into a loadable boot image.

pub mod arm64;
pub mod x86_64;

use core::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use log::{info, warn};

use crate::config::{Arch, KexecConfig, MemoryMapSource};
use crate::error::Result;
use crate::fdt::Fdt;
use crate::fs::ImageFile;
use crate::kexec;
use crate::memmap;
use crate::memory::Memory;
use crate::purgatory;
use crate::range::MemoryMap;
use crate::segment::Segments;

/// The files that make up a Linux boot. Segments load the kernel and initrd
/// straight from these, so they are shared rather than copied.
#[derive(Clone, Debug)]
pub struct LinuxImage {
    pub kernel: Arc<ImageFile>,
    pub initrd: Option<Arc<ImageFile>>,
    pub cmdline: String,
}

impl LinuxImage {
    pub fn new(kernel: impl Into<ImageFile>, cmdline: impl Into<String>) -> Self {
        Self {
            kernel: Arc::new(kernel.into()),
            initrd: None,
            cmdline: cmdline.into(),
        }
    }

    #[must_use]
    pub fn with_initrd(mut self, initrd: impl Into<ImageFile>) -> Self {
        self.initrd = Some(Arc::new(initrd.into()));
        self
    }
}

/// A fully planned boot: where to jump, what to place where, and the files
/// the segments still read from.
#[derive(Debug)]
pub struct BootImage {
    pub entry: u64,
    pub segments: Segments,
    cleanup: Vec<Arc<ImageFile>>,
}

/// Unmaps every file nothing else shares any more. Files a segment still
/// reads from are unmapped when the last segment goes away.
fn release(cleanup: Vec<Arc<ImageFile>>) -> Result<()> {
    let mut first = None;
    for f in cleanup {
        if let Ok(f) = Arc::try_unwrap(f) {
            if let Err(e) = f.close() {
                first.get_or_insert(e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}

impl BootImage {
    pub fn new(entry: u64, segments: Segments) -> Self {
        Self {
            entry,
            segments,
            cleanup: Vec::new(),
        }
    }

    /// What a pipeline hands back: `mem`'s segments, holding on to the
    /// files of `image`.
    fn planned(entry: u64, mem: Memory, image: LinuxImage) -> Self {
        let mut boot = Self::new(entry, mem.into_segments());
        boot.hold(image.kernel);
        if let Some(initrd) = image.initrd {
            boot.hold(initrd);
        }
        boot
    }

    /// Keeps `file` open until the image is closed or loaded.
    pub fn hold(&mut self, file: impl Into<Arc<ImageFile>>) {
        self.cleanup.push(file.into());
    }

    /// Number of files the image holds.
    pub fn held(&self) -> usize {
        self.cleanup.len()
    }

    /// Drops the segments and releases every file the image holds.
    pub fn close(self) -> Result<()> {
        let Self {
            segments, cleanup, ..
        } = self;
        drop(segments);
        release(cleanup)
    }

    /// Hands the image to the kernel, then releases its files.
    pub fn load(self, flags: usize) -> Result<()> {
        let Self {
            entry,
            segments,
            cleanup,
        } = self;
        let loaded = kexec::load(entry, segments, flags);
        if let Err(e) = release(cleanup) {
            warn!("closing image file: {e}");
        }
        loaded
    }
}

impl fmt::Display for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entry: {:#x}", self.entry)?;
        write!(f, "{}", self.segments)
    }
}

/// Reads the memory map from `source`. The device tree variant falls back
/// to `dtb`.
pub fn read_memory_map(source: &MemoryMapSource, dtb: &Path) -> anyhow::Result<MemoryMap> {
    let path = source.path().unwrap_or(dtb);
    let mm = match source {
        MemoryMapSource::Sysfs { .. } => memmap::from_sysfs(path)?,
        MemoryMapSource::Iomem { .. } => memmap::from_iomem_file(path)?,
        MemoryMapSource::Memblock { .. } => memmap::from_memblock(path)?,
        MemoryMapSource::Fdt { .. } => {
            let blob = ImageFile::open(path)?;
            memmap::from_fdt(&Fdt::parse(blob.bytes())?)?
        }
    };
    if mm.is_empty() {
        bail!("{}: empty memory map", path.display());
    }
    Ok(mm)
}

/// Opens everything `config` names and plans the boot.
pub fn load_from_config(config: &KexecConfig) -> anyhow::Result<BootImage> {
    let kernel = ImageFile::open(config.kernel())
        .with_context(|| format!("opening kernel {}", config.kernel().display()))?;
    let mut image = LinuxImage::new(kernel, config.cmdline());
    if let Some(p) = config.initrd() {
        let initrd =
            ImageFile::open(p).with_context(|| format!("opening initrd {}", p.display()))?;
        image = image.with_initrd(initrd);
    }

    let source = config.memory_map();
    let mut mem = Memory::new(
        read_memory_map(&source, config.dtb())
            .with_context(|| format!("reading memory map from {source:?}"))?,
    );
    mem.reserve_ranges(config.reservations());
    let purgatory = purgatory::select(config.purgatory())?;

    let boot = match config.arch() {
        Arch::X86_64 => {
            let params = std::fs::read(config.boot_params()).with_context(|| {
                format!("reading boot parameters {}", config.boot_params().display())
            })?;
            x86_64::load(mem, &params, image, &purgatory)?
        }
        Arch::Arm64 => {
            let dtb = ImageFile::open(config.dtb())
                .with_context(|| format!("opening device tree {}", config.dtb().display()))?;
            let fdt = Fdt::parse(dtb.bytes())?;
            arm64::load(mem, fdt, image)?
        }
    };
    info!("planned {:?} boot, entry {:#x}", config.arch(), boot.entry);
    Ok(boot)
}
