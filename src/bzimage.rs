//! x86 bzImage: the real-mode setup header and the compressed kernel that
//! follows the setup code.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use log::{debug, info, warn};

use crate::error::{Error, Result};

/// "HdrS"
pub const HEADER_MAGIC: u32 = 0x5372_6448;

pub const SETUP_HEADER_OFFSET: usize = 0x1f1;
const MAX_SETUP_HEADER_END: usize = 0x268;
const SECTOR_SIZE: usize = 512;

/// Decompressed kernels shorter than this are certainly broken.
const MIN_KERNEL_SIZE: usize = 1024;

const ELF_MAGIC: &[u8] = b"\x7fELF";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// Payload compression formats and the tools that undo them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Gzip,
    Zstd,
    Lz4,
    Bzip2,
    Lzma,
}

impl Compression {
    pub fn detect(payload: &[u8]) -> Option<Self> {
        const MAGICS: &[(&[u8], Compression)] = &[
            (ELF_MAGIC, Compression::None),
            (XZ_MAGIC, Compression::Xz),
            (&[0x1f, 0x8b], Compression::Gzip),
            (&[0x28, 0xb5, 0x2f, 0xfd], Compression::Zstd),
            (&[0x02, 0x21, 0x4c, 0x18], Compression::Lz4),
            (b"BZh", Compression::Bzip2),
            (&[0x5d, 0x00, 0x00], Compression::Lzma),
        ];
        MAGICS
            .iter()
            .find(|(magic, _)| payload.starts_with(magic))
            .map(|&(_, c)| c)
    }

    /// Command line that decompresses stdin to stdout.
    pub fn command(self) -> Option<&'static [&'static str]> {
        Some(match self {
            Self::None => return None,
            Self::Xz => &["xz", "-dc"],
            Self::Gzip => &["gzip", "-dc"],
            Self::Zstd => &["zstd", "-dcq"],
            Self::Lz4 => &["lz4", "-dc"],
            Self::Bzip2 => &["bzip2", "-dc"],
            Self::Lzma => &["xz", "--format=lzma", "-dc"],
        })
    }
}

/// Fields of the setup header this loader reads or patches, with their
/// offsets in the zero page.
pub mod offsets {
    pub const SETUP_SECTS: usize = 0x1f1;
    pub const BOOT_FLAG: usize = 0x1fe;
    pub const JUMP: usize = 0x200;
    pub const HEADER: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const INITRD_ADDR_MAX: usize = 0x22c;
    pub const RELOCATABLE_KERNEL: usize = 0x234;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const PAYLOAD_OFFSET: usize = 0x248;
    pub const PAYLOAD_LENGTH: usize = 0x24c;

    pub const EXT_RAMDISK_IMAGE: usize = 0x0c0;
    pub const EXT_RAMDISK_SIZE: usize = 0x0c4;
    pub const EXT_CMD_LINE_PTR: usize = 0x0c8;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const E820_TABLE: usize = 0x2d0;
}

pub(crate) fn le16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

pub(crate) fn le32(data: &[u8], off: usize) -> u32 {
    let mut w = [0; 4];
    w.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(w)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub boot_flag: u16,
    pub version: u16,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub cmd_line_ptr: u32,
    pub initrd_addr_max: u32,
    pub relocatable_kernel: u8,
    pub cmdline_size: u32,
    pub payload_offset: u32,
    pub payload_length: u32,
}

/// A bzImage borrowed from its file contents.
pub struct BzImage<'a> {
    data: &'a [u8],
    pub header: SetupHeader,
    header_end: usize,
}

impl<'a> BzImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        use offsets::*;

        if data.len() < MAX_SETUP_HEADER_END {
            return Err(Error::BzImage(format!("{} bytes is too short", data.len())));
        }
        let magic = le32(data, HEADER);
        if magic != HEADER_MAGIC {
            return Err(Error::BadMagic {
                expected: HEADER_MAGIC as u64,
                found: magic as u64,
            });
        }
        let header = SetupHeader {
            setup_sects: data[SETUP_SECTS],
            boot_flag: le16(data, BOOT_FLAG),
            version: le16(data, VERSION),
            type_of_loader: data[TYPE_OF_LOADER],
            loadflags: data[LOADFLAGS],
            ramdisk_image: le32(data, RAMDISK_IMAGE),
            ramdisk_size: le32(data, RAMDISK_SIZE),
            cmd_line_ptr: le32(data, CMD_LINE_PTR),
            initrd_addr_max: le32(data, INITRD_ADDR_MAX),
            relocatable_kernel: data[RELOCATABLE_KERNEL],
            cmdline_size: le32(data, CMDLINE_SIZE),
            payload_offset: le32(data, PAYLOAD_OFFSET),
            payload_length: le32(data, PAYLOAD_LENGTH),
        };
        // The jump at 0x200 skips exactly over the header.
        let header_end = (HEADER + data[JUMP + 1] as usize).min(MAX_SETUP_HEADER_END);
        debug!("bzImage protocol {:#06x}, header ends at {header_end:#x}", header.version);
        Ok(Self {
            data,
            header,
            header_end,
        })
    }

    /// Raw bytes of the setup header as found in the image.
    pub fn setup_header(&self) -> &'a [u8] {
        &self.data[SETUP_HEADER_OFFSET..self.header_end]
    }

    /// Offset of the protected-mode code.
    pub fn kernel_offset(&self) -> usize {
        let sects = match self.header.setup_sects {
            0 => 4,
            n => n as usize,
        };
        (sects + 1) * SECTOR_SIZE
    }

    /// The compressed kernel.
    pub fn payload(&self) -> Result<&'a [u8]> {
        let code = self
            .data
            .get(self.kernel_offset()..)
            .ok_or_else(|| Error::BzImage("setup code runs past the end of the file".into()))?;
        if self.header.version < 0x0208 || self.header.payload_length == 0 {
            let at = code
                .windows(XZ_MAGIC.len())
                .position(|w| w == XZ_MAGIC)
                .ok_or_else(|| Error::BzImage("can't find the xz header".into()))?;
            return Ok(&code[at..]);
        }
        let start = self.header.payload_offset as usize;
        let end = start + self.header.payload_length as usize;
        code.get(start..end)
            .ok_or_else(|| Error::BzImage(format!("payload [{start:#x}, {end:#x}) out of range")))
    }

    /// The decompressed kernel ELF.
    pub fn kernel(&self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let compression = Compression::detect(payload)
            .ok_or_else(|| Error::BzImage("unknown payload compression".into()))?;
        let kernel = match compression.command() {
            None => payload.to_vec(),
            Some(argv) => {
                info!("decompressing {compression:?} kernel with {}", argv[0]);
                decompress(argv, payload)?
            }
        };
        if kernel.len() < MIN_KERNEL_SIZE {
            return Err(Error::BzImage(format!(
                "decompressed kernel is only {} bytes",
                kernel.len()
            )));
        }
        Ok(kernel)
    }
}

/// Pipes `input` through `argv` and returns what it wrote.
///
/// Decompressors complain about the trailing data appended to the payload,
/// so a failed exit status with output is only a warning.
pub fn decompress(argv: &[&str], input: &[u8]) -> Result<Vec<u8>> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::BzImage("empty decompressor command".into()));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(Error::BzImage(format!("{program}: no pipes")));
    };

    let mut out = Vec::new();
    thread::scope(|s| -> Result<()> {
        // Feed and drain at once, either side may block on a full pipe.
        let feeder = s.spawn(move || stdin.write_all(input));
        stdout.read_to_end(&mut out)?;
        match feeder.join() {
            Ok(Ok(())) => {}
            // The tool may stop reading at the end of its stream.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::BzImage(format!("{program}: writer panicked"))),
        }
        Ok(())
    })?;

    let status = child.wait()?;
    if !status.success() {
        if out.is_empty() {
            return Err(Error::BzImage(format!("{program} failed: {status}")));
        }
        warn!("{program} exited with {status}, using its {} bytes of output", out.len());
    }
    Ok(out)
}
