use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::{debug, warn};

use crate::error::Result;
use crate::sys;

/// The contents of a kernel, initrd or device tree file.
///
/// Regular files are mapped read-only; anything that can't be mapped (pipes,
/// empty files, filesystems without mmap) is read into memory instead.
/// Segments share a mapped file through an `Arc` and load straight from the
/// mapping.
#[derive(Debug)]
pub enum ImageFile {
    Mapped { ptr: *const u8, len: usize },
    Buffered(Vec<u8>),
}

// SAFETY: the mapping is private and read-only, nothing writes through `ptr`.
unsafe impl Send for ImageFile {}
unsafe impl Sync for ImageFile {}

impl From<Vec<u8>> for ImageFile {
    fn from(buf: Vec<u8>) -> Self {
        Self::Buffered(buf)
    }
}

impl ImageFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        if meta.is_file() && meta.len() > 0 {
            let len = meta.len() as usize;
            match sys::mmap_read(file.as_raw_fd(), len) {
                Ok(ptr) => {
                    debug!("mapped {} ({len:#x} bytes)", path.display());
                    return Ok(Self::Mapped { ptr, len });
                }
                Err(e) => debug!("can't map {}: {e}, reading it", path.display()),
            }
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        debug!("read {} ({:#x} bytes)", path.display(), buf.len());
        Ok(Self::Buffered(buf))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            // SAFETY: the mapping lives until `release`, which needs `&mut self`.
            Self::Mapped { ptr, len } => unsafe { core::slice::from_raw_parts(*ptr, *len) },
            Self::Buffered(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unmaps the file, reporting what `Drop` would only log.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if let Self::Mapped { ptr, len } = core::mem::replace(self, Self::Buffered(Vec::new())) {
            // SAFETY: no borrow of `bytes()` survives a `&mut self`.
            unsafe { sys::munmap(ptr, len) }.map_err(std::io::Error::from)?;
        }
        Ok(())
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("unmapping image file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_contents() {
        let path = std::env::temp_dir().join(format!("renatus-fs-{}", std::process::id()));
        std::fs::write(&path, b"kernel bytes").unwrap();
        let f = ImageFile::open(&path).unwrap();
        assert_eq!(f.bytes(), b"kernel bytes");
        assert_eq!(f.len(), 12);
        f.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_file_is_buffered() {
        let path = std::env::temp_dir().join(format!("renatus-fs-empty-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let f = ImageFile::open(&path).unwrap();
        assert!(matches!(f, ImageFile::Buffered(_)));
        assert!(f.is_empty());
        drop(f);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file() {
        assert!(ImageFile::open("/nonexistent/renatus").is_err());
    }

    #[test]
    fn buffers_convert() {
        let f = ImageFile::from(b"dtb".to_vec());
        assert_eq!(f.bytes(), b"dtb");
        f.close().unwrap();
    }
}
