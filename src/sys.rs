//! The few raw Linux syscalls this crate issues itself.

use core::fmt;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod nr {
    pub const MMAP: usize = 9;
    pub const MUNMAP: usize = 11;
    pub const KEXEC_LOAD: usize = 246;
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod nr {
    pub const MUNMAP: usize = 215;
    pub const MMAP: usize = 222;
    pub const KEXEC_LOAD: usize = 104;
}

pub const PROT_READ: usize = 1;
pub const MAP_PRIVATE: usize = 2;

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
const ENOSYS: i32 = 38;

/// A negated syscall return value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl From<Errno> for std::io::Error {
    fn from(e: Errno) -> Self {
        Self::from_raw_os_error(e.0)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(always)]
unsafe fn syscall6(n: usize, a: [usize; 6]) -> isize {
    let ret: isize;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") n as isize => ret,
            in("rdi") a[0],
            in("rsi") a[1],
            in("rdx") a[2],
            in("r10") a[3],
            in("r8") a[4],
            in("r9") a[5],
            lateout("rcx") _, // clobbered by SYSCALL
            lateout("r11") _,
            options(nostack)
        );
    }
    ret
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[inline(always)]
unsafe fn syscall6(n: usize, a: [usize; 6]) -> isize {
    let ret: isize;
    unsafe {
        core::arch::asm!(
            "svc 0",
            in("x8") n,
            inlateout("x0") a[0] as isize => ret,
            in("x1") a[1],
            in("x2") a[2],
            in("x3") a[3],
            in("x4") a[4],
            in("x5") a[5],
            options(nostack)
        );
    }
    ret
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn check(ret: isize) -> Result<usize, Errno> {
    // The kernel reports errors as -4095..=-1.
    if (-4095..0).contains(&ret) {
        Err(Errno(-ret as i32))
    } else {
        Ok(ret as usize)
    }
}

/// # Safety
///
/// `segments` must point at `count` valid `kexec_segment` structures whose
/// buffers stay alive for the duration of the call.
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub unsafe fn kexec_load(
    entry: u64,
    count: usize,
    segments: *const u8,
    flags: usize,
) -> Result<(), Errno> {
    let ret = unsafe {
        syscall6(
            nr::KEXEC_LOAD,
            [entry as usize, count, segments as usize, flags, 0, 0],
        )
    };
    check(ret).map(|_| ())
}

/// Maps `len` bytes of `fd` read-only and private.
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub fn mmap_read(fd: i32, len: usize) -> Result<*const u8, Errno> {
    let ret = unsafe {
        syscall6(
            nr::MMAP,
            [0, len, PROT_READ, MAP_PRIVATE, fd as usize, 0],
        )
    };
    check(ret).map(|addr| addr as *const u8)
}

/// # Safety
///
/// `[addr, addr+len)` must be a mapping returned by [`mmap_read`] that
/// nothing references any more.
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub unsafe fn munmap(addr: *const u8, len: usize) -> Result<(), Errno> {
    let ret = unsafe { syscall6(nr::MUNMAP, [addr as usize, len, 0, 0, 0, 0]) };
    check(ret).map(|_| ())
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub unsafe fn kexec_load(
    _entry: u64,
    _count: usize,
    _segments: *const u8,
    _flags: usize,
) -> Result<(), Errno> {
    Err(Errno(ENOSYS))
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub fn mmap_read(_fd: i32, _len: usize) -> Result<*const u8, Errno> {
    Err(Errno(ENOSYS))
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub unsafe fn munmap(_addr: *const u8, _len: usize) -> Result<(), Errno> {
    Err(Errno(ENOSYS))
}
