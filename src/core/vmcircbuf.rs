//! Double-Mapped Region untuk Zero-Copy Wraparound
//!
//! One shared-memory object is mapped twice, back to back:
//! - Byte `o` and byte `o + len` are the same physical storage
//! - Any window of up to `len` bytes starting in `[0, len)` is contiguous
//! - Writes through the low half are immediately visible through the high half
//!
//! ```text
//!  base                 base + len              base + 2*len
//!   ├─────── view A ──────┼─────── view B ──────┤
//!   └──────── same pages (memfd / shm object) ───┘
//! ```

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use tracing::{debug, warn};

use crate::config::AllocatorConfig;
use crate::error::{BufferError, Result};

/// A region of `len` bytes visible twice at `base` and `base + len`.
pub struct MirroredRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory owned by this value; callers
// coordinate access through the buffer's index protocol.
unsafe impl Send for MirroredRegion {}
unsafe impl Sync for MirroredRegion {}

impl MirroredRegion {
    /// Maps `len` bytes twice contiguously.
    ///
    /// `len` must be a non-zero multiple of `config.granularity`. Failed
    /// placements are retried up to `config.max_attempts` times.
    pub fn allocate(config: &AllocatorConfig, len: usize) -> Result<Self> {
        config.validate()?;
        if len == 0 || len % config.granularity != 0 {
            return Err(BufferError::Allocation {
                attempts: 0,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "length {} is not a non-zero multiple of granularity {}",
                        len, config.granularity
                    ),
                ),
            });
        }
        if len.checked_mul(2).is_none() || libc::off_t::try_from(len).is_err() {
            return Err(BufferError::CapacityOverflow {
                items: len,
                item_size: 1,
            });
        }

        let attempts = config.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match map_mirrored(len) {
                Ok(base) => {
                    debug!(len, attempt, addr = ?base, "mapped mirrored region");
                    return Ok(Self { base, len });
                }
                Err(e) => {
                    warn!(len, attempt, attempts, error = %e, "mirrored mapping failed");
                    last_err = Some(e);
                }
            }
        }

        Err(BufferError::Allocation {
            attempts,
            source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)),
        })
    }

    /// Length of one view in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start of the low view. The mapping spans `2 * len()` bytes from here.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Bounds-checked byte window `[offset, offset + len)` of the doubled
    /// range.
    ///
    /// # Panics
    /// If `offset >= self.len()` or `len > self.len()`.
    ///
    /// # Safety
    /// The caller must guarantee no other live reference covers the same
    /// physical bytes (remember both views alias) for the returned lifetime.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn window_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset < self.len && len <= self.len,
            "window [{offset}, +{len}) outside mirrored region of {} bytes",
            self.len
        );
        std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len)
    }

    /// Bounds-checked read-only byte window.
    ///
    /// # Panics
    /// If `offset >= self.len()` or `len > self.len()`.
    ///
    /// # Safety
    /// No mutable reference may cover the same physical bytes while the
    /// returned slice is alive.
    #[inline(always)]
    pub unsafe fn window(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset < self.len && len <= self.len,
            "window [{offset}, +{len}) outside mirrored region of {} bytes",
            self.len
        );
        std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
    }
}

impl Drop for MirroredRegion {
    fn drop(&mut self) {
        // One munmap over the whole range releases both views.
        // SAFETY: base/2*len is exactly what map_mirrored reserved
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len * 2) };
        if rc != 0 {
            warn!(len = self.len, error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}

impl std::fmt::Debug for MirroredRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirroredRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

fn last_error<T>() -> io::Result<T> {
    Err(io::Error::last_os_error())
}

/// Anonymous shared-memory object of `len` bytes.
#[cfg(target_os = "linux")]
fn shared_object(len: usize) -> io::Result<OwnedFd> {
    // SAFETY: name is a valid NUL-terminated string
    let fd = unsafe { libc::memfd_create(b"flowbuf\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return last_error();
    }
    // SAFETY: fd is freshly created and owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    truncate(&fd, len)?;
    Ok(fd)
}

/// Anonymous shared-memory object of `len` bytes.
///
/// Named `shm_open` objects are unlinked right away; a name collision is
/// reported as `AlreadyExists` so the caller can retry with a fresh name.
#[cfg(all(unix, not(target_os = "linux")))]
fn shared_object(len: usize) -> io::Result<OwnedFd> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let name = format!(
        "/flowbuf-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: name is a valid C string
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        )
    };
    if fd < 0 {
        return last_error();
    }
    // SAFETY: fd is freshly created and owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: name is valid; the open descriptor keeps the object alive
    unsafe { libc::shm_unlink(name.as_ptr()) };
    truncate(&fd, len)?;
    Ok(fd)
}

fn truncate(fd: &OwnedFd, len: usize) -> io::Result<()> {
    let size = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds off_t"))?;
    // SAFETY: fd is a valid open descriptor
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
        return last_error();
    }
    Ok(())
}

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

#[cfg(all(unix, not(target_os = "linux")))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

fn map_mirrored(len: usize) -> io::Result<NonNull<u8>> {
    let fd = shared_object(len)?;

    // Reserve the whole doubled range first so nothing else can land between
    // the two views.
    // SAFETY: anonymous PROT_NONE mapping, no aliasing concerns
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len * 2,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return last_error();
    }

    for half in 0..2 {
        // SAFETY: target lies inside our own reservation; MAP_FIXED replaces it
        let view = unsafe {
            libc::mmap(
                base.cast::<u8>().add(half * len).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            )
        };
        if view == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: releasing our own reservation
            unsafe { libc::munmap(base, len * 2) };
            return Err(err);
        }
    }

    // The descriptor can go; both views keep the object alive.
    drop(fd);

    NonNull::new(base.cast::<u8>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}
