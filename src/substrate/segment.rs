// Registered shared-memory segments.
//
// On Linux the backing is a memfd so the mapping can later be handed to
// another process by file-descriptor passing; elsewhere an anonymous shared
// mapping serves the same purpose for ranks sharing an address space.

use std::io;
use std::ptr::{self, NonNull};

/// One mapped shared-memory region. Unmapped (and the descriptor closed)
/// on drop.
pub struct MemfdSegment {
    ptr: NonNull<u8>,
    len: usize,
    #[cfg(target_os = "linux")]
    fd: std::os::unix::io::RawFd,
}

unsafe impl Send for MemfdSegment {}
unsafe impl Sync for MemfdSegment {}

impl MemfdSegment {
    /// Create a mapping of `len` bytes, zero-filled.
    #[cfg(target_os = "linux")]
    pub fn create(len: usize, name: &str) -> io::Result<Self> {
        use std::ffi::CString;

        let c_name = CString::new(name).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "segment name contains NUL")
        })?;

        let fd = unsafe {
            libc::syscall(libc::SYS_memfd_create, c_name.as_ptr(), libc::MFD_CLOEXEC as u64)
                as libc::c_int
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(MemfdSegment {
            ptr: NonNull::new(ptr as *mut u8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping")
            })?,
            len,
            fd,
        })
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn create(len: usize, _name: &str) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MemfdSegment {
            ptr: NonNull::new(ptr as *mut u8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping")
            })?,
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemfdSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            #[cfg(target_os = "linux")]
            libc::close(self.fd);
        }
    }
}
