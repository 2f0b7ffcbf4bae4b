//! POSIX shared-memory regions.
//!
//! The controller creates a named region (`shm_open` + `mmap`); the worker
//! opens the same name. The creating side unlinks the name on drop, which
//! leaves existing mappings intact until every process unmaps.

use std::ffi::CString;
use std::io;

use super::ShmError;

/// A memory-mapped shared region, created or opened by name.
pub struct SharedRegion {
    base: *mut u8,
    len: usize,
    name: CString,
    owner: bool,
}

// The raw base pointer refers to a mapping private to this process; all
// cross-process coordination inside the region goes through atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new region of `len` bytes. Fails if the name already exists.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        let cname = CString::new(name).map_err(|_| ShmError::Os(invalid_name(name)))?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(ShmError::Os(io::Error::last_os_error()));
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(ShmError::Os(err));
        }
        let base = map(fd, len);
        unsafe { libc::close(fd) };
        match base {
            Ok(base) => Ok(Self {
                base,
                len,
                name: cname,
                owner: true,
            }),
            Err(err) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(ShmError::Os(err))
            }
        }
    }

    /// Open an existing region by name and map its full length.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let cname = CString::new(name).map_err(|_| ShmError::Os(invalid_name(name)))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::Os(io::Error::last_os_error()));
        }
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::Os(err));
        }
        let len = unsafe { stat.assume_init() }.st_size as usize;
        let base = map(fd, len);
        unsafe { libc::close(fd) };
        Ok(Self {
            base: base.map_err(ShmError::Os)?,
            len,
            name: cname,
            owner: false,
        })
    }

    /// Base pointer of the mapping.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a created region).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The region name as given to `shm_open`.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

fn map(fd: libc::c_int, len: usize) -> Result<*mut u8, io::Error> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(base as *mut u8)
    }
}

fn invalid_name(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid region name: {name:?}"),
    )
}
