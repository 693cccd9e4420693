//! Shared-memory regions backed by client descriptors.
//!
//! A [`Memory`] owns the descriptor and a `MAP_SHARED` read/write mapping of
//! the declared size. Both are released in `Drop`, exactly once.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use super::StoreError;

/// A mapped shared-memory region.
pub struct Memory {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is process-wide and only touched through bounds-checked
// copies. Access is serialized by the store's mutex.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    /// Validate `fd` and map `size` bytes of it.
    ///
    /// The descriptor must be a regular file (memfd, shm or tmpfile) at least
    /// `size` bytes long. `ENOMEM` from `mmap` is reported as out-of-memory;
    /// every other failure is an invalid request.
    pub fn map(fd: OwnedFd, size: u64) -> Result<Self, StoreError> {
        if size == 0 {
            return Err(StoreError::invalid("memory size must be non-zero"));
        }
        let len = usize::try_from(size)
            .map_err(|e| StoreError::invalid(format!("memory size {size}: {e}")))?;

        validate_backing(fd.as_raw_fd(), size)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM) => StoreError::OutOfMemory(format!("mmap {size} bytes: {err}")),
                _ => StoreError::invalid(format!("mmap {size} bytes: {err}")),
            });
        }
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(StoreError::invalid("mmap returned null"));
        };

        log::debug!("[store] mapped {size} bytes from fd {}", fd.as_raw_fd());
        Ok(Self { fd, ptr, size: len })
    }

    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// Underlying descriptor (for diagnostics).
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let start = self.check_range(offset, buf.len())?;
        // SAFETY: range checked against the mapping length above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let start = self.check_range(offset, data.len())?;
        // SAFETY: range checked against the mapping length above. The client
        // may write concurrently; the mapping stays valid until drop.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(start), data.len());
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize, StoreError> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size as u64 => Ok(offset as usize),
            _ => Err(StoreError::invalid(format!(
                "range {offset}+{len} outside memory of {} bytes",
                self.size
            ))),
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) };
        if rc != 0 {
            log::warn!(
                "[store] munmap of {} bytes failed: {}",
                self.size,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Reject descriptors that are not regular files or are shorter than `size`.
fn validate_backing(fd: RawFd, size: u64) -> Result<(), StoreError> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(StoreError::invalid(format!("fstat: {err}")));
    }
    // SAFETY: fstat succeeded and initialised the struct.
    let st = unsafe { st.assume_init() };

    if st.st_mode & libc::S_IFMT != libc::S_IFREG {
        return Err(StoreError::invalid("memory descriptor is not a regular file"));
    }
    if (st.st_size as u64) < size {
        return Err(StoreError::invalid(format!(
            "backing file is {} bytes, declared {size}",
            st.st_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn backing(len: u64) -> OwnedFd {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn test_map_write_read() {
        let mem = Memory::map(backing(4096), 4096).unwrap();
        mem.write(100, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read(100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(mem.size(), 4096);
    }

    #[test]
    fn test_writes_are_visible_through_the_file() {
        use std::io::{Read, Seek, SeekFrom};

        let file = tempfile::tempfile().unwrap();
        file.set_len(64).unwrap();
        let mut reader = file.try_clone().unwrap();
        let mem = Memory::map(OwnedFd::from(file), 64).unwrap();
        mem.write(8, b"shared").unwrap();

        let mut out = [0u8; 6];
        reader.seek(SeekFrom::Start(8)).unwrap();
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"shared");
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = Memory::map(backing(16), 0).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn test_short_backing_rejected() {
        let err = Memory::map(backing(100), 4096).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn test_pipe_rejected() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, _w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let err = Memory::map(r, 16).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let mem = Memory::map(backing(32), 32).unwrap();
        assert!(mem.write(30, &[0; 4]).is_err());
        assert!(mem.read(u64::MAX, &mut [0; 1]).is_err());
        assert!(mem.write(28, &[0; 4]).is_ok());
    }
}
