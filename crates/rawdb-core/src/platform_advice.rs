//! Best-effort OS page cache hints
//!
//! Data file reads go straight into page regions, so letting the kernel keep
//! its own copy only doubles memory use. These hints are capability-gated:
//! where `posix_fadvise` does not exist every call is a no-op returning `Ok`.

use std::fs::File;
use std::io;

/// Expected access pattern for a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// No particular pattern
    Normal,
    /// Whole-file scans such as preload
    Sequential,
    /// Page-at-a-time lookups
    Random,
}

/// True when this platform honors the hints below.
pub const fn advice_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "android"))
}

/// Tell the OS how the file will be read.
pub fn set_read_mode(file: &File, mode: ReadMode) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let advice = match mode {
            ReadMode::Normal => libc::POSIX_FADV_NORMAL,
            ReadMode::Sequential => libc::POSIX_FADV_SEQUENTIAL,
            ReadMode::Random => libc::POSIX_FADV_RANDOM,
        };
        fadvise(file, 0, 0, advice)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (file, mode);
        Ok(())
    }
}

/// Ask the OS to drop `len` bytes at `offset` from its page cache.
pub fn drop_behind(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        fadvise(file, offset, len, libc::POSIX_FADV_DONTNEED)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (file, offset, len);
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fadvise(file: &File, offset: u64, len: u64, advice: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor comes from a live `File`; fadvise never touches user memory.
    let result = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        )
    };
    // posix_fadvise returns the error number instead of setting errno.
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hints_never_fail_on_regular_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 8192]).unwrap();

        assert!(set_read_mode(file.as_file(), ReadMode::Sequential).is_ok());
        assert!(set_read_mode(file.as_file(), ReadMode::Random).is_ok());
        assert!(drop_behind(file.as_file(), 0, 4096).is_ok());
    }
}
