//! Platform-specific durable sync
//!
//! Data files and both transaction logs are synced through [`durable_sync`],
//! which maps to the strongest primitive each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{RawDbError, RawResult};

/// Block until everything written to `file` has reached persistent storage.
///
/// - Linux: `fdatasync()`; file metadata other than length is not needed for recovery
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain `fsync` stops at the drive cache there
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File`, so it is open for the call.
        zero_is_ok(unsafe { libc::fdatasync(file.as_raw_fd()) })
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File`, so it is open for the call.
        zero_is_ok(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) })
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File`.
        let flushed = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        // Win32 reports success as nonzero.
        zero_is_ok(if flushed != 0 { 0 } else { -1 })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Map a C-style status code to `io::Result`, reading `errno` on failure.
#[allow(dead_code)]
fn zero_is_ok(status: i32) -> io::Result<()> {
    match status {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// [`durable_sync`] with the path attached to any failure.
pub fn sync_file(file: &File, path: &Path) -> RawResult<()> {
    durable_sync(file).map_err(|e| RawDbError::io(path, e, "durable sync failed"))
}

/// Sync a directory so created, renamed or deleted entries survive a crash.
///
/// A no-op where directories cannot be opened as files.
pub fn sync_dir(dir: &Path) -> RawResult<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| RawDbError::io(dir, e, "open directory for sync"))?;
        handle
            .sync_all()
            .map_err(|e| RawDbError::io(dir, e, "directory sync failed"))
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
