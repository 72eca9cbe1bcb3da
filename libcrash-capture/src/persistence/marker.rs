// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PersistenceError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// The sentinel file telling the next startup that the previous run crashed.
///
/// Everything the fault path needs is prepared up front, so that writing the
/// marker is nothing more than `open`, `write` and `close`.
#[derive(Debug, Clone)]
pub struct CrashMarker {
    path: PathBuf,
    #[cfg(unix)]
    c_path: std::ffi::CString,
}

impl CrashMarker {
    pub fn new(path: PathBuf) -> Result<Self, PersistenceError> {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
                .map_err(|_| PersistenceError::InvalidPath(path.clone()))?;
            Ok(Self { path, c_path })
        }
        #[cfg(not(unix))]
        {
            Ok(Self { path })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current time, in seconds since the epoch, to the marker
    /// file. Returns whether the whole timestamp was written.
    ///
    /// SIGNAL SAFETY:
    ///     Only calls `time`, `open`, `write` and `close`, and does not
    ///     allocate.
    #[cfg(unix)]
    pub fn write(&self) -> bool {
        let flags = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC | libc::O_CLOEXEC;
        // SAFETY: `c_path` is a valid NUL terminated string.
        let fd = unsafe { libc::open(self.c_path.as_ptr(), flags, 0o644 as libc::c_uint) };
        if fd < 0 {
            return false;
        }
        // SAFETY: passing null asks `time` to only return the value.
        let now = unsafe { libc::time(std::ptr::null_mut()) };
        let mut buf = [0u8; 20];
        let text = crate::shared::log::format_decimal(now.max(0) as u64, &mut buf);
        // SAFETY: `fd` is open and `text` is valid for its length.
        let written = unsafe { libc::write(fd, text.as_ptr().cast(), text.len()) };
        // SAFETY: `fd` was opened above and is not used afterwards.
        unsafe { libc::close(fd) };
        written == text.len() as isize
    }

    #[cfg(not(unix))]
    pub fn write(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        fs::write(&self.path, now.to_string()).is_ok()
    }
}

/// Reads and removes the marker at `path`, returning the recorded crash time.
/// A marker without a parsable timestamp still counts as a crash.
pub(crate) fn take_marker(path: &Path) -> Result<Option<i64>, PersistenceError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    fs::remove_file(path)?;
    Ok(Some(contents.trim().parse().unwrap_or_default()))
}
