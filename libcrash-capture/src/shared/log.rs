// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics for the fault path.
//!
//! `tracing` subscribers are free to lock and allocate, neither of which is
//! allowed while a signal handler is running. Code reachable from the
//! dispatcher reports the few conditions worth reporting through
//! [signal_safe_eprint] instead, which is a single `write(2)` to stderr.

/// Writes each part to stderr followed by a newline, without allocating.
#[cfg(unix)]
pub(crate) fn signal_safe_eprint(parts: &[&str]) {
    for part in parts.iter().chain(std::iter::once(&"\n")) {
        // SAFETY: `write` is async-signal-safe and the buffer is valid for
        // `part.len()` bytes. Short writes are not retried.
        let _ = unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
    }
}

#[cfg(windows)]
pub(crate) fn signal_safe_eprint(parts: &[&str]) {
    use std::io::Write;
    let mut stderr = std::io::stderr().lock();
    for part in parts {
        let _ = stderr.write_all(part.as_bytes());
    }
    let _ = stderr.write_all(b"\n");
}

/// Formats `value` as decimal into `buf` without allocating and returns the
/// written digits.
pub(crate) fn format_decimal(value: u64, buf: &mut [u8; 20]) -> &str {
    let mut value = value;
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    // Only ASCII digits were written.
    std::str::from_utf8(&buf[pos..]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_decimal() {
        let mut buf = [0u8; 20];
        assert_eq!("0", format_decimal(0, &mut buf));
        assert_eq!("7", format_decimal(7, &mut buf));
        assert_eq!("1700000000", format_decimal(1_700_000_000, &mut buf));
        assert_eq!("18446744073709551615", format_decimal(u64::MAX, &mut buf));
    }
}
