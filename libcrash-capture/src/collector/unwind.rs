// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::ucontext::Ucontext;

/// Walks the stack of a faulting context.
pub trait Unwinder {
    /// Writes the instruction addresses of the faulting stack into `frames`,
    /// innermost first, and returns how many were written. Never writes past
    /// the end of `frames`.
    fn unwind(&self, uctx: &Ucontext, frames: &mut [usize]) -> usize;
}

/// Unwinds with [backtrace::trace_unsynchronized], starting at the frame that
/// faulted.
///
/// SIGNAL SAFETY:
///     Getting a backtrace on rust is not guaranteed to be signal safe.
///     https://github.com/rust-lang/backtrace-rs/issues/414
///     Only instruction pointers are collected. Symbols are never resolved on
///     the fault path.
#[derive(Debug, Default, Copy, Clone)]
pub struct BacktraceUnwinder;

impl Unwinder for BacktraceUnwinder {
    fn unwind(&self, uctx: &Ucontext, frames: &mut [usize]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let fault_ip = uctx.fault_ip();
        let mut count = 0;
        let mut ip_found = fault_ip.is_none();
        loop {
            // SAFETY: no other thread is unwinding while the crash handler
            // runs, the reentrancy guard is held.
            unsafe {
                backtrace::trace_unsynchronized(|frame| {
                    // Frames above the faulting instruction belong to the crash
                    // handler and the unwinder itself.
                    let ip = frame.ip() as usize;
                    if Some(ip) == fault_ip {
                        ip_found = true;
                    }
                    if !ip_found {
                        return true;
                    }
                    frames[count] = ip;
                    count += 1;
                    count < frames.len()
                })
            };
            if ip_found {
                break;
            }
            // Record everything, if the crashing frame is not found for some
            // reason.
            ip_found = true;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn context() -> Ucontext {
        Ucontext::from_signal(libc::SIGABRT)
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_unwinds_current_stack() {
        let mut frames = [0usize; 64];
        let count = BacktraceUnwinder.unwind(&context(), &mut frames);
        assert!(count > 0);
        assert!(frames[..count].iter().all(|ip| *ip != 0));
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn test_respects_frame_limit() {
        let mut frames = [0usize; 2];
        let count = BacktraceUnwinder.unwind(&context(), &mut frames);
        assert!(count <= 2);
        let mut none: [usize; 0] = [];
        assert_eq!(0, BacktraceUnwinder.unwind(&context(), &mut none));
    }
}
