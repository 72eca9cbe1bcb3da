// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(windows)]

use super::crash_handler::{current_mode, handle_ucontext, PipelineMode};
use super::signals::{EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP};
use super::ucontext::Ucontext;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use tracing::debug;
use windows_sys::Win32::System::Diagnostics::Debug::{
    SetErrorMode, SetUnhandledExceptionFilter, EXCEPTION_POINTERS, LPTOP_LEVEL_EXCEPTION_FILTER,
    SEM_FAILCRITICALERRORS,
};

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

type ExceptionFilter = unsafe extern "system" fn(*const EXCEPTION_POINTERS) -> i32;

static INSTALLED: AtomicBool = AtomicBool::new(false);
// The filter that was registered before ours, as an address, 0 for none.
static PREVIOUS_FILTER: AtomicUsize = AtomicUsize::new(0);

fn previous_filter() -> LPTOP_LEVEL_EXCEPTION_FILTER {
    match PREVIOUS_FILTER.load(SeqCst) {
        0 => None,
        // SAFETY: only ever stored from a valid filter in
        // `install_exception_filter`.
        addr => Some(unsafe { std::mem::transmute::<usize, ExceptionFilter>(addr) }),
    }
}

/// Registers the process-wide unhandled exception filter, remembering the one
/// it replaces. Returns false if it is already installed.
pub fn install_exception_filter() -> bool {
    if INSTALLED.swap(true, SeqCst) {
        return false;
    }
    // SAFETY: no preconditions.
    let previous = unsafe { SetUnhandledExceptionFilter(Some(handle_exception)) };
    PREVIOUS_FILTER.store(previous.map_or(0, |f| f as usize), SeqCst);
    // Keep the OS from showing its own crash dialogs.
    // SAFETY: no preconditions.
    unsafe { SetErrorMode(SEM_FAILCRITICALERRORS) };
    debug!("Installed unhandled exception filter");
    true
}

pub fn exception_filter_installed() -> bool {
    INSTALLED.load(SeqCst)
}

/// Puts back the filter that was registered before ours, unless someone else
/// replaced ours in the meantime, in which case theirs stays. Returns false if
/// the filter was not installed.
pub fn uninstall_exception_filter() -> bool {
    if !INSTALLED.swap(false, SeqCst) {
        return false;
    }
    // SAFETY: no preconditions.
    let current = unsafe { SetUnhandledExceptionFilter(previous_filter()) };
    if current.map(|f| f as usize) != Some(handle_exception as usize) {
        // SAFETY: no preconditions.
        unsafe { SetUnhandledExceptionFilter(current) };
        debug!("Exception filter was replaced after startup, leaving it in place");
    }
    PREVIOUS_FILTER.store(0, SeqCst);
    true
}

unsafe extern "system" fn handle_exception(exception_pointers: *const EXCEPTION_POINTERS) -> i32 {
    let uctx = Ucontext { exception_pointers };
    let code = uctx.signal_number();
    if code == EXCEPTION_BREAKPOINT || code == EXCEPTION_SINGLE_STEP {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    handle_ucontext(&uctx);

    if current_mode() == Some(PipelineMode::Handoff) {
        if let Some(previous) = previous_filter() {
            return previous(exception_pointers);
        }
    }
    EXCEPTION_CONTINUE_SEARCH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::global_state_lock;

    #[test]
    fn test_install_and_uninstall() {
        let _guard = global_state_lock();
        assert!(install_exception_filter());
        assert!(!install_exception_filter());
        assert!(uninstall_exception_filter());
        assert!(!uninstall_exception_filter());
    }

    #[test]
    fn test_breakpoints_are_not_captured() {
        let _guard = global_state_lock();
        let mut record: windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_RECORD =
            unsafe { std::mem::zeroed() };
        record.ExceptionCode = EXCEPTION_BREAKPOINT as i32;
        let pointers = EXCEPTION_POINTERS {
            ExceptionRecord: &mut record,
            ContextRecord: std::ptr::null_mut(),
        };
        assert_eq!(EXCEPTION_CONTINUE_SEARCH, unsafe {
            handle_exception(&pointers)
        });
    }
}
