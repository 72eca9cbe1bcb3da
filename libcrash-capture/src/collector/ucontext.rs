// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::signals::SignalNumber;

/// The faulting context as handed to the dispatcher by the OS. Built once per
/// fault on the dispatcher's stack and only borrowed from there on.
#[cfg(unix)]
#[derive(Debug, Copy, Clone)]
pub struct Ucontext {
    pub signum: libc::c_int,
    pub siginfo: *mut libc::siginfo_t,
    pub user_context: *mut libc::c_void,
}

#[cfg(windows)]
#[derive(Debug, Copy, Clone)]
pub struct Ucontext {
    pub exception_pointers: *const windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS,
}

#[cfg(unix)]
impl Ucontext {
    /// A context for a fault that is reported synchronously rather than
    /// delivered by the kernel, e.g. from [crate::BackendOps::except].
    pub fn from_signal(signum: libc::c_int) -> Self {
        Self {
            signum,
            siginfo: std::ptr::null_mut(),
            user_context: std::ptr::null_mut(),
        }
    }

    pub fn signal_number(&self) -> SignalNumber {
        self.signum
    }

    /// Instruction pointer at the time of the fault, if the machine context
    /// is available on this platform.
    pub fn fault_ip(&self) -> Option<usize> {
        let ucontext = self.user_context as *const libc::ucontext_t;
        if ucontext.is_null() {
            return None;
        }
        extract_ip(ucontext)
    }
}

#[cfg(windows)]
impl Ucontext {
    pub fn signal_number(&self) -> SignalNumber {
        // SAFETY: the OS hands the filter valid exception pointers.
        match unsafe { self.exception_pointers.as_ref() }
            .and_then(|pointers| unsafe { pointers.ExceptionRecord.as_ref() })
        {
            Some(record) => record.ExceptionCode as u32,
            None => 0,
        }
    }

    pub fn fault_ip(&self) -> Option<usize> {
        // SAFETY: see `signal_number`.
        unsafe { self.exception_pointers.as_ref() }
            .and_then(|pointers| unsafe { pointers.ExceptionRecord.as_ref() })
            .map(|record| record.ExceptionAddress as usize)
    }
}

#[cfg(unix)]
#[allow(unreachable_code)]
fn extract_ip(ucontext: *const libc::ucontext_t) -> Option<usize> {
    // SAFETY: the kernel passes a valid ucontext to SA_SIGINFO handlers, and
    // null was ruled out by the caller.
    unsafe {
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Some((*(*ucontext).uc_mcontext).__ss.__rip as usize);
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Some((*(*ucontext).uc_mcontext).__ss.__pc as usize);

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Some((*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize);
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Some((*ucontext).uc_mcontext.pc as usize);
    }
    let _ = ucontext;
    None
}
