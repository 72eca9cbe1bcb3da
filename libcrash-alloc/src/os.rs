// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thin wrappers over the platform's page mapping primitives.
//!
//! Mapping and unmapping pages does not go through the C heap, so these are
//! usable from a signal handler even when `malloc` is holding its lock.

use crate::AllocError;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the system page size. The value is queried once and cached, so
/// later calls (including ones made while handling a fault) are a single
/// atomic load.
pub fn page_size() -> Result<usize, AllocError> {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return Ok(cached);
    }
    let size = imp::query_page_size()?;
    PAGE_SIZE.store(size, Ordering::Relaxed);
    Ok(size)
}

/// Rounds `len` up to a whole number of pages. Zero is rejected.
pub fn round_to_pages(len: usize) -> Result<usize, AllocError> {
    if len == 0 {
        return Err(AllocError);
    }
    pad_to_pow2(len, page_size()?).ok_or(AllocError)
}

/// Maps `len` bytes of zeroed, read-write memory. `len` must already be a
/// multiple of the page size.
pub fn map_pages(len: usize) -> Result<NonNull<u8>, AllocError> {
    if len == 0 {
        return Err(AllocError);
    }
    imp::map(len)
}

/// Returns a mapping obtained from [map_pages].
///
/// # Safety
/// `ptr` and `len` must describe exactly one live mapping returned by
/// [map_pages], and nothing may reference that memory afterwards.
pub unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) {
    imp::unmap(ptr, len)
}

#[cfg_attr(debug_assertions, track_caller)]
#[inline]
fn pad_to_pow2(num: usize, pow2: usize) -> Option<usize> {
    debug_assert!(pow2.is_power_of_two());

    // Powers of two have a single bit set, so `num & (pow2 - 1)` is the same
    // as `num % pow2`.
    let bytes = num.max(pow2);
    let remainder = bytes & (pow2 - 1);
    match remainder {
        0 => Some(bytes),
        // The remainder is less than the divisor, so this cannot underflow.
        _ => bytes.checked_add(pow2 - remainder),
    }
}

macro_rules! validate_page_size {
    ($x:expr) => {
        // On some platforms this may be unsigned or signed.
        #[allow(unused_comparisons)]
        if $x < 0 {
            Err(AllocError)
        } else {
            let size = $x as usize;
            if !size.is_power_of_two() {
                Err(AllocError)
            } else {
                Ok(size)
            }
        }
    };
}

#[cfg(unix)]
mod imp {
    use crate::AllocError;
    use core::ptr::{self, NonNull};

    pub(super) fn query_page_size() -> Result<usize, AllocError> {
        // SAFETY: calling sysconf with correct arguments.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        validate_page_size!(result)
    }

    pub(super) fn map(len: usize) -> Result<NonNull<u8>, AllocError> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        // SAFETY: these args create a new anonymous mapping, akin to malloc.
        let result = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if result == libc::MAP_FAILED {
            return Err(AllocError);
        }
        NonNull::new(result.cast::<u8>()).ok_or(AllocError)
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        // SAFETY: upheld by the caller of `unmap_pages`.
        _ = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    }
}

#[cfg(windows)]
mod imp {
    use crate::AllocError;
    use core::{mem, ptr::NonNull};
    use windows_sys::Win32::System::Memory;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub(super) fn query_page_size() -> Result<usize, AllocError> {
        let mut system_info = mem::MaybeUninit::<SYSTEM_INFO>::uninit();
        // SAFETY: calling C function with correct uninit repr.
        unsafe { GetSystemInfo(system_info.as_mut_ptr()) };
        // SAFETY: GetSystemInfo is not documented to fail.
        let system_info = unsafe { system_info.assume_init() };
        validate_page_size!(system_info.dwPageSize)
    }

    pub(super) fn map(len: usize) -> Result<NonNull<u8>, AllocError> {
        let alloc_type = Memory::MEM_COMMIT | Memory::MEM_RESERVE;
        // SAFETY: these args create a new allocation, akin to malloc.
        let result = unsafe {
            Memory::VirtualAlloc(core::ptr::null(), len, alloc_type, Memory::PAGE_READWRITE)
        };
        NonNull::new(result.cast::<u8>()).ok_or(AllocError)
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, _len: usize) {
        _ = Memory::VirtualFree(ptr.as_ptr().cast(), 0, Memory::MEM_RELEASE);
    }
}
