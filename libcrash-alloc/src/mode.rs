// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Allocator, PageAllocator};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering::SeqCst};

static PAGE_ALLOCATOR_ENABLED: AtomicBool = AtomicBool::new(false);
static PAGE_ALLOCATOR: PageAllocator = PageAllocator::new(PageAllocator::DEFAULT_CHUNK_SIZE);

/// Routes every allocation made through [SignalSafeAlloc] to the process-wide
/// page allocator. Called on entry to a crash handler, before anything on the
/// fault path allocates.
///
/// # Atomicity
///   This function is atomic and idempotent.
pub fn enable_page_allocator() {
    PAGE_ALLOCATOR_ENABLED.store(true, SeqCst);
}

/// Routes new allocations back to the wrapped allocator. Memory handed out
/// while the page allocator was enabled stays valid forever: freeing it is a
/// no-op, and the pages themselves are never unmapped.
///
/// # Atomicity
///   This function is atomic and idempotent.
pub fn disable_page_allocator() {
    PAGE_ALLOCATOR_ENABLED.store(false, SeqCst);
}

pub fn page_allocator_enabled() -> bool {
    PAGE_ALLOCATOR_ENABLED.load(SeqCst)
}

/// The process-wide page allocator used while the mode is engaged.
pub fn page_allocator() -> &'static PageAllocator {
    &PAGE_ALLOCATOR
}

/// A [GlobalAlloc] that forwards to `A` normally, and to the process-wide
/// [PageAllocator] while [enable_page_allocator] is in effect.
///
/// Install it as the global allocator of a program that wants crash capture
/// to be able to allocate from inside a signal handler:
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: libcrash_alloc::SignalSafeAlloc = libcrash_alloc::SignalSafeAlloc::new();
/// ```
pub struct SignalSafeAlloc<A = DefaultInner> {
    inner: A,
}

#[cfg(feature = "std")]
pub type DefaultInner = std::alloc::System;

#[cfg(not(feature = "std"))]
pub type DefaultInner = ();

#[cfg(feature = "std")]
impl SignalSafeAlloc<std::alloc::System> {
    pub const fn new() -> Self {
        Self {
            inner: std::alloc::System,
        }
    }
}

#[cfg(feature = "std")]
impl Default for SignalSafeAlloc<std::alloc::System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> SignalSafeAlloc<A> {
    pub const fn with_inner(inner: A) -> Self {
        Self { inner }
    }

    fn page_alloc(layout: Layout) -> *mut u8 {
        match PAGE_ALLOCATOR.allocate(layout) {
            Ok(allocation) => allocation.as_ptr().cast::<u8>(),
            Err(_) => ptr::null_mut(),
        }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for SignalSafeAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if page_allocator_enabled() {
            Self::page_alloc(layout)
        } else {
            // SAFETY: forwarded with the caller's guarantees.
            unsafe { self.inner.alloc(layout) }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // While handling a crash the wrapped allocator may be holding its lock,
        // so anything freed during that window is leaked instead.
        if page_allocator_enabled() || PAGE_ALLOCATOR.owns(ptr) {
            if let Some(ptr) = NonNull::new(ptr) {
                // SAFETY: a no-op for the page allocator.
                unsafe { PAGE_ALLOCATOR.deallocate(ptr, layout) };
            }
            return;
        }
        // SAFETY: `ptr` didn't come from the page allocator, so it came from
        // `inner` with this layout.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !page_allocator_enabled() && !PAGE_ALLOCATOR.owns(ptr) {
            // SAFETY: forwarded with the caller's guarantees.
            return unsafe { self.inner.realloc(ptr, layout, new_size) };
        }
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        // SAFETY: new_layout has a nonzero size per the `realloc` contract.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // SAFETY: both regions are valid for the smaller of the two sizes
            // and belong to distinct allocations.
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
            // SAFETY: forwarded with the caller's guarantees.
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}
