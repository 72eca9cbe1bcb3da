// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::os;
use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Bookkeeping stored at the start of every mapping owned by a
/// [PageAllocator]. Chunks form a singly linked list, newest first. `next` and
/// `len` are written once before the chunk is published and never change.
#[repr(C)]
struct Chunk {
    next: *mut Chunk,
    len: usize,
    used: AtomicUsize,
}

impl Chunk {
    const HEADER: usize = size_of::<Chunk>();

    fn base_ptr(&self) -> *mut u8 {
        self as *const Chunk as *mut u8
    }

    fn contains(&self, addr: usize) -> bool {
        let base = self.base_ptr() as usize;
        addr >= base && addr - base < self.len
    }

    /// Bumps `used` past an allocation satisfying `layout`, or returns `None`
    /// if the chunk doesn't have room for it.
    fn bump(&self, layout: Layout) -> Option<NonNull<[u8]>> {
        let base = self.base_ptr() as usize;
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let start = base.checked_add(used)?;
            let padding = start.wrapping_neg() & (layout.align() - 1);
            let offset = used.checked_add(padding)?;
            let end = offset.checked_add(layout.size())?;
            if end > self.len {
                return None;
            }
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: `offset + layout.size()` was just checked to be
                    // within the mapping, and the range is now reserved for us.
                    let thin = unsafe { self.base_ptr().add(offset) };
                    debug_assert_eq!(0, thin.align_offset(layout.align()));
                    let wide = ptr::slice_from_raw_parts_mut(thin, layout.size());
                    return NonNull::new(wide);
                }
                Err(actual) => used = actual,
            }
        }
    }
}

/// [PageAllocator] is a lock-free arena that maps fresh pages directly from
/// the OS and hands out bump allocations from them. It never calls into the C
/// heap and never takes a lock, so it stays usable while a signal handler has
/// interrupted a thread in the middle of `malloc`.
///
/// Deallocation of individual allocations does nothing. Pages are returned to
/// the OS only when the allocator itself is dropped, which for the
/// process-wide instance means never. The allocator is only meant to serve the
/// short-lived burst of allocations made while a crash is being captured.
pub struct PageAllocator {
    head: AtomicPtr<Chunk>,
    chunk_size: usize,
}

// SAFETY: all shared state is reached through atomics, and chunks are
// immutable apart from their atomic `used` counter once published.
unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl PageAllocator {
    /// Minimum size of a freshly mapped chunk, in bytes. Larger requests get a
    /// dedicated chunk rounded up to whole pages.
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub const fn new(chunk_size: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            chunk_size,
        }
    }

    /// Maps a new chunk large enough for `layout` and tries to publish it on
    /// top of `observed`. Losing the race to another thread is not an error:
    /// the caller simply retries on whichever chunk won.
    #[cold]
    #[inline(never)]
    fn grow(&self, observed: *mut Chunk, layout: Layout) -> Result<(), AllocError> {
        let needed = Chunk::HEADER
            .checked_add(layout.size())
            .and_then(|n| n.checked_add(layout.align()))
            .ok_or(AllocError)?;
        let len = os::round_to_pages(needed.max(self.chunk_size))?;
        let mapping = os::map_pages(len)?;
        let chunk = mapping.as_ptr().cast::<Chunk>();
        // SAFETY: the mapping is page aligned, writable and at least HEADER
        // bytes long.
        unsafe {
            chunk.write(Chunk {
                next: observed,
                len,
                used: AtomicUsize::new(Chunk::HEADER),
            })
        };

        if self
            .head
            .compare_exchange(observed, chunk, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: the chunk was never published, nothing else can see it.
            unsafe { os::unmap_pages(mapping, len) };
        }
        Ok(())
    }

    fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        let mut cursor = self.head.load(Ordering::Acquire);
        core::iter::from_fn(move || {
            // SAFETY: published chunks are never unmapped.
            let chunk = unsafe { cursor.as_ref() }?;
            cursor = chunk.next;
            Some(chunk)
        })
    }

    /// Returns true if `ptr` points into memory handed out by this allocator.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.chunks().any(|chunk| chunk.contains(addr))
    }

    /// Number of bytes mapped from the OS so far.
    pub fn reserved_bytes(&self) -> usize {
        self.chunks().map(|chunk| chunk.len).sum()
    }

    /// Number of bytes handed out (or lost to padding and headers).
    pub fn used_bytes(&self) -> usize {
        self.chunks()
            .map(|chunk| chunk.used.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while let Some(chunk) = NonNull::new(cursor) {
            // SAFETY: `&mut self` means no other thread can be bumping, and the
            // header is read before its mapping goes away.
            let (next, len) = unsafe { (chunk.as_ref().next, chunk.as_ref().len) };
            // SAFETY: every chunk in the list is exactly one mapping of `len`.
            unsafe { os::unmap_pages(chunk.cast(), len) };
            cursor = next;
        }
    }
}

unsafe impl Allocator for PageAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: published chunks are never unmapped.
            if let Some(chunk) = unsafe { head.as_ref() } {
                if let Some(allocation) = chunk.bump(layout) {
                    return Ok(allocation);
                }
            }
            self.grow(head, layout)?;
        }
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Memory is never given back, see the type level docs.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::*;
    use bolero::generator::TypeGenerator;

    #[test]
    fn fuzz() {
        // avoid SUMMARY: libFuzzer: out-of-memory
        const MAX_SIZE: usize = 0x100000;

        let size = 0..=MAX_SIZE;
        let align_bits = 0..=12;
        let idx = 0..=MAX_SIZE;
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, usize, u8)>::produce()
            .with()
            .values((size, align_bits, idx, val));
        bolero::check!()
            .with_generator(allocs)
            .for_each(|size_align_vec| {
                let allocator = PageAllocator::new(PageAllocator::DEFAULT_CHUNK_SIZE);
                for (size, align_bits, idx, val) in size_align_vec {
                    fuzzer_inner_loop(&allocator, *size, *align_bits, *idx, *val, MAX_SIZE)
                }
            })
    }

    #[test]
    fn test_basics() -> Result<(), AllocError> {
        let alloc = PageAllocator::new(0);
        assert_eq!(0, alloc.reserved_bytes());
        assert!(!alloc.owns(ptr::null()));

        const WIDTH: usize = 8;
        let layout = Layout::new::<[u8; WIDTH]>();
        let first = alloc.allocate(layout)?;
        let second = alloc.allocate(layout)?;
        assert_eq!(WIDTH, first.len());
        assert_eq!(WIDTH, second.len());

        let first = first.as_ptr() as *mut u8;
        let second = second.as_ptr() as *mut u8;
        // Consecutive allocations with matching alignment are packed.
        unsafe { assert_eq!(WIDTH, second.offset_from(first) as usize) };

        assert!(alloc.owns(first));
        assert!(alloc.owns(second));
        let outside = 0u64;
        assert!(!alloc.owns(&outside as *const u64 as *const u8));

        let page = os::page_size().unwrap();
        assert_eq!(page, alloc.reserved_bytes());
        assert_eq!(Chunk::HEADER + 2 * WIDTH, alloc.used_bytes());

        _ = alloc.allocate(Layout::new::<[u8; 0]>()).unwrap_err();
        Ok(())
    }

    #[test]
    fn test_grows_when_full() -> Result<(), AllocError> {
        let page = os::page_size().unwrap();
        let alloc = PageAllocator::new(page);
        let layout = Layout::from_size_align(page / 2, 8).unwrap();
        let a = alloc.allocate(layout)?;
        let b = alloc.allocate(layout)?;
        assert_eq!(2 * page, alloc.reserved_bytes());
        assert!(alloc.owns(a.as_ptr() as *const u8));
        assert!(alloc.owns(b.as_ptr() as *const u8));

        // Oversized requests get their own chunk.
        let big = Layout::from_size_align(4 * page, 16).unwrap();
        let c = alloc.allocate(big)?;
        assert!(is_aligned_to(c.as_ptr() as *const u8, 16));
        assert!(alloc.reserved_bytes() >= 6 * page);
        Ok(())
    }

    #[test]
    fn test_alignment() -> Result<(), AllocError> {
        let alloc = PageAllocator::new(PageAllocator::DEFAULT_CHUNK_SIZE);
        for align_bits in 0..=10 {
            let align = 1usize << align_bits;
            _ = alloc.allocate(Layout::new::<u8>())?;
            let ptr = alloc.allocate(Layout::from_size_align(3, align).unwrap())?;
            assert!(is_aligned_to(ptr.as_ptr() as *const u8, align));
        }
        Ok(())
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        use std::sync::Arc;

        let alloc = Arc::new(PageAllocator::new(4096));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    let layout = Layout::new::<u64>();
                    (0..1000)
                        .map(|_| alloc.allocate(layout).unwrap().as_ptr() as *mut u8 as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(total, all.len());
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= size_of::<u64>());
        }
    }
}
