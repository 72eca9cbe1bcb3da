// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(test)]
#[track_caller]
pub(crate) fn is_aligned_to<T>(p: *const T, align: usize) -> bool {
    p.align_offset(align) == 0
}

/// One step of the allocator property tests: allocate, check alignment and
/// size, touch a byte, then hand the allocation back.
#[cfg(test)]
pub(crate) fn fuzzer_inner_loop<A: crate::Allocator>(
    allocator: &A,
    size: usize,
    align_bits: u32,
    idx: usize,
    val: u8,
    max_size: usize,
) {
    use core::alloc::Layout;
    let idx = if size > 0 { idx % size } else { 0 };
    let align = 1usize << align_bits;
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return;
    };

    if layout.pad_to_align().size() > max_size {
        return;
    };

    if let Ok(mut ptr) = allocator.allocate(layout) {
        assert!(is_aligned_to(ptr.cast::<u8>().as_ptr(), align));
        let obj = unsafe { ptr.as_mut() };
        assert!(obj.len() >= size);

        obj[idx] = val;
        assert_eq!(obj[idx], val);

        // Page allocations are never returned, but deallocate must not panic.
        unsafe { allocator.deallocate(ptr.cast(), layout) };
    }
}
