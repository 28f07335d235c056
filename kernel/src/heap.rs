// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fallible early-boot allocations.
//!
//! The boot sequence allocates a handful of objects that live until the
//! machine halts (the per-core areas, the global system state and the core
//! barrier). They're all obtained through the heap the allocator subsystem
//! handed out in phase 5 so exhaustion surfaces as `KError::OutOfMemory`
//! instead of an allocation-error abort.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::error::{KError, KResult};

/// Forwards to whatever global allocator the kernel is linked with.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc::alloc::alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        alloc::alloc::dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        alloc::alloc::alloc_zeroed(layout)
    }
}

/// The default heap handle for allocator subsystems that just wire up the
/// global allocator.
pub static KERNEL_HEAP: KernelHeap = KernelHeap;

/// Allocates zeroed backing storage for a `T` from `heap`.
pub(crate) fn try_alloc<T>(heap: &dyn GlobalAlloc) -> KResult<NonNull<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(NonNull::dangling());
    }

    // Safe: layout has a non-zero size.
    let ptr = unsafe { heap.alloc_zeroed(layout) } as *mut T;
    NonNull::new(ptr).ok_or_else(|| KError::out_of_memory(layout))
}

/// Moves the value produced by `init` into a fresh allocation from `heap` that
/// is never freed.
///
/// `init` receives the final address of the object, for structures that need
/// to point to themselves.
pub(crate) fn try_leak_with<T, F>(heap: &dyn GlobalAlloc, init: F) -> KResult<&'static T>
where
    F: FnOnce(*const T) -> T,
{
    let ptr = try_alloc::<T>(heap)?;
    unsafe {
        // Safe: fresh allocation with the layout of `T` that nobody else sees.
        ptr::write(ptr.as_ptr(), init(ptr.as_ptr()));
        Ok(&*ptr.as_ptr())
    }
}

/// Moves `value` into a fresh allocation from `heap` that is never freed.
pub(crate) fn try_leak<T>(heap: &dyn GlobalAlloc, value: T) -> KResult<&'static T> {
    try_leak_with(heap, |_| value)
}
