use super::profiler::heap_profiler;
use crate::arena::{LibcAllocator, RawAllocator};
use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

/// Alignment `malloc`/`realloc` guarantee on their own
const MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// A global allocator over libc `malloc` that reports every allocation and
/// free to [`heap_profiler`].
///
/// Nothing is recorded until the heap profiler is started, so installing
/// the allocator costs one atomic load per call while profiling is off.
pub struct ProfilingAllocator;

impl ProfilingAllocator {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for ProfilingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn raw_alloc(layout: Layout) -> *mut u8 {
    LibcAllocator
        .allocate(layout)
        .map_or(ptr::null_mut(), |p| p.as_ptr())
}

unsafe impl GlobalAlloc for ProfilingAllocator {
    #[inline(never)]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = raw_alloc(layout);
        if !ptr.is_null() {
            heap_profiler().record_alloc(ptr, layout.size(), 1);
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        heap_profiler().record_free(ptr);
        unsafe { libc::free(ptr as *mut libc::c_void) }
    }

    #[inline(never)]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = if layout.align() <= MIN_ALIGN {
            unsafe { libc::calloc(1, layout.size().max(1)) as *mut u8 }
        } else {
            let ptr = raw_alloc(layout);
            if !ptr.is_null() {
                unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
            }
            ptr
        };
        if !ptr.is_null() {
            heap_profiler().record_alloc(ptr, layout.size(), 1);
        }
        ptr
    }

    #[inline(never)]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Drop the old record first so a racing allocation that reuses the
        // address is not erased afterwards
        heap_profiler().record_free(ptr);

        let new_ptr = if layout.align() <= MIN_ALIGN {
            unsafe { libc::realloc(ptr as *mut libc::c_void, new_size.max(1)) as *mut u8 }
        } else {
            let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                return ptr::null_mut();
            };
            let new_ptr = raw_alloc(new_layout);
            if !new_ptr.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    libc::free(ptr as *mut libc::c_void);
                }
            }
            new_ptr
        };

        if new_ptr.is_null() {
            // The old block is still valid
            heap_profiler().record_alloc(ptr, layout.size(), 1);
        } else {
            heap_profiler().record_alloc(new_ptr, new_size, 1);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_round_trip_through_libc() {
        let alloc = ProfilingAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            p.write_bytes(0x5a, 24);

            let grown = alloc.realloc(p, layout, 4096);
            assert!(!grown.is_null());
            assert_eq!(*grown.add(23), 0x5a);
            alloc.dealloc(grown, Layout::from_size_align(4096, 8).unwrap());
        }
    }

    #[test]
    fn over_aligned_requests_are_honored() {
        let alloc = ProfilingAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(100, 4096).unwrap();
            let p = alloc.alloc_zeroed(layout);
            assert_eq!(p as usize % 4096, 0);
            assert!((0..100).all(|i| *p.add(i) == 0));

            let grown = alloc.realloc(p, layout, 8192);
            assert_eq!(grown as usize % 4096, 0);
            alloc.dealloc(grown, Layout::from_size_align(8192, 4096).unwrap());
        }
    }
}
