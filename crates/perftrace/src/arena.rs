//! Memory sources for profiler bookkeeping.
//!
//! Nothing in here routes through the Rust global allocator, so the tables
//! built on top can be updated from inside a profiling `GlobalAlloc` without
//! recursing into it.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

/// Alignment guaranteed by `malloc` on the supported targets
const MIN_ALIGN: usize = 2 * size_of::<usize>();

/// Size of each chunk the page heap allocator maps at a time
const ALLOC_INCREMENT: usize = 128 << 10;

/// Raw memory source injected into profiler tables.
///
/// # Safety
///
/// `allocate` must return memory valid for `layout`, and implementations must
/// never call into an allocator that is itself being profiled.
pub unsafe trait RawAllocator {
    /// Allocate a block for `layout`, or `None` when memory is exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Release a block obtained from [`RawAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// libc `malloc`/`free`, bypassing whatever `#[global_allocator]` is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcAllocator;

unsafe impl RawAllocator for LibcAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size().max(1);
        let ptr = if layout.align() <= MIN_ALIGN {
            unsafe { libc::malloc(size) }
        } else {
            let mut out: *mut libc::c_void = ptr::null_mut();
            let align = layout.align().max(size_of::<usize>());
            if unsafe { libc::posix_memalign(&mut out, align, size) } != 0 {
                return None;
            }
            out
        };
        NonNull::new(ptr as *mut u8)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) }
    }
}

/// Growable array of `Copy` values backed by a [`RawAllocator`].
///
/// Growth failures are reported to the caller instead of aborting, so a
/// table can drop a record when memory runs out.
pub struct RawVec<T: Copy, A: RawAllocator> {
    ptr: NonNull<T>,
    cap: usize,
    len: usize,
    alloc: A,
}

// SAFETY: RawVec uniquely owns its buffer.
unsafe impl<T: Copy + Send, A: RawAllocator + Send> Send for RawVec<T, A> {}

impl<T: Copy, A: RawAllocator> RawVec<T, A> {
    pub const fn new_in(alloc: A) -> Self {
        RawVec {
            ptr: NonNull::dangling(),
            cap: 0,
            len: 0,
            alloc,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Make room for `additional` more elements. Returns false on exhaustion.
    pub fn try_reserve(&mut self, additional: usize) -> bool {
        let Some(needed) = self.len.checked_add(additional) else {
            return false;
        };
        if needed <= self.cap {
            return true;
        }
        let new_cap = needed.max(self.cap * 2).max(4);
        self.grow_to(new_cap)
    }

    fn grow_to(&mut self, new_cap: usize) -> bool {
        let Ok(layout) = Layout::array::<T>(new_cap) else {
            return false;
        };
        let Some(raw) = self.alloc.allocate(layout) else {
            return false;
        };
        let new_ptr = raw.cast::<T>();
        if self.cap > 0 {
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
                self.release();
            }
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        true
    }

    /// Append a value. Returns false if the buffer could not grow.
    pub fn push(&mut self, value: T) -> bool {
        if !self.try_reserve(1) {
            return false;
        }
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
        true
    }

    /// Replace the contents with `len` copies of `value`.
    pub fn reset_filled(&mut self, len: usize, value: T) -> bool {
        self.len = 0;
        if !self.try_reserve(len) {
            return false;
        }
        for i in 0..len {
            unsafe { self.ptr.as_ptr().add(i).write(value) };
        }
        self.len = len;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    unsafe fn release(&mut self) {
        if self.cap == 0 {
            return;
        }
        if let Ok(layout) = Layout::array::<T>(self.cap) {
            unsafe { self.alloc.deallocate(self.ptr.cast(), layout) };
        }
    }
}

impl<T: Copy, A: RawAllocator> Deref for RawVec<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy, A: RawAllocator> DerefMut for RawVec<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy, A: RawAllocator> Drop for RawVec<T, A> {
    fn drop(&mut self) {
        unsafe { self.release() };
    }
}

/// Header at the start of every mapped chunk
#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    len: usize,
}

/// Fixed-size object pool carved out of anonymous `mmap` chunks.
///
/// Freed objects go on an intrusive free list and are reused before new
/// chunk space. Chunks are unmapped when the pool is dropped.
pub struct PageHeapAllocator<T> {
    free_area: *mut u8,
    free_avail: usize,
    free_list: *mut u8,
    chunks: *mut ChunkHeader,
    inuse: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the pool owns its chunks; callers move it as a unit.
unsafe impl<T: Send> Send for PageHeapAllocator<T> {}

impl<T> PageHeapAllocator<T> {
    const OBJECT_ALIGN: usize = if align_of::<T>() > align_of::<usize>() {
        align_of::<T>()
    } else {
        align_of::<usize>()
    };

    const OBJECT_SIZE: usize = {
        let size = if size_of::<T>() > size_of::<usize>() {
            size_of::<T>()
        } else {
            size_of::<usize>()
        };
        (size + Self::OBJECT_ALIGN - 1) & !(Self::OBJECT_ALIGN - 1)
    };

    const HEADER_SIZE: usize = (size_of::<ChunkHeader>() + Self::OBJECT_ALIGN - 1)
        & !(Self::OBJECT_ALIGN - 1);

    pub const fn new() -> Self {
        PageHeapAllocator {
            free_area: ptr::null_mut(),
            free_avail: 0,
            free_list: ptr::null_mut(),
            chunks: ptr::null_mut(),
            inuse: 0,
            _marker: PhantomData,
        }
    }

    /// Number of objects currently handed out
    pub fn inuse(&self) -> usize {
        self.inuse
    }

    /// Hand out uninitialized storage for one `T`.
    pub fn allocate(&mut self) -> Option<NonNull<T>> {
        let result = if !self.free_list.is_null() {
            let obj = self.free_list;
            self.free_list = unsafe { *(obj as *mut *mut u8) };
            obj
        } else {
            if self.free_avail < Self::OBJECT_SIZE {
                self.map_chunk()?;
            }
            let obj = self.free_area;
            self.free_area = unsafe { self.free_area.add(Self::OBJECT_SIZE) };
            self.free_avail -= Self::OBJECT_SIZE;
            obj
        };
        self.inuse += 1;
        NonNull::new(result as *mut T)
    }

    /// Return storage to the free list. The value is not dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this pool and not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<T>) {
        let obj = ptr.as_ptr() as *mut u8;
        unsafe { *(obj as *mut *mut u8) = self.free_list };
        self.free_list = obj;
        self.inuse -= 1;
    }

    fn map_chunk(&mut self) -> Option<()> {
        let len = ALLOC_INCREMENT.max(Self::HEADER_SIZE + Self::OBJECT_SIZE);
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }

        let header = raw as *mut ChunkHeader;
        unsafe {
            header.write(ChunkHeader {
                next: self.chunks,
                len,
            });
        }
        self.chunks = header;
        // The tail of the previous chunk is abandoned
        self.free_area = unsafe { (raw as *mut u8).add(Self::HEADER_SIZE) };
        self.free_avail = len - Self::HEADER_SIZE;
        Some(())
    }
}

impl<T> Default for PageHeapAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PageHeapAllocator<T> {
    fn drop(&mut self) {
        let mut chunk = self.chunks;
        while !chunk.is_null() {
            unsafe {
                let next = (*chunk).next;
                let len = (*chunk).len;
                libc::munmap(chunk as *mut libc::c_void, len);
                chunk = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_vec_grows_and_keeps_contents() {
        let mut v: RawVec<u64, LibcAllocator> = RawVec::new_in(LibcAllocator);
        for i in 0..1000 {
            assert!(v.push(i));
        }
        assert_eq!(v.len(), 1000);
        assert_eq!(v[0], 0);
        assert_eq!(v[999], 999);
        assert!(v.capacity() >= 1000);
    }

    #[test]
    fn raw_vec_reset_filled_overwrites() {
        let mut v: RawVec<u32, LibcAllocator> = RawVec::new_in(LibcAllocator);
        v.push(7);
        assert!(v.reset_filled(16, u32::MAX));
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|&x| x == u32::MAX));
    }

    #[test]
    fn libc_allocator_honors_large_alignment() {
        let layout = Layout::from_size_align(64, 256).unwrap();
        let ptr = LibcAllocator.allocate(layout).expect("allocation");
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
        unsafe { LibcAllocator.deallocate(ptr, layout) };
    }

    #[test]
    fn page_heap_allocator_reuses_freed_objects() {
        let mut pool: PageHeapAllocator<[usize; 40]> = PageHeapAllocator::new();
        let a = pool.allocate().expect("first object");
        let b = pool.allocate().expect("second object");
        assert_ne!(a, b);
        assert_eq!(pool.inuse(), 2);

        unsafe { pool.deallocate(a) };
        assert_eq!(pool.inuse(), 1);
        let c = pool.allocate().expect("reused object");
        assert_eq!(a, c);
    }

    #[test]
    fn page_heap_allocator_spans_multiple_chunks() {
        let mut pool: PageHeapAllocator<[u8; 4096]> = PageHeapAllocator::new();
        let objects: Vec<_> = (0..100).map(|_| pool.allocate().unwrap()).collect();
        for obj in &objects {
            unsafe { obj.as_ptr().write([0xAB; 4096]) };
        }
        assert_eq!(pool.inuse(), 100);
    }
}
