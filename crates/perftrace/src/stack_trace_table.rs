//! Append-only list of sampled allocation stacks.
//!
//! Nodes come from a private [`PageHeapAllocator`], so traces can be added
//! while the heap profiler's lock is held. Draining allocates the output
//! through the global allocator and must happen with that lock released.

use crate::arena::PageHeapAllocator;
use std::io::{self, Write};
use std::ptr::{self, NonNull};

/// Maximum number of frames kept per sampled trace
pub const MAX_STACK_DEPTH: usize = 31;

/// One sampled allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackTrace {
    /// Bytes allocated at this stack
    pub size: usize,
    depth: usize,
    stack: [usize; MAX_STACK_DEPTH],
}

impl StackTrace {
    /// Frames beyond [`MAX_STACK_DEPTH`] are dropped.
    pub fn new(size: usize, frames: &[usize]) -> Self {
        let depth = frames.len().min(MAX_STACK_DEPTH);
        let mut stack = [0usize; MAX_STACK_DEPTH];
        stack[..depth].copy_from_slice(&frames[..depth]);
        StackTrace { size, depth, stack }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn frames(&self) -> &[usize] {
        &self.stack[..self.depth]
    }
}

struct Entry {
    next: *mut Entry,
    trace: StackTrace,
}

pub struct StackTraceTable {
    /// Sticky: set when a node could not be allocated
    error: bool,
    depth_total: usize,
    len: usize,
    head: *mut Entry,
    allocator: PageHeapAllocator<Entry>,
}

// SAFETY: every node is owned by the table's own allocator.
unsafe impl Send for StackTraceTable {}

impl Default for StackTraceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StackTraceTable {
    pub const fn new() -> Self {
        StackTraceTable {
            error: false,
            depth_total: 0,
            len: 0,
            head: ptr::null_mut(),
            allocator: PageHeapAllocator::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once a node allocation has failed. Cleared by draining.
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Prepend a copy of `trace`. Never calls the global allocator.
    pub fn add_trace(&mut self, trace: &StackTrace) {
        if self.error {
            return;
        }
        let Some(node) = self.allocator.allocate() else {
            self.error = true;
            return;
        };
        unsafe {
            node.as_ptr().write(Entry {
                next: self.head,
                trace: *trace,
            });
        }
        self.head = node.as_ptr();
        self.depth_total += trace.depth;
        self.len += 1;
    }

    /// Drain the list into `[1, size, depth, pc...]* 0`, most recent first.
    ///
    /// Returns `None` if the output could not be allocated or a trace was
    /// dropped earlier. The list is empty afterwards either way.
    pub fn read_stack_traces_and_clear(&mut self) -> Option<Box<[usize]>> {
        let result = if self.error {
            None
        } else {
            self.render()
        };
        self.clear();
        result
    }

    fn render(&self) -> Option<Box<[usize]>> {
        let out_len = self.len * 3 + self.depth_total + 1;
        let mut out = Vec::new();
        out.try_reserve_exact(out_len).ok()?;

        let mut node = self.head;
        while !node.is_null() {
            let entry = unsafe { &*node };
            out.push(1);
            out.push(entry.trace.size);
            out.push(entry.trace.depth);
            out.extend_from_slice(entry.trace.frames());
            node = entry.next;
        }
        out.push(0);
        Some(out.into_boxed_slice())
    }

    fn clear(&mut self) {
        let mut node = self.head;
        while let Some(entry) = NonNull::new(node) {
            node = unsafe { (*entry.as_ptr()).next };
            unsafe { self.allocator.deallocate(entry) };
        }
        self.head = ptr::null_mut();
        self.len = 0;
        self.depth_total = 0;
        self.error = false;
    }
}

impl Drop for StackTraceTable {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Iterate the `(size, frames)` records of a drained dump.
pub fn dump_records(dump: &[usize]) -> impl Iterator<Item = (usize, &[usize])> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if dump.get(pos).copied().unwrap_or(0) == 0 {
            return None;
        }
        let size = *dump.get(pos + 1)?;
        let depth = *dump.get(pos + 2)?;
        let frames = dump.get(pos + 3..pos + 3 + depth)?;
        pos += 3 + depth;
        Some((size, frames))
    })
}

/// Write a drained dump as a heap profile, one line per sampled trace.
pub fn write_sampled_profile<W: Write + ?Sized>(dump: &[usize], out: &mut W) -> io::Result<()> {
    use crate::heap::{unparse, Stats};

    let mut total = Stats::default();
    for (size, _) in dump_records(dump) {
        total.record_alloc(size);
    }

    write!(out, "heap profile: ")?;
    unparse(out, &total, &[], " heapprofile")?;
    for (size, frames) in dump_records(dump) {
        let mut stats = Stats::default();
        stats.record_alloc(size);
        unparse(out, &stats, frames, "")?;
    }
    crate::proc_maps::write_mapped_libraries(out)
}
