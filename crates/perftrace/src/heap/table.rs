//! Live allocation table: per-address records attributed to stack buckets.

use super::address_map::AddressMap;
use super::bucket::{unparse, Bucket, BucketId, BucketTable, Stats, MAX_STACK_DEPTH};
use super::snapshot::Snapshot;
use crate::arena::{LibcAllocator, RawAllocator};
use crate::proc_maps::write_mapped_libraries;
use crate::stacktrace;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// File extension of heap profile dumps
pub const FILE_EXT: &str = ".heap";

/// Header prefix of every heap profile
pub const PROFILE_HEADER: &str = "heap profile: ";

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata kept per tracked address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocValue {
    pub bytes: usize,
    pub bucket: BucketId,
    /// Reached by the leak checker's marking pass
    pub live: bool,
    /// Excluded from leak reports
    pub ignored: bool,
}

/// Everything known about one tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocInfo<'a> {
    pub object_size: usize,
    pub call_stack: &'a [usize],
    pub live: bool,
    pub ignored: bool,
}

/// Allocation tracking table.
///
/// Not thread-safe: callers serialize every call, usually with the lock that
/// guards the allocator itself. All memory comes from `A`.
pub struct HeapProfileTable<A: RawAllocator + Clone = LibcAllocator> {
    id: u64,
    total: Stats,
    buckets: BucketTable<A>,
    address_map: AddressMap<AllocValue, A>,
}

impl HeapProfileTable<LibcAllocator> {
    pub fn new() -> Self {
        Self::new_in(LibcAllocator)
    }

    /// Capture the caller's stack for [`HeapProfileTable::record_alloc`].
    ///
    /// `skip` frames above the caller are dropped.
    #[inline(never)]
    pub fn get_caller_stack_trace(skip: usize, stack: &mut [usize; MAX_STACK_DEPTH]) -> usize {
        stacktrace::get_stack_trace(stack, skip + 1)
    }

    /// Remove `prefix.*.heap` files left by earlier runs. Failures are
    /// logged, never returned. Returns the number of files removed.
    pub fn cleanup_old_profiles(prefix: &Path) -> usize {
        let Some(stem) = prefix.file_name().and_then(|s| s.to_str()) else {
            return 0;
        };
        let dir = match prefix.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list old heap profiles");
                return 0;
            }
        };

        let head = format!("{stem}.");
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let matches = name.len() > head.len() + FILE_EXT.len()
                && name.starts_with(&head)
                && name.ends_with(FILE_EXT);
            if !matches {
                continue;
            }
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed old heap profile");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove old heap profile"),
            }
        }
        removed
    }
}

impl Default for HeapProfileTable<LibcAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: RawAllocator + Clone> HeapProfileTable<A> {
    pub fn new_in(alloc: A) -> Self {
        HeapProfileTable {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            total: Stats::default(),
            buckets: BucketTable::new_in(alloc.clone()),
            address_map: AddressMap::new_in(alloc),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Record `bytes` allocated at `ptr` from `call_stack`.
    ///
    /// An existing record at `ptr` is replaced without touching its bucket.
    /// A null `ptr` is never tracked. If the table cannot grow, the record is
    /// dropped.
    pub fn record_alloc(&mut self, ptr: usize, bytes: usize, call_stack: &[usize]) {
        if ptr == 0 {
            return;
        }
        let Some(bucket) = self.buckets.get_or_create(call_stack) else {
            return;
        };
        let value = AllocValue {
            bytes,
            bucket,
            live: false,
            ignored: false,
        };
        if !self.address_map.insert(ptr, value) {
            return;
        }
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.stats.record_alloc(bytes);
        }
        self.total.record_alloc(bytes);
    }

    /// Record that `ptr` was freed. Untracked pointers are ignored.
    pub fn record_free(&mut self, ptr: usize) {
        let Some(value) = self.address_map.remove(ptr) else {
            return;
        };
        if let Some(b) = self.buckets.get_mut(value.bucket) {
            b.stats.record_free(value.bytes);
        }
        self.total.record_free(value.bytes);
    }

    /// Size of the allocation starting at `ptr`.
    pub fn find_alloc(&self, ptr: usize) -> Option<usize> {
        self.address_map.get(ptr).map(|v| v.bytes)
    }

    pub fn find_alloc_details(&self, ptr: usize) -> Option<AllocInfo<'_>> {
        let value = self.address_map.get(ptr)?;
        Some(self.info(value))
    }

    /// Base address and size of the allocation containing `ptr`, looking no
    /// further than `max_size` bytes below it.
    pub fn find_inside_alloc(&self, ptr: usize, max_size: usize) -> Option<(usize, usize)> {
        self.address_map
            .find_inside(ptr, max_size, |v| v.bytes)
            .map(|(base, v)| (base, v.bytes))
    }

    /// Mark `ptr` live. True only if it was tracked and not already live.
    pub fn mark_as_live(&mut self, ptr: usize) -> bool {
        match self.address_map.get_mut(ptr) {
            Some(value) if !value.live => {
                value.live = true;
                true
            }
            _ => false,
        }
    }

    /// Exclude `ptr` from leak reports.
    pub fn mark_as_ignored(&mut self, ptr: usize) {
        if let Some(value) = self.address_map.get_mut(ptr) {
            value.ignored = true;
        }
    }

    /// Sum of all bucket statistics
    pub fn total(&self) -> Stats {
        self.total
    }

    /// Number of addresses currently tracked
    pub fn allocation_count(&self) -> usize {
        self.address_map.len()
    }

    pub fn bucket(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(id)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (BucketId, &Bucket)> {
        self.buckets.iter()
    }

    pub(crate) fn call_stack(&self, id: BucketId) -> &[usize] {
        self.buckets.get(id).map(Bucket::stack).unwrap_or(&[])
    }

    fn info(&self, value: &AllocValue) -> AllocInfo<'_> {
        AllocInfo {
            object_size: value.bytes,
            call_stack: self.call_stack(value.bucket),
            live: value.live,
            ignored: value.ignored,
        }
    }

    /// Call `f` for every tracked allocation.
    pub fn iterate_allocs<F: FnMut(usize, AllocInfo<'_>)>(&self, mut f: F) {
        self.address_map.for_each(|ptr, value| f(ptr, self.info(value)));
    }

    /// Write the table as a heap profile: totals, then one line per bucket
    /// by descending in-use bytes, then the process mappings.
    pub fn save_profile<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        self.write_buckets(out)?;
        write_mapped_libraries(out)
    }

    /// The profile without its mapping section.
    pub(crate) fn write_buckets<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        let mut ordered: Vec<&Bucket> = self.buckets.iter().map(|(_, b)| b).collect();
        ordered.sort_by(|a, b| b.stats.inuse_bytes().cmp(&a.stats.inuse_bytes()));

        write!(out, "{PROFILE_HEADER}")?;
        unparse(out, &self.total, &[], " heapprofile")?;
        for bucket in ordered {
            unparse(out, &bucket.stats, bucket.stack(), "")?;
        }
        Ok(())
    }

    /// Copy every tracked allocation. `None` if the copy cannot be allocated.
    pub fn take_snapshot(&self) -> Option<Snapshot<A>> {
        let map = self.address_map.try_clone_filtered(|_, _| true)?;
        Some(Snapshot::new(self.id, map))
    }

    /// Snapshot the allocations that are neither live nor ignored and not
    /// present in `base`.
    ///
    /// Clears the live mark on every entry of this table, so the next
    /// marking pass starts fresh.
    pub fn non_live_snapshot(&mut self, base: Option<&Snapshot<A>>) -> Option<Snapshot<A>> {
        if let Some(base) = base {
            debug_assert_eq!(base.table_id(), self.id, "snapshot from another table");
        }

        let snapshot = self.address_map.try_clone_filtered(|ptr, value| {
            !value.live && !value.ignored && !base.is_some_and(|b| b.contains(ptr))
        });
        self.address_map.for_each_mut(|_, value| value.live = false);
        Some(Snapshot::new(self.id, snapshot?))
    }
}
