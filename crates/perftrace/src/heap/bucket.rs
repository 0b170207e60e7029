//! Call-stack buckets: one aggregate per distinct allocation stack.

use crate::arena::{RawAllocator, RawVec};
use std::io::{self, Write};

/// Maximum number of frames kept per allocation stack
pub const MAX_STACK_DEPTH: usize = 32;

/// Number of hash chains in the bucket table
const HASH_TABLE_SIZE: usize = 179_999;

/// End of a bucket chain
const NO_BUCKET: u32 = u32::MAX;

/// Allocation and free counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub allocs: u64,
    pub frees: u64,
    pub alloc_size: u64,
    pub free_size: u64,
}

impl Stats {
    pub fn inuse_count(&self) -> u64 {
        self.allocs.saturating_sub(self.frees)
    }

    pub fn inuse_bytes(&self) -> u64 {
        self.alloc_size.saturating_sub(self.free_size)
    }

    pub(crate) fn record_alloc(&mut self, bytes: usize) {
        self.allocs += 1;
        self.alloc_size += bytes as u64;
    }

    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.frees += 1;
        self.free_size += bytes as u64;
    }
}

/// Handle to a bucket owned by a [`BucketTable`].
///
/// Handles stay valid for the life of the table; buckets are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u32);

impl BucketId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Aggregate for one distinct call stack.
#[derive(Clone, Copy)]
pub struct Bucket {
    pub stats: Stats,
    hash: u64,
    depth: u32,
    stack: [usize; MAX_STACK_DEPTH],
    next: u32,
}

impl Bucket {
    /// Frames of this bucket's stack, innermost first
    pub fn stack(&self) -> &[usize] {
        &self.stack[..self.depth as usize]
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("stats", &self.stats)
            .field("stack", &self.stack())
            .finish()
    }
}

/// Hash of a stack trace. Frame order matters.
#[inline]
fn stack_hash(stack: &[usize]) -> u64 {
    let mut key = 0u64;
    for &addr in stack {
        key ^= addr as u64;
        key = key.wrapping_mul(0x100000001b3);
    }
    key
}

/// Chained hash table from call stacks to [`Bucket`]s.
///
/// Storage comes from the injected allocator only. Not thread-safe.
pub struct BucketTable<A: RawAllocator + Clone> {
    heads: RawVec<u32, A>,
    buckets: RawVec<Bucket, A>,
}

impl<A: RawAllocator + Clone> BucketTable<A> {
    pub fn new_in(alloc: A) -> Self {
        BucketTable {
            heads: RawVec::new_in(alloc.clone()),
            buckets: RawVec::new_in(alloc),
        }
    }

    /// Number of distinct stacks seen
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Find the bucket for `stack`, creating it on first sight.
    ///
    /// Frames beyond [`MAX_STACK_DEPTH`] are ignored. Returns `None` only
    /// when the allocator is exhausted.
    pub fn get_or_create(&mut self, stack: &[usize]) -> Option<BucketId> {
        let stack = &stack[..stack.len().min(MAX_STACK_DEPTH)];
        if self.heads.is_empty() && !self.heads.reset_filled(HASH_TABLE_SIZE, NO_BUCKET) {
            return None;
        }

        let hash = stack_hash(stack);
        let slot = (hash % HASH_TABLE_SIZE as u64) as usize;

        let mut idx = self.heads[slot];
        while idx != NO_BUCKET {
            let bucket = &self.buckets[idx as usize];
            if bucket.hash == hash && bucket.stack() == stack {
                return Some(BucketId(idx));
            }
            idx = bucket.next;
        }

        let id = u32::try_from(self.buckets.len()).ok().filter(|&id| id != NO_BUCKET)?;
        let mut frames = [0usize; MAX_STACK_DEPTH];
        frames[..stack.len()].copy_from_slice(stack);
        let bucket = Bucket {
            stats: Stats::default(),
            hash,
            depth: stack.len() as u32,
            stack: frames,
            next: self.heads[slot],
        };
        if !self.buckets.push(bucket) {
            return None;
        }
        self.heads[slot] = id;
        Some(BucketId(id))
    }

    pub fn get(&self, id: BucketId) -> Option<&Bucket> {
        self.buckets.get(id.index())
    }

    pub fn get_mut(&mut self, id: BucketId) -> Option<&mut Bucket> {
        self.buckets.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketId, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| (BucketId(i as u32), bucket))
    }
}

/// Render one heap profile line.
///
/// `extra` goes right after the `@`, before the frames; the profile header
/// uses it for ` heapprofile`.
pub fn unparse<W: Write + ?Sized>(
    out: &mut W,
    stats: &Stats,
    stack: &[usize],
    extra: &str,
) -> io::Result<()> {
    write!(
        out,
        "{:6}: {:8} [{:6}: {:8}] @{}",
        stats.inuse_count(),
        stats.inuse_bytes(),
        stats.allocs,
        stats.alloc_size,
        extra
    )?;
    for &pc in stack {
        write!(out, " 0x{pc:016x}")?;
    }
    writeln!(out)
}
