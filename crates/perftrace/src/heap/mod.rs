//! Heap profiling: allocation table, buckets, snapshots and the profiler
//! that feeds them from the global allocator.

mod address_map;
mod allocator;
mod bucket;
mod profiler;
mod snapshot;
mod table;

pub use address_map::AddressMap;
pub use allocator::ProfilingAllocator;
pub use bucket::{unparse, Bucket, BucketId, BucketTable, Stats, MAX_STACK_DEPTH};
pub use profiler::{heap_profiler, HeapProfiler};
pub use snapshot::{LeakGroup, LeakReport, Snapshot};
pub use table::{AllocInfo, AllocValue, HeapProfileTable, FILE_EXT, PROFILE_HEADER};
