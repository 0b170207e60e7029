//! In-process heap and CPU profiling.
//!
//! - **Heap profiling**: every allocation is attributed to a deduplicated
//!   call-stack bucket in a [`HeapProfileTable`]; snapshots of the table
//!   drive leak checks.
//! - **CPU profiling**: a SIGPROF timer samples the running stack into a
//!   binary profile.
//!
//! # Usage
//!
//! Route allocations through the profiling allocator:
//! ```rust,ignore
//! perftrace::profiler!();
//! ```
//!
//! Then start from the environment (`CPUPROFILE`, `CPUPROFILESIGNAL`,
//! `CPUPROFILE_FREQUENCY`, `HEAPPROFILE`):
//! ```rust,ignore
//! perftrace::cpu::activation::init_from_env()?;
//! // ... run ...
//! perftrace::cpu::activation::shutdown();
//! ```
//!
//! or drive the profilers directly:
//! ```rust,ignore
//! perftrace::profiler_start("app.prof");
//! // ... run ...
//! perftrace::profiler_stop();
//! ```
//!
//! Nothing here allocates through the Rust global allocator while holding
//! the heap profiler's lock; the table, its buckets and the stack trace
//! list get their memory from a [`RawAllocator`].

pub mod arena;
pub mod config;
pub mod cpu;
pub mod error;
pub mod heap;
pub mod stack_trace_table;
pub mod stacktrace;

mod proc_maps;
mod spinlock;

pub use arena::{LibcAllocator, PageHeapAllocator, RawAllocator};
pub use config::{HeapProfilerConfig, ProfilerConfig};
pub use cpu::{
    profiler_flush, profiler_get_current_state, profiler_get_stack_trace, profiler_register_thread,
    profiler_start, profiler_start_with_options, profiler_stop, profiling_is_enabled_for_all_threads,
    CpuProfiler, ProfilerOptions, ProfilerState,
};
pub use error::{Error, Result};
pub use heap::{heap_profiler, HeapProfileTable, HeapProfiler, LeakReport, ProfilingAllocator, Snapshot};
pub use stack_trace_table::{StackTrace, StackTraceTable};
pub use stacktrace::{get_stack_trace, get_stack_trace_with_context};

/// Only one SIGPROF callback can be registered; tests that arm the timer
/// take this lock.
#[cfg(test)]
pub(crate) static SIGPROF_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Install [`ProfilingAllocator`] as the global allocator.
///
/// Allocations are only recorded while the heap profiler runs, so the
/// allocator can be installed unconditionally.
///
/// # Examples
///
/// ```rust,ignore
/// perftrace::profiler!();
///
/// fn main() {
///     perftrace::heap_profiler().start(&perftrace::HeapProfilerConfig::default());
/// }
/// ```
#[macro_export]
macro_rules! profiler {
    () => {
        #[global_allocator]
        static __PERFTRACE_ALLOC: $crate::ProfilingAllocator = $crate::ProfilingAllocator::new();
    };
}
