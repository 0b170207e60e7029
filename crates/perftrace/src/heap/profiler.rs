//! Process-wide heap profiler fed by [`ProfilingAllocator`](super::ProfilingAllocator).

use super::bucket::MAX_STACK_DEPTH;
use super::snapshot::{write_leak_profile, LeakReport, Snapshot};
use super::table::HeapProfileTable;
use crate::config::HeapProfilerConfig;
use crate::error::{Error, Result};
use crate::proc_maps::write_mapped_libraries;
use crate::spinlock::SpinLock;
use crate::stack_trace_table::{write_sampled_profile, StackTrace, StackTraceTable};
use std::cell::Cell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

thread_local! {
    /// Set while this thread is inside the profiler. Allocations made then
    /// go straight to libc untracked.
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
}

/// Holds the per-thread profiler flag for the guard's lifetime.
struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        IN_PROFILER
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false)
            .then_some(ReentrancyGuard)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_PROFILER.try_with(|flag| flag.set(false));
    }
}

struct HeapState {
    table: HeapProfileTable,
    sampled: StackTraceTable,
    sample_interval: usize,
    bytes_until_sample: usize,
    prefix: Option<PathBuf>,
    dumps: u32,
}

pub struct HeapProfiler {
    enabled: AtomicBool,
    state: SpinLock<Option<HeapState>>,
}

static HEAP_PROFILER: HeapProfiler = HeapProfiler::new();

/// The heap profiler fed by [`ProfilingAllocator`](super::ProfilingAllocator).
pub fn heap_profiler() -> &'static HeapProfiler {
    &HEAP_PROFILER
}

impl HeapProfiler {
    pub const fn new() -> Self {
        HeapProfiler {
            enabled: AtomicBool::new(false),
            state: SpinLock::new(None),
        }
    }

    /// Start tracking. Returns false if already running.
    pub fn start(&self, config: &HeapProfilerConfig) -> bool {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return false;
        };
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(HeapState {
            table: HeapProfileTable::new(),
            sampled: StackTraceTable::new(),
            sample_interval: config.sample_interval,
            bytes_until_sample: config.sample_interval,
            prefix: config.prefix.clone(),
            dumps: 0,
        });
        self.enabled.store(true, Ordering::Release);
        drop(state);

        info!(sample_interval = config.sample_interval, "heap profiler started");
        true
    }

    /// Stop tracking and discard the table. Returns false if not running.
    pub fn stop(&self) -> bool {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return false;
        };
        self.enabled.store(false, Ordering::Release);
        let old = self.state.lock().take();
        let was_running = old.is_some();
        drop(old);
        if was_running {
            info!("heap profiler stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record an allocation. `skip` frames above the caller are left out of
    /// the recorded stack.
    #[inline(never)]
    pub fn record_alloc(&self, ptr: *mut u8, size: usize, skip: usize) {
        if !self.is_running() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };

        let mut stack = [0usize; MAX_STACK_DEPTH];
        let depth = HeapProfileTable::get_caller_stack_trace(skip + 1, &mut stack);
        let stack = &stack[..depth];

        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return;
        };
        state.table.record_alloc(ptr as usize, size, stack);

        if state.sample_interval > 0 {
            if size >= state.bytes_until_sample {
                state.bytes_until_sample = state.sample_interval;
                state.sampled.add_trace(&StackTrace::new(size, stack));
            } else {
                state.bytes_until_sample -= size;
            }
        }
    }

    pub fn record_free(&self, ptr: *mut u8) {
        if !self.is_running() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        if let Some(state) = self.state.lock().as_mut() {
            state.table.record_free(ptr as usize);
        }
    }

    /// Run `f` on the live table with tracking paused for this thread.
    ///
    /// Allocations and frees made by this thread inside `f` are not
    /// recorded. Returns `None` when the profiler is not running or when
    /// called from inside another profiler operation.
    pub fn with_table<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut HeapProfileTable) -> R,
    {
        let _guard = ReentrancyGuard::enter()?;
        let mut state = self.state.lock();
        state.as_mut().map(|state| f(&mut state.table))
    }

    pub fn take_snapshot(&self) -> Option<Snapshot> {
        self.with_table(|table| table.take_snapshot()).flatten()
    }

    pub fn non_live_snapshot(&self, base: Option<&Snapshot>) -> Option<Snapshot> {
        self.with_table(|table| table.non_live_snapshot(base)).flatten()
    }

    pub fn mark_as_live(&self, ptr: *const u8) -> bool {
        self.with_table(|table| table.mark_as_live(ptr as usize))
            .unwrap_or(false)
    }

    pub fn mark_as_ignored(&self, ptr: *const u8) {
        self.with_table(|table| table.mark_as_ignored(ptr as usize));
    }

    /// Write `snapshot`'s objects as a leak report profile to `filename`.
    ///
    /// Groups and profile text are built under the lock; logging and file
    /// output happen after it is released.
    pub fn report_leaks(
        &self,
        snapshot: &Snapshot,
        checker_name: &str,
        filename: &Path,
    ) -> Result<LeakReport> {
        let (report, body) = self
            .with_table(|table| {
                let report = snapshot.leak_report(table);
                let mut body = Vec::new();
                snapshot
                    .write_buckets(table, &mut body)
                    .map(|()| (report, body))
            })
            .ok_or_else(|| Error::InvalidArgument("heap profiler is not running".into()))??;

        report.log(checker_name);
        write_leak_profile(filename, &body)?;
        debug!(path = %filename.display(), objects = report.leaked_objects, "leak profile written");
        Ok(report)
    }

    /// Write the current heap profile to `path`.
    pub fn dump_profile(&self, path: &Path) -> Result<()> {
        // Render under the lock, write after releasing it
        let rendered = self
            .with_table(|table| {
                let mut buf = Vec::new();
                table.write_buckets(&mut buf).map(|()| buf)
            })
            .ok_or_else(|| Error::InvalidArgument("heap profiler is not running".into()))??;

        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&rendered)?;
        write_mapped_libraries(&mut file)?;
        file.flush()?;
        debug!(path = %path.display(), bytes = rendered.len(), "heap profile written");
        Ok(())
    }

    /// Write the next numbered dump, `prefix.NNNN.heap`.
    ///
    /// Returns the path written, or `None` when no prefix is configured.
    pub fn dump_next(&self) -> Result<Option<PathBuf>> {
        let next = {
            let Some(_guard) = ReentrancyGuard::enter() else {
                return Ok(None);
            };
            let mut state = self.state.lock();
            match state.as_mut() {
                Some(state) => state.prefix.clone().map(|prefix| {
                    state.dumps += 1;
                    (prefix, state.dumps)
                }),
                None => None,
            }
        };
        let Some((prefix, seq)) = next else {
            return Ok(None);
        };

        let path = HeapProfilerConfig::default()
            .with_prefix(prefix)
            .dump_path(seq)
            .ok_or_else(|| Error::InvalidArgument("heap profile prefix is not set".into()))?;
        self.dump_profile(&path)?;
        Ok(Some(path))
    }

    /// Drain the sampled stack traces as `[1, size, depth, pc...]* 0`.
    ///
    /// The list is detached under the lock and formatted after releasing
    /// it. `None` if the output could not be allocated or samples were lost.
    pub fn take_sampled_traces(&self) -> Option<Box<[usize]>> {
        let mut detached = {
            let _guard = ReentrancyGuard::enter()?;
            let mut state = self.state.lock();
            std::mem::take(&mut state.as_mut()?.sampled)
        };
        detached.read_stack_traces_and_clear()
    }

    /// Drain the sampled traces into a heap profile at `path`.
    pub fn dump_sampled(&self, path: &Path) -> Result<usize> {
        let dump = self.take_sampled_traces().ok_or_else(|| {
            Error::Io(std::io::Error::other("sampled stack traces were lost"))
        })?;
        let mut out = BufWriter::new(File::create(path)?);
        write_sampled_profile(&dump, &mut out)?;
        out.flush()?;
        Ok(crate::stack_trace_table::dump_records(&dump).count())
    }
}

impl Default for HeapProfiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    // A private instance, so tests do not depend on the global allocator
    fn running(sample_interval: usize) -> HeapProfiler {
        let profiler = HeapProfiler::new();
        assert!(profiler.start(&HeapProfilerConfig::default().with_sample_interval(sample_interval)));
        profiler
    }

    #[test]
    fn records_only_while_running() {
        let profiler = HeapProfiler::new();
        profiler.record_alloc(0x1000 as *mut u8, 16, 0);
        assert!(profiler.with_table(|t| t.total()).is_none());

        assert!(profiler.start(&HeapProfilerConfig::default()));
        assert!(!profiler.start(&HeapProfilerConfig::default()));
        profiler.record_alloc(0x1000 as *mut u8, 16, 0);
        profiler.record_alloc(0x2000 as *mut u8, 32, 0);
        profiler.record_free(0x1000 as *mut u8);

        let total = profiler.with_table(|t| t.total()).unwrap();
        assert_eq!((total.allocs, total.frees), (2, 1));
        assert_eq!(total.inuse_bytes(), 32);

        assert!(profiler.stop());
        assert!(!profiler.stop());
        assert!(!profiler.is_running());
    }

    #[test]
    fn nested_calls_are_not_recorded() {
        let profiler = running(0);
        profiler.with_table(|_| {
            profiler.record_alloc(0x1000 as *mut u8, 16, 0);
            assert!(profiler.with_table(|_| ()).is_none());
        });
        assert_eq!(profiler.with_table(|t| t.total().allocs), Some(0));
    }

    #[test]
    fn samples_one_trace_per_interval() {
        let profiler = running(100);
        for i in 0..10usize {
            profiler.record_alloc((0x1000 + i * 0x100) as *mut u8, 30, 0);
        }
        // 300 bytes at a 100 byte interval
        let dump = profiler.take_sampled_traces().unwrap();
        let records: Vec<_> = crate::stack_trace_table::dump_records(&dump).collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(size, _)| *size == 30));

        // Draining detached the list
        let empty = profiler.take_sampled_traces().unwrap();
        assert_eq!(&*empty, &[0]);
    }

    #[test]
    fn dumps_numbered_profiles() {
        let dir = TempDir::new().unwrap();
        let profiler = HeapProfiler::new();
        profiler.start(&HeapProfilerConfig::default().with_prefix(dir.path().join("run")));
        profiler.record_alloc(0x1000 as *mut u8, 64, 0);

        let first = profiler.dump_next().unwrap().unwrap();
        let second = profiler.dump_next().unwrap().unwrap();
        assert_eq!(first, dir.path().join("run.0001.heap"));
        assert_eq!(second, dir.path().join("run.0002.heap"));

        let text = std::fs::read_to_string(first).unwrap();
        assert!(text.starts_with("heap profile:      1:       64 [     1:       64] @ heapprofile\n"));
    }

    #[test]
    fn leak_check_through_profiler() {
        let dir = TempDir::new().unwrap();
        let profiler = running(0);
        profiler.record_alloc(0x1000 as *mut u8, 8, 0);
        let base = profiler.take_snapshot().unwrap();
        profiler.record_alloc(0x2000 as *mut u8, 24, 0);
        profiler.record_alloc(0x3000 as *mut u8, 40, 0);
        profiler.mark_as_ignored(0x3000 as *const u8);

        let leaks = profiler.non_live_snapshot(Some(&base)).unwrap();
        let report = profiler
            .report_leaks(&leaks, "unit", &dir.path().join("unit.leaks.heap"))
            .unwrap();
        assert_eq!(report.leaked_objects, 1);
        assert_eq!(report.leaked_bytes, 24);
    }

    static LOGGING_PROFILER: HeapProfiler = HeapProfiler::new();

    /// Records whether the table could be taken while an event was written.
    #[derive(Clone, Default)]
    struct TableAccessWriter {
        reachable: Arc<Mutex<Vec<bool>>>,
    }

    impl io::Write for TableAccessWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let reachable = LOGGING_PROFILER.with_table(|_| ()).is_some();
            self.reachable.lock().unwrap().push(reachable);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn leak_report_logs_after_releasing_the_table() {
        let dir = TempDir::new().unwrap();
        let profiler = &LOGGING_PROFILER;
        assert!(profiler.start(&HeapProfilerConfig::default().with_sample_interval(0)));
        profiler.record_alloc(0x1000 as *mut u8, 48, 0);
        profiler.record_alloc(0x2000 as *mut u8, 16, 0);
        let leaks = profiler.non_live_snapshot(None).unwrap();

        let access = TableAccessWriter::default();
        let writer = access.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        let report = tracing::subscriber::with_default(subscriber, || {
            profiler.report_leaks(&leaks, "unlocked", &dir.path().join("unlocked.leaks.heap"))
        })
        .unwrap();

        assert_eq!(report.leaked_objects, 2);
        let reachable = access.reachable.lock().unwrap();
        assert!(!reachable.is_empty());
        assert!(reachable.iter().all(|&r| r));

        // The trailer is still written
        let text = std::fs::read_to_string(dir.path().join("unlocked.leaks.heap")).unwrap();
        assert!(text.contains("\nMAPPED_LIBRARIES:\n"));
        drop(leaks);
        profiler.stop();
    }
}
