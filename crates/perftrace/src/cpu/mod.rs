//! CPU profiling: SIGPROF sampling into a binary profile.
//!
//! The free functions drive the process-wide profiler returned by
//! [`activation::global`]. They report failure as `false` and log the
//! cause; [`CpuProfiler`] exposes the same operations with `Result`.

pub mod activation;
mod collector;
mod handler;
mod profiler;

pub use collector::{CollectorOptions, ProfileData, MAX_STACK_DEPTH};
pub use handler::{profile_handler, CallbackToken, ProfileCallback, ProfileHandler, ProfileHandlerState};
pub use profiler::{CpuProfiler, ProfileFilter, ProfilerOptions, ProfilerState};

use std::path::Path;
use tracing::warn;

/// Start profiling into `fname` with default options.
pub fn profiler_start(fname: impl AsRef<Path>) -> bool {
    profiler_start_with_options(fname, &ProfilerOptions::default())
}

/// Start profiling into `fname`. False if already running or the file
/// cannot be opened.
pub fn profiler_start_with_options(fname: impl AsRef<Path>, options: &ProfilerOptions) -> bool {
    let fname = fname.as_ref();
    match activation::global().start(fname, options) {
        Ok(()) => true,
        Err(e) => {
            warn!(profile = %fname.display(), error = %e, "cannot start CPU profiler");
            false
        }
    }
}

pub fn profiler_stop() {
    activation::global().stop();
}

/// Write aggregated samples to the profile without stopping.
pub fn profiler_flush() {
    if let Err(e) = activation::global().flush() {
        warn!(error = %e, "CPU profile flush failed");
    }
}

/// True while the global profiler is running. `ITIMER_PROF` samples every
/// thread, so no per-thread registration is needed.
pub fn profiling_is_enabled_for_all_threads() -> bool {
    activation::global().enabled()
}

pub fn profiler_get_current_state() -> ProfilerState {
    activation::global().current_state()
}

pub fn profiler_register_thread() {
    profile_handler().register_thread();
}

/// Walk the calling thread's stack into `result`, dropping `skip` frames
/// above the caller. Returns the number of frames written.
#[inline(never)]
pub fn profiler_get_stack_trace(result: &mut [usize], skip: usize) -> usize {
    crate::stacktrace::get_stack_trace(result, skip + 1)
}
