use super::collector::{CollectorOptions, ProfileData, MAX_STACK_DEPTH};
use super::handler::{profile_handler, CallbackToken};
use crate::error::{Error, Result};
use crate::stacktrace::{context_pc, get_stack_trace_with_context};
use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info};

/// Frames between the interrupted code and the walker: the walker itself,
/// the tick callback, the dispatcher and the signal trampoline.
const HANDLER_FRAMES: usize = 3;

/// Decides, in signal context, whether the current tick is recorded.
///
/// Must be async-signal-safe: no allocation, locking, or logging.
pub type ProfileFilter = Arc<dyn Fn() -> bool + Send + Sync>;

/// Options for [`CpuProfiler::start`].
#[derive(Clone, Default)]
pub struct ProfilerOptions {
    /// Ticks per second; the handler's current frequency when `None`
    pub frequency: Option<u32>,
    pub filter: Option<ProfileFilter>,
}

impl fmt::Debug for ProfilerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerOptions")
            .field("frequency", &self.frequency)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl ProfilerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Record only ticks for which `filter` returns true.
    pub fn filter_in_thread<F>(mut self, filter: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Record only ticks delivered to the calling thread.
    pub fn current_thread_only(self) -> Self {
        let me = unsafe { libc::pthread_self() } as usize;
        self.filter_in_thread(move || {
            let current = unsafe { libc::pthread_self() } as usize;
            current == me
        })
    }
}

/// Observable profiler state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfilerState {
    pub enabled: bool,
    pub start_time: Option<SystemTime>,
    pub profile_name: Option<PathBuf>,
    pub samples_gathered: usize,
}

#[derive(Default)]
struct Control {
    token: Option<CallbackToken>,
    profile_name: Option<PathBuf>,
    start_time: Option<SystemTime>,
}

struct Shared {
    control: Mutex<Control>,
    /// Touched by the tick callback while registered, and by control
    /// operations only after unregistering it
    collector: UnsafeCell<ProfileData>,
    filter: UnsafeCell<Option<ProfileFilter>>,
    samples: AtomicUsize,
}

// SAFETY: the cells are only mutated with the control lock held and the
// SIGPROF callback unregistered, or from the one running callback.
unsafe impl Sync for Shared {}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn as_arg(&self) -> *mut c_void {
        self as *const Shared as *mut c_void
    }
}

/// SIGPROF-driven sampling profiler writing one profile per session.
pub struct CpuProfiler {
    shared: Box<Shared>,
}

impl Default for CpuProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProfiler {
    pub fn new() -> Self {
        CpuProfiler {
            shared: Box::new(Shared {
                control: Mutex::new(Control::default()),
                collector: UnsafeCell::new(ProfileData::new()),
                filter: UnsafeCell::new(None),
                samples: AtomicUsize::new(0),
            }),
        }
    }

    /// Open `fname` and start sampling.
    ///
    /// Fails with [`Error::AlreadyStarted`] while a session is running; the
    /// running session is left untouched.
    pub fn start(&self, fname: &Path, options: &ProfilerOptions) -> Result<()> {
        let mut control = self.shared.lock();
        if control.token.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let handler = profile_handler();
        // Checked again when registering; this only avoids touching the file
        if handler.state().callback_count > 0 {
            return Err(Error::Signal("SIGPROF is in use by another profiler".into()));
        }
        if let Some(frequency) = options.frequency {
            handler.set_frequency(frequency)?;
        }
        let frequency = handler.frequency();

        // SAFETY: no callback is registered, nothing else reads the cells
        let collector = unsafe { &mut *self.shared.collector.get() };
        collector.start(fname, CollectorOptions { frequency })?;
        unsafe { *self.shared.filter.get() = options.filter.clone() };
        self.shared.samples.store(0, Ordering::Relaxed);

        let token = match handler.try_register_callback(prof_handler, self.shared.as_arg()) {
            Ok(token) => token,
            Err(e) => {
                collector.stop();
                unsafe { *self.shared.filter.get() = None };
                return Err(e);
            }
        };

        control.token = Some(token);
        control.profile_name = Some(fname.to_path_buf());
        control.start_time = Some(SystemTime::now());
        info!(profile = %fname.display(), frequency, "CPU profiling started");
        Ok(())
    }

    /// Stop sampling and finish the profile. No-op when stopped.
    pub fn stop(&self) {
        let mut control = self.shared.lock();
        let Some(token) = control.token.take() else {
            return;
        };
        profile_handler().unregister_callback(token);

        // SAFETY: unregistering waited for the last callback to return
        unsafe {
            (*self.shared.collector.get()).stop();
            *self.shared.filter.get() = None;
        }
        self.shared.samples.store(0, Ordering::Relaxed);
        control.profile_name = None;
        control.start_time = None;
    }

    /// Write every aggregated sample to the profile without ending the
    /// session. No-op when stopped.
    pub fn flush(&self) -> Result<()> {
        let mut control = self.shared.lock();
        let Some(token) = control.token.take() else {
            return Ok(());
        };
        let handler = profile_handler();
        handler.unregister_callback(token);

        // SAFETY: as in `stop`
        let collector = unsafe { &mut *self.shared.collector.get() };
        collector.flush_table();

        match handler.try_register_callback(prof_handler, self.shared.as_arg()) {
            Ok(token) => {
                control.token = Some(token);
                debug!("CPU profile flushed");
                Ok(())
            }
            Err(e) => {
                collector.stop();
                unsafe { *self.shared.filter.get() = None };
                control.profile_name = None;
                control.start_time = None;
                Err(e)
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.shared.lock().token.is_some()
    }

    pub fn current_state(&self) -> ProfilerState {
        let control = self.shared.lock();
        ProfilerState {
            enabled: control.token.is_some(),
            start_time: control.start_time,
            profile_name: control.profile_name.clone(),
            samples_gathered: self.shared.samples.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CpuProfiler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tick callback: capture the interrupted stack and hand it to the collector.
unsafe fn prof_handler(_sig: c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void, arg: *mut c_void) {
    let shared = unsafe { &*(arg as *const Shared) };

    if let Some(filter) = unsafe { &*shared.filter.get() } {
        if !filter() {
            return;
        }
    }

    let mut stack = [0usize; MAX_STACK_DEPTH];
    let (start, depth) = match unsafe { context_pc(ucontext) } {
        Some(pc) => {
            // The interrupted PC is the innermost frame
            stack[0] = pc;
            let depth = unsafe { get_stack_trace_with_context(&mut stack[1..], HANDLER_FRAMES, ucontext) };
            if depth > 0 && stack[1] == stack[0] {
                (1, depth)
            } else {
                (0, depth + 1)
            }
        }
        None => (0, unsafe { get_stack_trace_with_context(&mut stack, HANDLER_FRAMES, ucontext) }),
    };

    let collector = unsafe { &mut *shared.collector.get() };
    collector.add(&stack[start..start + depth]);
    shared.samples.fetch_add(1, Ordering::Relaxed);
}
