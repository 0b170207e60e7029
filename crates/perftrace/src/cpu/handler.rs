//! SIGPROF dispatch.
//!
//! One process-wide handler owns the SIGPROF action and the `ITIMER_PROF`
//! timer. At most one callback is registered at a time. The timer runs only
//! while a callback is registered.

use crate::config::{DEFAULT_FREQUENCY, MAX_FREQUENCY};
use crate::error::{Error, Result};
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::debug;

/// Called on every tick with the signal arguments and the registered `arg`.
///
/// Runs in signal context: it must not allocate, lock, or log.
pub type ProfileCallback =
    unsafe fn(sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void, arg: *mut c_void);

struct Registered {
    callback: ProfileCallback,
    arg: *mut c_void,
}

/// Proof of registration, consumed by [`ProfileHandler::unregister_callback`].
#[derive(Debug)]
pub struct CallbackToken {
    registered: *mut Registered,
}

// SAFETY: the token is only compared against the handler's slot and freed there.
unsafe impl Send for CallbackToken {}

/// Observable handler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileHandlerState {
    pub frequency: u32,
    pub callback_count: usize,
    pub interrupts: u64,
    pub registered_threads: usize,
    pub timer_armed: bool,
}

#[derive(Default)]
struct Control {
    installed: bool,
    timer_armed: bool,
}

pub struct ProfileHandler {
    callback: AtomicPtr<Registered>,
    /// Set while a callback invocation is running
    busy: AtomicBool,
    frequency: AtomicU32,
    interrupts: AtomicU64,
    registered_threads: AtomicUsize,
    control: Mutex<Control>,
}

static HANDLER: OnceLock<ProfileHandler> = OnceLock::new();

/// The process-wide SIGPROF handler.
pub fn profile_handler() -> &'static ProfileHandler {
    HANDLER.get_or_init(ProfileHandler::new)
}

pub(super) fn errno_location() -> *mut c_int {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        libc::__error()
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    unsafe {
        libc::__errno_location()
    }
}

extern "C" fn sigprof_handler(sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let errno = errno_location();
    let saved_errno = unsafe { *errno };
    if let Some(handler) = HANDLER.get() {
        handler.dispatch(sig, info, ucontext);
    }
    unsafe { *errno = saved_errno };
}

fn timer(period_usec: i64) -> libc::itimerval {
    let tv = libc::timeval {
        tv_sec: (period_usec / 1_000_000) as libc::time_t,
        tv_usec: (period_usec % 1_000_000) as libc::suseconds_t,
    };
    libc::itimerval {
        it_interval: tv,
        it_value: tv,
    }
}

impl ProfileHandler {
    fn new() -> Self {
        ProfileHandler {
            callback: AtomicPtr::new(std::ptr::null_mut()),
            busy: AtomicBool::new(false),
            frequency: AtomicU32::new(DEFAULT_FREQUENCY),
            interrupts: AtomicU64::new(0),
            registered_threads: AtomicUsize::new(0),
            control: Mutex::new(Control::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn dispatch(&self, sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        // One invocation at a time
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let registered = self.callback.load(Ordering::SeqCst);
        if !registered.is_null() {
            unsafe {
                let registered = &*registered;
                (registered.callback)(sig, info, ucontext, registered.arg);
            }
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Ticks per second used the next time the timer is armed.
    pub fn set_frequency(&self, frequency: u32) -> Result<()> {
        if frequency == 0 || frequency > MAX_FREQUENCY {
            return Err(Error::InvalidArgument(format!(
                "CPU frequency must be between 1 and {MAX_FREQUENCY} Hz, got {frequency}"
            )));
        }
        self.frequency.store(frequency, Ordering::Relaxed);
        Ok(())
    }

    pub fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Note a thread that wants samples. `ITIMER_PROF` already covers
    /// every thread, so this only counts.
    pub fn register_thread(&self) {
        self.registered_threads.fetch_add(1, Ordering::Relaxed);
    }

    /// Install `callback` and start the timer.
    ///
    /// # Panics
    ///
    /// If a callback is already registered.
    pub fn register_callback(&self, callback: ProfileCallback, arg: *mut c_void) -> Result<CallbackToken> {
        let mut control = self.lock();
        assert!(
            self.callback.load(Ordering::SeqCst).is_null(),
            "SIGPROF handler already registered"
        );
        self.register_locked(&mut control, callback, arg)
    }

    /// Like [`register_callback`](Self::register_callback), but fails with
    /// [`Error::Signal`] when another callback holds the handler.
    pub fn try_register_callback(&self, callback: ProfileCallback, arg: *mut c_void) -> Result<CallbackToken> {
        let mut control = self.lock();
        if !self.callback.load(Ordering::SeqCst).is_null() {
            return Err(Error::Signal("SIGPROF is in use by another profiler".into()));
        }
        self.register_locked(&mut control, callback, arg)
    }

    fn register_locked(
        &self,
        control: &mut Control,
        callback: ProfileCallback,
        arg: *mut c_void,
    ) -> Result<CallbackToken> {
        if !control.installed {
            Self::install_signal_handler()?;
            control.installed = true;
        }

        let registered = Box::into_raw(Box::new(Registered { callback, arg }));
        self.callback.store(registered, Ordering::SeqCst);

        if let Err(e) = self.arm_timer(control) {
            self.callback.store(std::ptr::null_mut(), Ordering::SeqCst);
            self.wait_idle();
            drop(unsafe { Box::from_raw(registered) });
            return Err(e);
        }

        debug!(frequency = self.frequency(), "SIGPROF callback registered");
        Ok(CallbackToken { registered })
    }

    /// Remove the callback behind `token`, stop the timer, and wait for any
    /// running invocation to finish.
    ///
    /// # Panics
    ///
    /// If `token` does not name the registered callback.
    pub fn unregister_callback(&self, token: CallbackToken) {
        let mut control = self.lock();
        assert!(
            self.callback.load(Ordering::SeqCst) == token.registered,
            "SIGPROF handler is not registered"
        );

        self.disarm_timer(&mut control);
        self.callback.store(std::ptr::null_mut(), Ordering::SeqCst);
        self.wait_idle();
        drop(unsafe { Box::from_raw(token.registered) });
        debug!("SIGPROF callback unregistered");
    }

    fn wait_idle(&self) {
        while self.busy.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
    }

    pub fn state(&self) -> ProfileHandlerState {
        let control = self.lock();
        ProfileHandlerState {
            frequency: self.frequency(),
            callback_count: usize::from(!self.callback.load(Ordering::SeqCst).is_null()),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            registered_threads: self.registered_threads.load(Ordering::Relaxed),
            timer_armed: control.timer_armed,
        }
    }

    fn install_signal_handler() -> Result<()> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigprof_handler as *const () as usize;
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);

            if libc::sigaction(libc::SIGPROF, &sa, std::ptr::null_mut()) < 0 {
                return Err(Error::last_signal_error("sigaction(SIGPROF)"));
            }
        }
        Ok(())
    }

    fn arm_timer(&self, control: &mut Control) -> Result<()> {
        let period_usec = 1_000_000 / i64::from(self.frequency().max(1));
        let value = timer(period_usec);
        if unsafe { libc::setitimer(libc::ITIMER_PROF, &value, std::ptr::null_mut()) } < 0 {
            return Err(Error::last_timer_error("setitimer(ITIMER_PROF)"));
        }
        control.timer_armed = true;
        Ok(())
    }

    fn disarm_timer(&self, control: &mut Control) {
        let value = timer(0);
        unsafe { libc::setitimer(libc::ITIMER_PROF, &value, std::ptr::null_mut()) };
        control.timer_armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    static TICKS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_tick(_sig: c_int, _info: *mut libc::siginfo_t, _uc: *mut c_void, arg: *mut c_void) {
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn burn_cpu_until(done: impl Fn() -> bool, limit: Duration) {
        let start = Instant::now();
        let mut x = 0u64;
        while !done() && start.elapsed() < limit {
            for i in 0..100_000u64 {
                x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(i));
            }
        }
    }

    #[test]
    fn timer_values_split_seconds() {
        let t = timer(1_000_000);
        assert_eq!((t.it_interval.tv_sec, t.it_interval.tv_usec), (1, 0));
        let t = timer(10_000);
        assert_eq!((t.it_value.tv_sec, t.it_value.tv_usec), (0, 10_000));
    }

    #[test]
    fn rejects_invalid_frequency() {
        let handler = profile_handler();
        assert!(handler.set_frequency(0).is_err());
        assert!(handler.set_frequency(MAX_FREQUENCY + 1).is_err());
    }

    #[test]
    fn registered_callback_receives_ticks() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let handler = profile_handler();
        let arg = &TICKS as *const AtomicUsize as *mut c_void;

        let token = handler.register_callback(count_tick, arg).unwrap();
        let state = handler.state();
        assert_eq!(state.callback_count, 1);
        assert!(state.timer_armed);

        burn_cpu_until(|| TICKS.load(Ordering::Relaxed) > 0, Duration::from_secs(10));
        handler.unregister_callback(token);
        assert!(TICKS.load(Ordering::Relaxed) > 0);

        let state = handler.state();
        assert_eq!(state.callback_count, 0);
        assert!(!state.timer_armed);
    }

    #[test]
    #[should_panic(expected = "SIGPROF handler already registered")]
    fn double_registration_panics() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let handler = profile_handler();
        let arg = &TICKS as *const AtomicUsize as *mut c_void;
        let _first = handler.register_callback(count_tick, arg).unwrap();
        // The panic leaves the first callback registered; reset for the
        // tests that follow
        let _reset = ResetOnDrop;
        let _second = handler.register_callback(count_tick, arg);
    }

    #[test]
    fn try_register_refuses_while_occupied() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let handler = profile_handler();
        let arg = &TICKS as *const AtomicUsize as *mut c_void;

        let first = handler.try_register_callback(count_tick, arg).unwrap();
        let second = handler.try_register_callback(count_tick, arg);
        assert!(matches!(second, Err(Error::Signal(_))));
        assert_eq!(handler.state().callback_count, 1);

        handler.unregister_callback(first);
        assert_eq!(handler.state().callback_count, 0);
    }

    #[test]
    fn register_thread_is_counted() {
        let handler = profile_handler();
        let before = handler.state().registered_threads;
        handler.register_thread();
        assert!(handler.state().registered_threads > before);
    }

    /// Clears whatever callback is registered when dropped, even on panic.
    struct ResetOnDrop;

    impl Drop for ResetOnDrop {
        fn drop(&mut self) {
            let handler = profile_handler();
            let current = handler.callback.load(Ordering::SeqCst);
            if !current.is_null() {
                handler.unregister_callback(CallbackToken { registered: current });
            }
        }
    }
}
