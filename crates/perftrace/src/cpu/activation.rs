//! Process-wide profiler setup from the environment.
//!
//! `CPUPROFILE` starts the global CPU profiler right away, unless
//! `CPUPROFILESIGNAL` names a signal: then each delivery of that signal
//! toggles a session writing `CPUPROFILE.0`, `CPUPROFILE.1`, and so on.
//! `HEAPPROFILE` starts the global heap profiler.

use super::handler::errno_location;
use super::profiler::{CpuProfiler, ProfilerOptions};
use crate::config::{HeapProfilerConfig, ProfilerConfig};
use crate::error::{Error, Result};
use crate::heap::heap_profiler;
use nix::unistd::{geteuid, getuid, pipe};
use std::ffi::{c_int, OsString};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

static PROFILER: OnceLock<CpuProfiler> = OnceLock::new();

/// Write end of the toggle pipe, -1 until a toggle signal is installed
static TOGGLE_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
static TOGGLE_INSTALLED: AtomicBool = AtomicBool::new(false);

/// The process-wide CPU profiler.
pub fn global() -> &'static CpuProfiler {
    PROFILER.get_or_init(CpuProfiler::new)
}

/// What the CPU side of activation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuActivation {
    /// No output configured
    Disabled,
    /// Profiling into this file
    Started(PathBuf),
    /// Waiting for `signal` to toggle sessions named `prefix.N`
    Toggle { signal: i32, prefix: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub cpu: CpuActivation,
    pub heap_profiling: bool,
}

/// Read the profiler variables and start whatever they ask for.
pub fn init_from_env() -> Result<Activation> {
    let cpu = ProfilerConfig::from_env()?;
    let heap = HeapProfilerConfig::from_env()?;
    init_with_config(&cpu, &heap)
}

pub fn init_with_config(cpu: &ProfilerConfig, heap: &HeapProfilerConfig) -> Result<Activation> {
    cpu.validate()?;

    if (cpu.output.is_some() || heap.prefix.is_some()) && running_setuid() {
        return Err(Error::PermissionDenied(
            "process is running setuid; profiles would be written with elevated privileges".into(),
        ));
    }

    let heap_profiling = match heap.prefix {
        Some(ref prefix) => {
            if !heap_profiler().start(heap) {
                debug!("heap profiler was already running");
            }
            info!(prefix = %prefix.display(), "heap profiling enabled");
            heap_profiler().is_running()
        }
        None => false,
    };

    let Some(output) = cpu.output.clone() else {
        return Ok(Activation {
            cpu: CpuActivation::Disabled,
            heap_profiling,
        });
    };
    let options = ProfilerOptions::new().with_frequency(cpu.frequency);

    let cpu = match cpu.toggle_signal {
        None => {
            global().start(&output, &options)?;
            CpuActivation::Started(output)
        }
        Some(signal) => {
            install_toggle(signal, output.clone(), options)?;
            info!(signal, prefix = %output.display(), "CPU profiling armed on signal");
            CpuActivation::Toggle {
                signal,
                prefix: output,
            }
        }
    };

    Ok(Activation {
        cpu,
        heap_profiling,
    })
}

/// Flush and stop the global profilers. The heap profiler writes a final
/// numbered dump when it has a prefix.
pub fn shutdown() {
    if let Some(profiler) = PROFILER.get() {
        if let Err(e) = profiler.flush() {
            warn!(error = %e, "CPU profile flush failed");
        }
        profiler.stop();
    }

    let heap = heap_profiler();
    if heap.is_running() {
        match heap.dump_next() {
            Ok(Some(path)) => info!(path = %path.display(), "final heap profile written"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "final heap profile dump failed"),
        }
        heap.stop();
    }
}

fn running_setuid() -> bool {
    getuid() != geteuid()
}

/// `prefix.n`
fn toggled_profile_path(prefix: &Path, n: u32) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

extern "C" fn toggle_signal_handler(_sig: c_int) {
    let errno = errno_location();
    let saved_errno = unsafe { *errno };
    let fd = TOGGLE_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
    unsafe { *errno = saved_errno };
}

fn install_toggle(signal: i32, prefix: PathBuf, options: ProfilerOptions) -> Result<()> {
    if TOGGLE_INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(Error::Signal("a toggle signal is already installed".into()));
    }
    let result = install_toggle_inner(signal, prefix, options);
    if result.is_err() {
        TOGGLE_INSTALLED.store(false, Ordering::SeqCst);
    }
    result
}

fn install_toggle_inner(signal: i32, prefix: PathBuf, options: ProfilerOptions) -> Result<()> {
    unsafe {
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, std::ptr::null(), &mut old) < 0 {
            return Err(Error::last_signal_error("sigaction"));
        }
        if old.sa_sigaction != libc::SIG_DFL {
            return Err(Error::Signal(format!(
                "signal {signal} already has a handler; choose another CPUPROFILESIGNAL"
            )));
        }
    }

    let (read_end, write_end) = pipe()?;
    TOGGLE_PIPE_WRITE.store(write_end.as_raw_fd(), Ordering::SeqCst);

    if let Err(e) = set_toggle_action(signal, toggle_signal_handler as *const () as usize) {
        TOGGLE_PIPE_WRITE.store(-1, Ordering::SeqCst);
        return Err(e);
    }

    let reader = File::from(read_end);
    let spawned = std::thread::Builder::new()
        .name("perftrace-toggle".into())
        .spawn(move || toggle_loop(reader, prefix, options));
    if let Err(e) = spawned {
        let _ = set_toggle_action(signal, libc::SIG_DFL);
        TOGGLE_PIPE_WRITE.store(-1, Ordering::SeqCst);
        return Err(e.into());
    }

    // Stays open for the life of the process
    let _ = write_end.into_raw_fd();
    Ok(())
}

fn set_toggle_action(signal: i32, action: libc::sighandler_t) -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = action;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signal, &sa, std::ptr::null_mut()) < 0 {
            return Err(Error::last_signal_error("sigaction"));
        }
    }
    Ok(())
}

/// Start and stop sessions outside signal context, one per pipe byte.
fn toggle_loop(mut pipe: File, prefix: PathBuf, options: ProfilerOptions) {
    let mut sessions = 0u32;
    let mut byte = [0u8; 1];
    loop {
        match pipe.read(&mut byte) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "toggle pipe read failed; CPU profiling toggle disabled");
                return;
            }
        }

        let profiler = global();
        if profiler.enabled() {
            profiler.stop();
            continue;
        }

        let path = toggled_profile_path(&prefix, sessions);
        sessions += 1;
        if let Err(e) = profiler.start(&path, &options) {
            error!(path = %path.display(), error = %e, "cannot turn on CPU profiling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn toggled_paths_are_numbered_from_zero() {
        let prefix = Path::new("/tmp/app.prof");
        assert_eq!(toggled_profile_path(prefix, 0), PathBuf::from("/tmp/app.prof.0"));
        assert_eq!(toggled_profile_path(prefix, 12), PathBuf::from("/tmp/app.prof.12"));
    }

    #[test]
    fn nothing_configured_is_disabled() {
        let activation =
            init_with_config(&ProfilerConfig::default(), &HeapProfilerConfig::default()).unwrap();
        assert_eq!(activation.cpu, CpuActivation::Disabled);
        assert!(!activation.heap_profiling);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ProfilerConfig::default().with_output("/tmp/x.prof").with_frequency(0);
        assert!(matches!(
            init_with_config(&config, &HeapProfilerConfig::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn handled_toggle_signal_is_rejected() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let handled = libc::SIGUSR2;
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut sa.sa_mask);
            assert_eq!(libc::sigaction(handled, &sa, std::ptr::null_mut()), 0);
        }

        let config = ProfilerConfig::default()
            .with_output(dir.path().join("cpu.prof"))
            .with_toggle_signal(handled);
        let err = init_with_config(&config, &HeapProfilerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Signal(_)));
    }

    #[test]
    fn failed_toggle_install_releases_the_pipe() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        // Another test may own the toggle; run the install steps directly
        let previous = TOGGLE_PIPE_WRITE.swap(-1, Ordering::SeqCst);

        // SIGKILL reports SIG_DFL but cannot be caught
        let err = install_toggle_inner(libc::SIGKILL, dir.path().join("cpu.prof"), ProfilerOptions::new())
            .unwrap_err();
        let pipe_after = TOGGLE_PIPE_WRITE.swap(previous, Ordering::SeqCst);
        assert!(matches!(err, Error::Signal(_)));
        assert_eq!(pipe_after, -1);
    }

    #[test]
    fn toggle_handler_preserves_errno() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // A descriptor that is not open, so the write fails with EBADF
        let previous = TOGGLE_PIPE_WRITE.swap(1 << 20, Ordering::SeqCst);
        let errno = errno_location();
        unsafe { *errno = libc::EAGAIN };
        toggle_signal_handler(libc::SIGUSR1);
        let after = unsafe { *errno };
        TOGGLE_PIPE_WRITE.store(previous, Ordering::SeqCst);
        assert_eq!(after, libc::EAGAIN);
    }

    #[test]
    fn toggle_signal_starts_and_stops_sessions() {
        let _lock = crate::SIGPROF_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("toggled.prof");
        let config = ProfilerConfig::default()
            .with_output(&prefix)
            .with_toggle_signal(libc::SIGUSR1);

        let activation = init_with_config(&config, &HeapProfilerConfig::default()).unwrap();
        assert_eq!(
            activation.cpu,
            CpuActivation::Toggle {
                signal: libc::SIGUSR1,
                prefix: prefix.clone()
            }
        );

        let wait_for = |want: bool| {
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while global().enabled() != want && std::time::Instant::now() < deadline {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            global().enabled() == want
        };

        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(wait_for(true));
        assert_eq!(
            global().current_state().profile_name,
            Some(toggled_profile_path(&prefix, 0))
        );

        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(wait_for(false));
        assert!(toggled_profile_path(&prefix, 0).exists());
    }
}
