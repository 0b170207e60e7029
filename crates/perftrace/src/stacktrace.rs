//! Stack capture for allocation sites and SIGPROF samples.
//!
//! Both walkers write raw return addresses into a caller-provided buffer and
//! never allocate, so they can run inside the global allocator and inside a
//! signal handler.

use backtrace::trace_unsynchronized;
use std::cell::Cell;
use std::ffi::c_void;

/// Frames after `skip` that are searched for the interrupted PC
const CONTEXT_SEARCH_FRAMES: usize = 8;

/// Leading frames searched for the walker's own frame
const ANCHOR_SEARCH_FRAMES: usize = 16;

thread_local! {
    /// Set while this thread is inside the unwinder. A signal landing then
    /// must not unwind again: the unwinder's locks are not reentrant.
    static UNWINDING: Cell<bool> = const { Cell::new(false) };
}

/// Run `walk` with the per-thread unwinding flag held.
/// Returns `None` if the flag was already held.
#[inline(always)]
fn with_unwind_guard<F: FnOnce() -> usize>(walk: F) -> Option<usize> {
    let entered = UNWINDING
        .try_with(|flag| !flag.replace(true))
        .unwrap_or(false);
    if !entered {
        return None;
    }
    let depth = walk();
    let _ = UNWINDING.try_with(|flag| flag.set(false));
    Some(depth)
}

/// Capture the calling thread's stack into `result`.
///
/// `skip` frames above the caller are dropped in addition to this function's
/// own frame. Returns the number of frames written.
#[inline(never)]
pub fn get_stack_trace(result: &mut [usize], skip: usize) -> usize {
    let self_addr = get_stack_trace as *const () as usize;
    let mut fallback_skip = skip + 1;
    let mut pending_skip = 0;
    let mut anchored = false;
    let mut index = 0;
    let mut depth = 0;

    let walked = with_unwind_guard(|| {
        // SAFETY: only instruction pointers are read; nothing is symbolized.
        unsafe {
            trace_unsynchronized(|frame| {
                let i = index;
                index += 1;

                // Unwinder frames sit above ours; restart once our own shows up
                let searching = !anchored && i < ANCHOR_SEARCH_FRAMES;
                if searching && frame.symbol_address() as usize == self_addr {
                    anchored = true;
                    pending_skip = skip;
                    depth = 0;
                    return true;
                }
                if anchored && pending_skip > 0 {
                    pending_skip -= 1;
                    return true;
                }
                if !anchored && fallback_skip > 0 {
                    fallback_skip -= 1;
                    return true;
                }

                if depth < result.len() {
                    result[depth] = frame.ip() as usize;
                    depth += 1;
                    true
                } else {
                    !anchored && index < ANCHOR_SEARCH_FRAMES
                }
            });
        }
        depth
    });

    match walked {
        Some(depth) => trim_trailing_null(result, depth),
        None => 0,
    }
}

/// Capture the stack of a thread interrupted by a signal.
///
/// When the interrupted PC from `ucontext` shows up among the first frames,
/// the trace starts at that frame and everything above it (handler and
/// signal trampoline) is dropped. Otherwise `skip` frames are dropped.
///
/// # Safety
///
/// `ucontext` must be null or the third argument passed to an `SA_SIGINFO`
/// handler that is still running.
#[inline(never)]
pub unsafe fn get_stack_trace_with_context(
    result: &mut [usize],
    skip: usize,
    ucontext: *const c_void,
) -> usize {
    let pc = unsafe { context_pc(ucontext) };
    let window = skip + 1 + CONTEXT_SEARCH_FRAMES;
    let mut index = 0;
    let mut depth = 0;
    let mut anchored = false;

    let walked = with_unwind_guard(|| {
        unsafe {
            trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                let i = index;
                index += 1;

                if !anchored && i < window && pc.is_some_and(|pc| pc == ip) {
                    anchored = true;
                    depth = 0;
                } else if !anchored && i <= skip {
                    return true;
                }

                if depth < result.len() {
                    result[depth] = ip;
                    depth += 1;
                    true
                } else {
                    // Keep looking for the PC while it may still turn up
                    !anchored && index < window
                }
            });
        }
        depth
    });

    match walked {
        Some(depth) => trim_trailing_null(result, depth),
        None => 0,
    }
}

/// Some unwinders report a final null frame; it carries no information.
fn trim_trailing_null(result: &[usize], depth: usize) -> usize {
    if depth > 0 && result[depth - 1] == 0 {
        depth - 1
    } else {
        depth
    }
}

/// Program counter saved in a signal `ucontext`.
///
/// # Safety
///
/// `ucontext` must be null or point to a live `ucontext_t`.
pub unsafe fn context_pc(ucontext: *const c_void) -> Option<usize> {
    if ucontext.is_null() {
        return None;
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        const REG_RIP: usize = 16;
        let uc = ucontext as *const libc::ucontext_t;
        let rip = unsafe { (*uc).uc_mcontext.gregs[REG_RIP] } as usize;
        (rip != 0).then_some(rip)
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        let uc = ucontext as *const libc::ucontext_t;
        let pc = unsafe { (*uc).uc_mcontext.pc } as usize;
        (pc != 0).then_some(pc)
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here(buf: &mut [usize]) -> usize {
        get_stack_trace(buf, 0)
    }

    #[test]
    fn captures_nonempty_stack() {
        let mut buf = [0usize; 32];
        let depth = capture_here(&mut buf);
        assert!(depth > 0);
        assert!(buf[..depth].iter().all(|&pc| pc != 0));
    }

    #[test]
    fn respects_buffer_capacity() {
        let mut buf = [0usize; 2];
        let depth = get_stack_trace(&mut buf, 0);
        assert!(depth <= 2);
    }

    #[test]
    fn skipping_frames_shortens_trace() {
        let mut full = [0usize; 64];
        let mut skipped = [0usize; 64];
        let full_depth = get_stack_trace(&mut full, 0);
        let skipped_depth = get_stack_trace(&mut skipped, 2);
        assert!(skipped_depth + 2 <= full_depth);
    }

    #[test]
    fn null_context_falls_back_to_skip() {
        let mut buf = [0usize; 32];
        let depth = unsafe { get_stack_trace_with_context(&mut buf, 0, std::ptr::null()) };
        assert!(depth > 0);
        assert_eq!(unsafe { context_pc(std::ptr::null()) }, None);
    }

    #[test]
    fn nested_walk_is_refused() {
        let mut buf = [0usize; 8];
        let inner = with_unwind_guard(|| get_stack_trace(&mut buf, 0));
        assert_eq!(inner, Some(0));
        assert!(get_stack_trace(&mut buf, 0) > 0);
    }

    #[test]
    fn trailing_null_frame_is_dropped() {
        assert_eq!(trim_trailing_null(&[1, 2, 0], 3), 2);
        assert_eq!(trim_trailing_null(&[1, 2, 3], 3), 3);
        assert_eq!(trim_trailing_null(&[], 0), 0);
    }
}
