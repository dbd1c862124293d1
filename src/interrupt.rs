//! Interruption flag for in-flight launches.
//!
//! While at least one [`InterruptGuard`] is alive, SIGINT/SIGTERM only set a flag; the launch
//! poll observes it, terminates the half-started proxy and returns `SlashError::Interrupted`.
//! The handlers that were in place before the first guard are restored when the last one drops.
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

// (active guards, handlers to restore)
static INSTALLED: Lazy<Mutex<(usize, Vec<(Signal, SigAction)>)>> =
    Lazy::new(|| Mutex::new((0, Vec::new())));

extern "C" fn on_signal(_sig: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub struct InterruptGuard {
    _private: (),
}

impl InterruptGuard {
    pub fn install() -> InterruptGuard {
        let mut state = INSTALLED.lock().unwrap_or_else(|p| p.into_inner());
        if state.0 == 0 {
            INTERRUPTED.store(false, Ordering::SeqCst);
            let action = SigAction::new(
                SigHandler::Handler(on_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                // SAFETY: the handler only stores into an atomic.
                if let Ok(old) = unsafe { sigaction(sig, &action) } {
                    state.1.push((sig, old));
                }
            }
        }
        state.0 += 1;
        InterruptGuard { _private: () }
    }

    pub fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let mut state = INSTALLED.lock().unwrap_or_else(|p| p.into_inner());
        state.0 = state.0.saturating_sub(1);
        if state.0 == 0 {
            for (sig, old) in state.1.drain(..) {
                // SAFETY: restoring the action that was installed before the first guard.
                let _ = unsafe { sigaction(sig, &old) };
            }
        }
    }
}

/// Serialises unit tests that install guards; the flag is process-wide.
#[cfg(test)]
pub(crate) static TEST_GUARD: Mutex<()> = Mutex::new(());

/// Test hook: set the flag as if SIGINT had arrived, so interrupted launches can be
/// exercised without signalling the test process.
#[doc(hidden)]
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_reset_on_first_install_and_set_on_request() {
        let _serial = TEST_GUARD.lock().unwrap_or_else(|p| p.into_inner());
        request_interrupt();
        let g = InterruptGuard::install();
        assert!(!g.interrupted(), "install must clear a stale flag");
        request_interrupt();
        assert!(g.interrupted());
        drop(g);
        let g2 = InterruptGuard::install();
        assert!(!g2.interrupted());
    }
}
