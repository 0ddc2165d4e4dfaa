use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-bit notification register used to ask a running engine to stop.
///
/// Raising an already pending bit has no further effect; the bit is cleared
/// only when the engine reads it.
#[derive(Debug, Default)]
pub struct SignalRegister {
    pending: AtomicBool,
}

impl SignalRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Read-and-clear, as the engine side sees the channel.
    pub fn read(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

/// Controller-side handle that can raise the stop signal from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    register: Arc<SignalRegister>,
}

impl StopHandle {
    pub fn new(register: Arc<SignalRegister>) -> Self {
        Self { register }
    }

    pub fn stop(&self) {
        self.register.raise();
    }
}

/// Suspension point handed to the evaluator.
pub struct SignalProbe<'a> {
    register: &'a SignalRegister,
}

impl<'a> SignalProbe<'a> {
    pub fn new(register: &'a SignalRegister) -> Self {
        Self { register }
    }

    /// True once when a stop was requested; consumes the pending bit.
    pub fn interrupted(&self) -> bool {
        self.register.is_pending() && self.register.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_raises_collapse_into_one_observation() {
        let register = Arc::new(SignalRegister::new());
        let stopper = StopHandle::new(Arc::clone(&register));
        stopper.stop();
        stopper.stop();
        stopper.clone().stop();

        let probe = SignalProbe::new(&register);
        assert!(probe.interrupted());
        assert!(!probe.interrupted());
        assert!(!register.is_pending());
    }

    #[test]
    fn probe_without_signal_stays_quiet() {
        let register = SignalRegister::new();
        assert!(!SignalProbe::new(&register).interrupted());
        assert!(!register.is_pending());
    }
}
