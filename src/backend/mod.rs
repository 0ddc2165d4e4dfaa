use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use self::evaluator::Evaluator;
use self::params::HostBlock;
use self::signal::StopHandle;

pub mod evaluator;
pub mod isolated;
pub mod local;
pub mod params;
pub mod run_loop;
pub mod signal;
pub mod transfer;

pub const WORKER_FOUND_NOTHING: u32 = 0x1000;
pub const WORKER_FOUND_SOMETHING: u32 = 0x1001;
pub const WORKER_IRQ_SIGNAL: u32 = 0x1002;

/// Exit code of an engine program that could not move its parameter block.
pub const EXIT_TRANSFER_ERROR: i32 = 0x0d;

/// Exception code reported when the evaluator panics inside an engine.
pub const EXCEPTION_EVALUATOR_PANIC: u32 = 0x0001;

/// Footprint of the worker program in an engine's local store.
pub const WORKER_IMAGE_SIZE: usize = 48 * 1024;

/// Status an engine reports when it stops cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    FoundSomething,
    FoundNothing,
    StoppedBySignal,
}

impl EngineStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::FoundSomething => WORKER_FOUND_SOMETHING,
            Self::FoundNothing => WORKER_FOUND_NOTHING,
            Self::StoppedBySignal => WORKER_IRQ_SIGNAL,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            WORKER_FOUND_SOMETHING => Some(Self::FoundSomething),
            WORKER_FOUND_NOTHING => Some(Self::FoundNothing),
            WORKER_IRQ_SIGNAL => Some(Self::StoppedBySignal),
            _ => None,
        }
    }
}

/// Why a context run returned control to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopInfo {
    Exit(i32),
    StopAndSignal(u32),
    RuntimeError(u32),
    RuntimeException(u32),
    RuntimeFatal(u32),
    CallbackError(u32),
    IsolationError(u32),
}

impl StopInfo {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Exit(_) => "EXIT",
            Self::StopAndSignal(_) => "STOP_AND_SIGNAL",
            Self::RuntimeError(_) => "RUNTIME_ERROR",
            Self::RuntimeException(_) => "RUNTIME_EXCEPTION",
            Self::RuntimeFatal(_) => "RUNTIME_FATAL",
            Self::CallbackError(_) => "CALLBACK_ERROR",
            Self::IsolationError(_) => "ISOLATION_ERROR",
        }
    }

    pub fn code(&self) -> u32 {
        match *self {
            Self::Exit(code) => code as u32,
            Self::StopAndSignal(code)
            | Self::RuntimeError(code)
            | Self::RuntimeException(code)
            | Self::RuntimeFatal(code)
            | Self::CallbackError(code)
            | Self::IsolationError(code) => code,
        }
    }
}

/// Where the next context run starts executing the engine program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryPoint {
    /// Program start: a fresh run loop waiting for parameters.
    #[default]
    Default,
    /// Right after the last stop-and-signal.
    Resume,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl PlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Program image loaded into an engine context.
#[derive(Clone)]
pub struct EngineProgram {
    pub name: &'static str,
    pub image_size: usize,
    pub evaluator: Arc<dyn Evaluator>,
}

impl EngineProgram {
    pub fn worker(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            name: "cellminer-worker",
            image_size: WORKER_IMAGE_SIZE,
            evaluator,
        }
    }
}

/// Source of engine contexts.
pub trait EnginePlatform {
    type Context: EngineContext;

    fn name(&self) -> &'static str;

    fn ledger(&self) -> &ResourceLedger;

    fn create_context(&self) -> Result<Self::Context, PlatformError>;

    fn physical_engines(&self) -> Option<usize>;

    fn usable_engines(&self) -> Option<usize>;
}

/// One engine instance. Dropping it destroys the context.
pub trait EngineContext: Send {
    fn load_program(&mut self, program: EngineProgram) -> Result<(), PlatformError>;

    /// Hand control to the engine and block until it stops. `entry` is updated
    /// to the point a later run would continue from.
    fn run(&mut self, entry: &mut EntryPoint, argp: &Arc<HostBlock>) -> Result<StopInfo, PlatformError>;

    fn stop_handle(&self) -> StopHandle;
}

#[derive(Debug, Default)]
struct LedgerCounts {
    blocks: AtomicUsize,
    contexts: AtomicUsize,
}

/// Live-resource counters shared by a platform and everything it allocates.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    counts: Arc<LedgerCounts>,
}

impl ResourceLedger {
    pub fn live_blocks(&self) -> usize {
        self.counts.blocks.load(Ordering::Acquire)
    }

    pub fn live_contexts(&self) -> usize {
        self.counts.contexts.load(Ordering::Acquire)
    }

    pub(crate) fn track_block(&self) -> LedgerToken {
        self.counts.blocks.fetch_add(1, Ordering::AcqRel);
        LedgerToken {
            counts: Arc::clone(&self.counts),
            kind: LedgerKind::Block,
        }
    }

    pub(crate) fn try_track_context(&self, limit: Option<usize>) -> Option<LedgerToken> {
        let mut current = self.counts.contexts.load(Ordering::Acquire);
        loop {
            if limit.is_some_and(|limit| current >= limit) {
                return None;
            }
            match self.counts.contexts.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(LedgerToken {
                        counts: Arc::clone(&self.counts),
                        kind: LedgerKind::Context,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LedgerKind {
    Block,
    Context,
}

#[derive(Debug)]
pub(crate) struct LedgerToken {
    counts: Arc<LedgerCounts>,
    kind: LedgerKind,
}

impl Drop for LedgerToken {
    fn drop(&mut self) {
        let counter = match self.kind {
            LedgerKind::Block => &self.counts.blocks,
            LedgerKind::Context => &self.counts.contexts,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Processors configured on the host, or `None` when the platform won't say.
pub fn host_physical_cores() -> Option<usize> {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        usize::try_from(count).ok().filter(|count| *count > 0)
    }
    #[cfg(not(unix))]
    {
        std::thread::available_parallelism().ok().map(|n| n.get())
    }
}

/// Processors this process may actually be scheduled on.
pub fn host_usable_cores() -> Option<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.len())
        .filter(|count| *count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_distinct_and_round_trip() {
        for status in [
            EngineStatus::FoundSomething,
            EngineStatus::FoundNothing,
            EngineStatus::StoppedBySignal,
        ] {
            assert_eq!(EngineStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(EngineStatus::from_code(0), None);
    }

    #[test]
    fn ledger_context_limit_is_enforced_and_released() {
        let ledger = ResourceLedger::default();
        let first = ledger.try_track_context(Some(1)).expect("first context fits");
        assert!(ledger.try_track_context(Some(1)).is_none());
        drop(first);
        assert_eq!(ledger.live_contexts(), 0);
        assert!(ledger.try_track_context(Some(1)).is_some());
    }

    #[test]
    fn stop_info_reports_reason_and_code() {
        let info = StopInfo::Exit(EXIT_TRANSFER_ERROR);
        assert_eq!(info.reason(), "EXIT");
        assert_eq!(info.code(), 0x0d);
        assert_eq!(StopInfo::IsolationError(7).reason(), "ISOLATION_ERROR");
    }
}
