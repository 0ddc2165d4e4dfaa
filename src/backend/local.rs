use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::params::HostBlock;
use super::run_loop::EngineRunLoop;
use super::signal::{SignalRegister, StopHandle};
use super::transfer::DirectTransfer;
use super::{
    host_physical_cores, host_usable_cores, EngineContext, EnginePlatform, EngineProgram,
    EntryPoint, LedgerToken, PlatformError, ResourceLedger, StopInfo, EXCEPTION_EVALUATOR_PANIC,
    EXIT_TRANSFER_ERROR,
};

const BACKEND_NAME: &str = "local";

/// Engines that are plain function calls on the controller's own thread.
#[derive(Default)]
pub struct LocalPlatform {
    ledger: ResourceLedger,
    next_engine_id: AtomicUsize,
}

impl LocalPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnginePlatform for LocalPlatform {
    type Context = LocalContext;

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn create_context(&self) -> Result<LocalContext, PlatformError> {
        let token = self
            .ledger
            .try_track_context(None)
            .ok_or_else(|| PlatformError::new("local context could not be tracked"))?;
        Ok(LocalContext {
            engine_id: self.next_engine_id.fetch_add(1, Ordering::Relaxed),
            signal: Arc::new(SignalRegister::new()),
            run_loop: None,
            _token: token,
        })
    }

    fn physical_engines(&self) -> Option<usize> {
        host_physical_cores()
    }

    fn usable_engines(&self) -> Option<usize> {
        host_usable_cores()
    }
}

pub struct LocalContext {
    engine_id: usize,
    signal: Arc<SignalRegister>,
    run_loop: Option<EngineRunLoop>,
    _token: LedgerToken,
}

impl EngineContext for LocalContext {
    fn load_program(&mut self, program: EngineProgram) -> Result<(), PlatformError> {
        if self.run_loop.is_some() {
            return Err(PlatformError::new(format!(
                "local engine {} already has a program loaded",
                self.engine_id
            )));
        }
        self.run_loop = Some(EngineRunLoop::new(
            self.engine_id,
            program.evaluator,
            Arc::clone(&self.signal),
        ));
        Ok(())
    }

    fn run(&mut self, entry: &mut EntryPoint, argp: &Arc<HostBlock>) -> Result<StopInfo, PlatformError> {
        let run_loop = self
            .run_loop
            .as_mut()
            .ok_or_else(|| PlatformError::new("no program loaded"))?;

        // Every call starts at AWAIT_PARAMS, so there is never a state to resume.
        *entry = EntryPoint::Default;

        let transfer = DirectTransfer::new(argp);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_loop.step(&transfer)));
        Ok(match outcome {
            Ok(Ok(status)) => StopInfo::StopAndSignal(status.code()),
            Ok(Err(_)) => StopInfo::Exit(EXIT_TRANSFER_ERROR),
            Err(_) => StopInfo::RuntimeException(EXCEPTION_EVALUATOR_PANIC),
        })
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::evaluator::Sha256dEvaluator;
    use crate::backend::{WORKER_FOUND_SOMETHING, WORKER_IRQ_SIGNAL};

    #[test]
    fn local_run_is_a_direct_call_with_identical_status_codes() {
        let platform = LocalPlatform::new();
        let mut context = platform.create_context().expect("context should be created");
        context
            .load_program(EngineProgram::worker(Arc::new(Sha256dEvaluator::default())))
            .expect("program should load");

        let argp = Arc::new(HostBlock::allocate(platform.ledger()).expect("host block"));
        argp.with_mut(|block| {
            block.target = [0xff; 32];
            block.start_nonce = 11;
            block.range = 1;
        });

        let mut entry = EntryPoint::Default;
        let info = context.run(&mut entry, &argp).expect("run should succeed");
        assert_eq!(info, StopInfo::StopAndSignal(WORKER_FOUND_SOMETHING));
        assert_eq!(argp.with(|block| block.nonce), 11);
        assert_eq!(entry, EntryPoint::Default);

        context.stop_handle().stop();
        let info = context.run(&mut entry, &argp).expect("run should succeed");
        assert_eq!(info, StopInfo::StopAndSignal(WORKER_IRQ_SIGNAL));
    }

    #[test]
    fn contexts_are_counted_until_dropped() {
        let platform = LocalPlatform::new();
        let contexts: Vec<_> = (0..4)
            .map(|_| platform.create_context().expect("context should be created"))
            .collect();
        assert_eq!(platform.ledger().live_contexts(), 4);
        drop(contexts);
        assert_eq!(platform.ledger().live_contexts(), 0);
    }
}
