//! Logic executed on the compute engine.
//!
//! An engine waits for a parameter block, evaluates it and reports one of the
//! [`EngineStatus`] codes, forever. The only way out is a fatal transfer
//! error, which ends the program with [`EXIT_TRANSFER_ERROR`].

use std::sync::Arc;

use log::debug;

use super::evaluator::{Evaluation, Evaluator};
use super::params::ParameterBlock;
use super::signal::{SignalProbe, SignalRegister};
use super::transfer::{TransferChannel, TransferError};
use super::{EngineStatus, EXIT_TRANSFER_ERROR};

/// How the controller let a stopped engine continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Continue after the stop instruction.
    Continue,
    /// Drop the current program state; the platform decides what comes next.
    Abandon,
}

/// Engine side of the stop-and-signal instruction.
pub trait StopSink {
    /// Report `code` and block until the controller runs the engine again.
    fn stop_and_signal(&mut self, code: u32) -> Resume;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramExit {
    Exit(i32),
    Abandoned,
}

/// One run loop instance together with its private copy of the block.
pub struct EngineRunLoop {
    engine_id: usize,
    evaluator: Arc<dyn Evaluator>,
    signal: Arc<SignalRegister>,
    local: ParameterBlock,
}

impl EngineRunLoop {
    pub fn new(engine_id: usize, evaluator: Arc<dyn Evaluator>, signal: Arc<SignalRegister>) -> Self {
        Self {
            engine_id,
            evaluator,
            signal,
            local: ParameterBlock::default(),
        }
    }

    fn debugging(&self) -> bool {
        self.local.debug()
    }

    fn await_params(&mut self, transfer: &dyn TransferChannel) -> Result<(), TransferError> {
        transfer.get(&mut self.local)?;
        if self.debugging() {
            debug!(
                target: "cellminer::engine",
                "engine {}: params start_nonce={:#x} range={:#x}",
                self.engine_id,
                self.local.start_nonce,
                self.local.range
            );
        }
        Ok(())
    }

    fn evaluate(&self, from: u64) -> Evaluation {
        let probe = SignalProbe::new(&self.signal);
        // Interrupts are enabled before the first candidate, whatever the range.
        if probe.interrupted() {
            return Evaluation::Interrupted { next: from };
        }
        self.evaluator.evaluate(&self.local, from, &probe)
    }

    fn report_found(&mut self, nonce: u32, transfer: &dyn TransferChannel) -> Result<(), TransferError> {
        self.local.nonce = nonce;
        transfer.put(&self.local)?;
        if self.debugging() {
            debug!(target: "cellminer::engine", "engine {}: found nonce {nonce:#010x}", self.engine_id);
        }
        Ok(())
    }

    /// Single pass from AWAIT_PARAMS to a report, used when the engine is a
    /// direct call on the controller's processor.
    pub fn step(&mut self, transfer: &dyn TransferChannel) -> Result<EngineStatus, TransferError> {
        self.await_params(transfer)?;
        match self.evaluate(self.local.start_nonce) {
            Evaluation::Found(nonce) => {
                self.report_found(nonce, transfer)?;
                Ok(EngineStatus::FoundSomething)
            }
            Evaluation::Exhausted => Ok(EngineStatus::FoundNothing),
            Evaluation::Interrupted { next } => {
                self.log_interrupt(next);
                Ok(EngineStatus::StoppedBySignal)
            }
        }
    }

    /// The engine program proper. Returns only on a fatal transfer error or
    /// when the platform abandons the program.
    pub fn run_program(&mut self, transfer: &dyn TransferChannel, sink: &mut dyn StopSink) -> ProgramExit {
        let mut resume_from: Option<u64> = None;

        loop {
            let from = match resume_from.take() {
                Some(next) => next,
                None => {
                    if let Err(err) = self.await_params(transfer) {
                        debug!(target: "cellminer::engine", "engine {}: {err}", self.engine_id);
                        return ProgramExit::Exit(EXIT_TRANSFER_ERROR);
                    }
                    self.local.start_nonce
                }
            };

            let status = match self.evaluate(from) {
                Evaluation::Found(nonce) => {
                    if let Err(err) = self.report_found(nonce, transfer) {
                        debug!(target: "cellminer::engine", "engine {}: {err}", self.engine_id);
                        return ProgramExit::Exit(EXIT_TRANSFER_ERROR);
                    }
                    EngineStatus::FoundSomething
                }
                Evaluation::Exhausted => EngineStatus::FoundNothing,
                Evaluation::Interrupted { next } => {
                    self.log_interrupt(next);
                    // Resuming from here returns into the interrupted search.
                    resume_from = Some(next);
                    EngineStatus::StoppedBySignal
                }
            };

            match sink.stop_and_signal(status.code()) {
                Resume::Continue => {}
                Resume::Abandon => return ProgramExit::Abandoned,
            }
        }
    }

    fn log_interrupt(&self, next: u64) {
        if self.debugging() {
            debug!(
                target: "cellminer::engine",
                "engine {}: stop signal received at nonce {next:#x}",
                self.engine_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::backend::evaluator::Sha256dEvaluator;
    use crate::backend::{WORKER_FOUND_NOTHING, WORKER_FOUND_SOMETHING, WORKER_IRQ_SIGNAL};

    /// Controller memory stand-in with scripted failures.
    struct ScriptedTransfer {
        host: Mutex<ParameterBlock>,
        fail_get_after: Option<usize>,
        fail_put: bool,
        gets: Mutex<usize>,
    }

    impl ScriptedTransfer {
        fn new(block: ParameterBlock) -> Self {
            Self {
                host: Mutex::new(block),
                fail_get_after: None,
                fail_put: false,
                gets: Mutex::new(0),
            }
        }
    }

    impl TransferChannel for ScriptedTransfer {
        fn get(&self, local: &mut ParameterBlock) -> Result<(), TransferError> {
            let mut gets = self.gets.lock().expect("gets lock");
            if self.fail_get_after.is_some_and(|limit| *gets >= limit) {
                return Err(TransferError::NoTag);
            }
            *gets += 1;
            *local = self.host.lock().expect("host lock").clone();
            Ok(())
        }

        fn put(&self, local: &ParameterBlock) -> Result<(), TransferError> {
            if self.fail_put {
                return Err(TransferError::NoTag);
            }
            *self.host.lock().expect("host lock") = local.clone();
            Ok(())
        }
    }

    struct RecordingSink {
        codes: Vec<u32>,
        resumes: VecDeque<Resume>,
    }

    impl RecordingSink {
        fn new(resumes: impl IntoIterator<Item = Resume>) -> Self {
            Self {
                codes: Vec::new(),
                resumes: resumes.into_iter().collect(),
            }
        }
    }

    impl StopSink for RecordingSink {
        fn stop_and_signal(&mut self, code: u32) -> Resume {
            self.codes.push(code);
            self.resumes.pop_front().unwrap_or(Resume::Abandon)
        }
    }

    fn work(target: [u8; 32], start_nonce: u64, range: u64) -> ParameterBlock {
        ParameterBlock {
            target,
            start_nonce,
            range,
            nonce: 0xffff_ffff,
            ..ParameterBlock::default()
        }
    }

    fn run_loop(signal: Arc<SignalRegister>) -> EngineRunLoop {
        EngineRunLoop::new(3, Arc::new(Sha256dEvaluator::new(1)), signal)
    }

    #[test]
    fn found_result_is_written_back_before_reporting() {
        let transfer = ScriptedTransfer::new(work([0xff; 32], 42, 1));
        let mut engine = run_loop(Arc::new(SignalRegister::new()));
        assert_eq!(engine.step(&transfer), Ok(EngineStatus::FoundSomething));
        assert_eq!(transfer.host.lock().expect("host lock").nonce, 42);
    }

    #[test]
    fn empty_result_does_not_transfer_back() {
        let transfer = ScriptedTransfer {
            fail_put: true,
            ..ScriptedTransfer::new(work([0u8; 32], 0, 16))
        };
        let mut engine = run_loop(Arc::new(SignalRegister::new()));
        assert_eq!(engine.step(&transfer), Ok(EngineStatus::FoundNothing));
        assert_eq!(transfer.host.lock().expect("host lock").nonce, 0xffff_ffff);
    }

    #[test]
    fn signal_stops_evaluation_and_leaves_nonce_untouched() {
        let signal = Arc::new(SignalRegister::new());
        signal.raise();
        let transfer = ScriptedTransfer::new(work([0xff; 32], 0, 8));
        let mut engine = run_loop(Arc::clone(&signal));
        assert_eq!(engine.step(&transfer), Ok(EngineStatus::StoppedBySignal));
        assert_eq!(transfer.host.lock().expect("host lock").nonce, 0xffff_ffff);
    }

    #[test]
    fn pending_signal_is_taken_even_for_an_empty_range() {
        let signal = Arc::new(SignalRegister::new());
        signal.raise();
        let transfer = ScriptedTransfer::new(work([0xff; 32], 5, 0));
        let mut engine = run_loop(Arc::clone(&signal));
        assert_eq!(engine.step(&transfer), Ok(EngineStatus::StoppedBySignal));
        assert!(!signal.is_pending());
        assert_eq!(engine.step(&transfer), Ok(EngineStatus::FoundNothing));

        signal.raise();
        let mut sink = RecordingSink::new([]);
        assert_eq!(engine.run_program(&transfer, &mut sink), ProgramExit::Abandoned);
        assert_eq!(sink.codes, vec![WORKER_IRQ_SIGNAL]);
        assert!(!signal.is_pending());
    }

    #[test]
    fn program_loops_until_abandoned() {
        let transfer = ScriptedTransfer::new(work([0u8; 32], 0, 4));
        let mut engine = run_loop(Arc::new(SignalRegister::new()));
        let mut sink = RecordingSink::new([Resume::Continue, Resume::Continue]);
        assert_eq!(engine.run_program(&transfer, &mut sink), ProgramExit::Abandoned);
        assert_eq!(sink.codes, vec![WORKER_FOUND_NOTHING; 3]);
        assert_eq!(*transfer.gets.lock().expect("gets lock"), 3);
    }

    #[test]
    fn failed_parameter_transfer_exits_program() {
        let transfer = ScriptedTransfer {
            fail_get_after: Some(1),
            ..ScriptedTransfer::new(work([0u8; 32], 0, 4))
        };
        let mut engine = run_loop(Arc::new(SignalRegister::new()));
        let mut sink = RecordingSink::new([Resume::Continue]);
        assert_eq!(
            engine.run_program(&transfer, &mut sink),
            ProgramExit::Exit(EXIT_TRANSFER_ERROR)
        );
        assert_eq!(sink.codes, vec![WORKER_FOUND_NOTHING]);
    }

    #[test]
    fn failed_result_transfer_exits_without_reporting_found() {
        let transfer = ScriptedTransfer {
            fail_put: true,
            ..ScriptedTransfer::new(work([0xff; 32], 0, 4))
        };
        let mut engine = run_loop(Arc::new(SignalRegister::new()));
        let mut sink = RecordingSink::new([]);
        assert_eq!(
            engine.run_program(&transfer, &mut sink),
            ProgramExit::Exit(EXIT_TRANSFER_ERROR)
        );
        assert!(sink.codes.is_empty());
    }

    #[test]
    fn continuing_after_signal_resumes_the_interrupted_block() {
        let signal = Arc::new(SignalRegister::new());
        signal.raise();
        let transfer = ScriptedTransfer::new(work([0xff; 32], 9, 4));
        let mut engine = run_loop(Arc::clone(&signal));

        let mut sink = RecordingSink::new([Resume::Continue]);
        assert_eq!(engine.run_program(&transfer, &mut sink), ProgramExit::Abandoned);
        assert_eq!(sink.codes, vec![WORKER_IRQ_SIGNAL, WORKER_FOUND_SOMETHING]);
        // Parameters were fetched once: the resumed search never reloaded them.
        assert_eq!(*transfer.gets.lock().expect("gets lock"), 1);
        assert_eq!(transfer.host.lock().expect("host lock").nonce, 9);
    }
}
