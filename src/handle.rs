//! Controller-side view of one compute engine.
//!
//! A [`ControlHandle`] owns an engine context with the worker program loaded
//! and the parameter block the engine reads its work from. Dropping the
//! handle destroys both.

use std::sync::Arc;

use cellminer_work_spec::{DATA_LEN, TARGET_LEN};
use log::debug;

use crate::backend::params::{BlockFlags, HostBlock, ParameterBlock};
use crate::backend::signal::StopHandle;
use crate::backend::transfer::TransferError;
use crate::backend::{
    EngineContext, EnginePlatform, EngineProgram, EngineStatus, EntryPoint, StopInfo,
    EXIT_TRANSFER_ERROR,
};
use crate::error::{MinerError, Result};

/// Normal results of a run. Faults are reported as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Found(u32),
    NotFound,
    /// The run was cut short by [`ControlHandle::stop`].
    Stopped,
}

impl RunOutcome {
    pub fn nonce(self) -> Option<u32> {
        match self {
            Self::Found(nonce) => Some(nonce),
            Self::NotFound | Self::Stopped => None,
        }
    }
}

pub struct ControlHandle<C: EngineContext> {
    // Declared before `block` so the engine is gone before its memory is.
    context: C,
    block: Arc<HostBlock>,
    entry: EntryPoint,
    last_stop: Option<StopInfo>,
}

impl<C: EngineContext> ControlHandle<C> {
    /// Allocate the parameter block, create an engine context and load
    /// `program` into it. Nothing is left allocated when this fails.
    pub fn create<P>(platform: &P, program: EngineProgram) -> Result<Self>
    where
        P: EnginePlatform<Context = C>,
    {
        let block = Arc::new(HostBlock::allocate(platform.ledger())?);
        let mut context = platform
            .create_context()
            .map_err(|err| MinerError::Context(err.to_string()))?;
        context
            .load_program(program)
            .map_err(|err| MinerError::ProgramLoad(err.to_string()))?;

        debug!(
            target: "cellminer::handle",
            "created {} handle, block at {:#x}",
            platform.name(),
            block.address()
        );
        Ok(Self {
            context,
            block,
            entry: EntryPoint::Default,
            last_stop: None,
        })
    }

    /// Turn on engine-side debug output from the next run on.
    pub fn set_debug(&mut self) {
        self.block.with_mut(|block| block.flags.insert(BlockFlags::DEBUG));
    }

    pub fn debug(&self) -> bool {
        self.block.with(ParameterBlock::debug)
    }

    /// Stage one unit of work. Wrongly sized buffers are rejected before the
    /// block is touched.
    pub fn load_work(&mut self, data: &[u8], target: &[u8], start_nonce: u64, range: u64) -> Result<()> {
        let data: &[u8; DATA_LEN] = data.try_into().map_err(|_| MinerError::ContractViolation {
            field: "data",
            expected: DATA_LEN,
            actual: data.len(),
        })?;
        let target: &[u8; TARGET_LEN] =
            target.try_into().map_err(|_| MinerError::ContractViolation {
                field: "target",
                expected: TARGET_LEN,
                actual: target.len(),
            })?;
        self.load_work_exact(data, target, start_nonce, range);
        Ok(())
    }

    pub fn load_work_exact(
        &mut self,
        data: &[u8; DATA_LEN],
        target: &[u8; TARGET_LEN],
        start_nonce: u64,
        range: u64,
    ) {
        self.block.with_mut(|block| {
            block.data = *data;
            block.target = *target;
            block.start_nonce = start_nonce;
            block.range = range;
        });
    }

    /// Hand the staged work to the engine and block until it reports.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let info = match self.context.run(&mut self.entry, &self.block) {
            Ok(info) => info,
            Err(err) => {
                self.rearm();
                return Err(MinerError::Runtime(err.to_string()));
            }
        };
        self.last_stop = Some(info);

        match info {
            StopInfo::StopAndSignal(code) => match EngineStatus::from_code(code) {
                Some(EngineStatus::FoundSomething) => {
                    Ok(RunOutcome::Found(self.block.with(|block| block.nonce)))
                }
                Some(EngineStatus::FoundNothing) => Ok(RunOutcome::NotFound),
                Some(EngineStatus::StoppedBySignal) => {
                    // Resuming here would land inside the interrupted search.
                    self.rearm();
                    Ok(RunOutcome::Stopped)
                }
                None => {
                    self.rearm();
                    Err(MinerError::EngineFault {
                        reason: info.reason(),
                        code,
                    })
                }
            },
            StopInfo::Exit(EXIT_TRANSFER_ERROR) => {
                self.rearm();
                Err(MinerError::Transfer(TransferError::EngineExit(EXIT_TRANSFER_ERROR)))
            }
            other => {
                self.rearm();
                Err(MinerError::EngineFault {
                    reason: other.reason(),
                    code: other.code(),
                })
            }
        }
    }

    /// Ask a running engine to stop. Safe from any thread, with or without a
    /// run in flight; repeated requests before the engine looks are merged.
    pub fn stop(&self) {
        self.context.stop_handle().stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.context.stop_handle()
    }

    pub fn last_stop(&self) -> Option<StopInfo> {
        self.last_stop
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    fn rearm(&mut self) {
        self.entry = EntryPoint::Default;
    }
}
