//! Surface handed to calling code: one [`Miner`] type over both realizations,
//! process-wide platforms, and the engine-count queries.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cellminer_work_spec::{splice_nonce, DATA_LEN};

use crate::backend::evaluator::Sha256dEvaluator;
use crate::backend::isolated::{IsolatedConfig, IsolatedContext, IsolatedPlatform};
use crate::backend::local::{LocalContext, LocalPlatform};
use crate::backend::signal::StopHandle;
use crate::backend::{EnginePlatform, EngineProgram, ResourceLedger};
use crate::error::Result;
use crate::handle::{ControlHandle, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realization {
    /// The engine is a function call on the calling thread.
    Local,
    /// The engine runs apart from the caller and is reached by transfers.
    Isolated,
}

impl Realization {
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Isolated => "isolated",
        }
    }
}

impl fmt::Display for Realization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static LOCAL: OnceLock<LocalPlatform> = OnceLock::new();
static ISOLATED: OnceLock<IsolatedPlatform> = OnceLock::new();

fn local_platform() -> &'static LocalPlatform {
    LOCAL.get_or_init(LocalPlatform::new)
}

fn isolated_platform() -> &'static IsolatedPlatform {
    ISOLATED.get_or_init(IsolatedPlatform::default)
}

/// Configure the shared isolated platform. Only the first call before any
/// isolated miner exists takes effect; later calls return `false`.
pub fn configure_isolated(config: IsolatedConfig) -> bool {
    ISOLATED.set(IsolatedPlatform::new(config)).is_ok()
}

/// Processors the platform reports for `realization`, or `None` if unknown.
pub fn physical_engines(realization: Realization) -> Option<usize> {
    match realization {
        Realization::Local => local_platform().physical_engines(),
        Realization::Isolated => isolated_platform().physical_engines(),
    }
}

/// Engines this process may use for `realization`, or `None` if unknown.
pub fn usable_engines(realization: Realization) -> Option<usize> {
    match realization {
        Realization::Local => local_platform().usable_engines(),
        Realization::Isolated => isolated_platform().usable_engines(),
    }
}

/// Live-resource counters of the shared platform behind `realization`.
pub fn ledger(realization: Realization) -> ResourceLedger {
    match realization {
        Realization::Local => local_platform().ledger().clone(),
        Realization::Isolated => isolated_platform().ledger().clone(),
    }
}

pub enum Miner {
    Local(ControlHandle<LocalContext>),
    Isolated(ControlHandle<IsolatedContext>),
}

macro_rules! with_handle {
    ($miner:expr, $handle:ident => $body:expr) => {
        match $miner {
            Miner::Local($handle) => $body,
            Miner::Isolated($handle) => $body,
        }
    };
}

impl Miner {
    /// Miner running the reference double SHA-256 evaluator.
    pub fn create(realization: Realization) -> Result<Self> {
        Self::with_program(
            realization,
            EngineProgram::worker(Arc::new(Sha256dEvaluator::default())),
        )
    }

    pub fn with_program(realization: Realization, program: EngineProgram) -> Result<Self> {
        Ok(match realization {
            Realization::Local => Self::Local(ControlHandle::create(local_platform(), program)?),
            Realization::Isolated => {
                Self::Isolated(ControlHandle::create(isolated_platform(), program)?)
            }
        })
    }

    pub fn realization(&self) -> Realization {
        match self {
            Self::Local(_) => Realization::Local,
            Self::Isolated(_) => Realization::Isolated,
        }
    }

    pub fn set_debug(&mut self) {
        with_handle!(self, handle => handle.set_debug())
    }

    pub fn load_work(&mut self, data: &[u8], target: &[u8], start_nonce: u64, range: u64) -> Result<()> {
        with_handle!(self, handle => handle.load_work(data, target, start_nonce, range))
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        with_handle!(self, handle => handle.run())
    }

    /// Run and fold a stopped run into "nothing found", the view most
    /// callers want once they asked for the stop themselves.
    pub fn run_nonce(&mut self) -> Result<Option<u32>> {
        Ok(self.run()?.nonce())
    }

    /// Load, run and return `data` with the found nonce spliced in, ready
    /// to be resubmitted.
    pub fn run_work(
        &mut self,
        data: &[u8],
        target: &[u8],
        start_nonce: u64,
        range: u64,
    ) -> Result<Option<[u8; DATA_LEN]>> {
        self.load_work(data, target, start_nonce, range)?;
        let Some(nonce) = self.run_nonce()? else {
            return Ok(None);
        };
        let mut block = [0u8; DATA_LEN];
        block.copy_from_slice(data);
        Ok(Some(splice_nonce(&block, nonce)))
    }

    pub fn stop(&self) {
        with_handle!(self, handle => handle.stop())
    }

    pub fn stop_handle(&self) -> StopHandle {
        with_handle!(self, handle => handle.stop_handle())
    }
}
