//! Engines that run on their own thread with a private copy of the parameter
//! block. The controller reaches them only through the transfer channel, the
//! stop-info mailbox and the signal register.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use super::params::HostBlock;
use super::run_loop::{EngineRunLoop, ProgramExit, Resume, StopSink};
use super::signal::{SignalRegister, StopHandle};
use super::transfer::{HostTransfer, TagPool};
use super::{
    host_physical_cores, host_usable_cores, EngineContext, EnginePlatform, EngineProgram,
    EntryPoint, LedgerToken, PlatformError, ResourceLedger, StopInfo, EXCEPTION_EVALUATOR_PANIC,
};

const BACKEND_NAME: &str = "isolated";
pub const DEFAULT_LOCAL_STORE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct IsolatedConfig {
    /// Upper bound on live contexts; `None` means no limit.
    pub max_contexts: Option<usize>,
    pub local_store_bytes: usize,
    pub pin_cores: bool,
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        Self {
            max_contexts: None,
            local_store_bytes: DEFAULT_LOCAL_STORE_BYTES,
            pin_cores: false,
        }
    }
}

pub struct IsolatedPlatform {
    config: IsolatedConfig,
    ledger: ResourceLedger,
    next_engine_id: AtomicUsize,
}

impl IsolatedPlatform {
    pub fn new(config: IsolatedConfig) -> Self {
        Self {
            config,
            ledger: ResourceLedger::default(),
            next_engine_id: AtomicUsize::new(0),
        }
    }
}

impl Default for IsolatedPlatform {
    fn default() -> Self {
        Self::new(IsolatedConfig::default())
    }
}

impl EnginePlatform for IsolatedPlatform {
    type Context = IsolatedContext;

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn create_context(&self) -> Result<IsolatedContext, PlatformError> {
        let token = self
            .ledger
            .try_track_context(self.config.max_contexts)
            .ok_or_else(|| {
                PlatformError::new(format!(
                    "all {} engine contexts are in use",
                    self.config.max_contexts.unwrap_or_default()
                ))
            })?;

        let engine_id = self.next_engine_id.fetch_add(1, Ordering::Relaxed);
        let core = if self.config.pin_cores {
            core_affinity::get_core_ids()
                .filter(|ids| !ids.is_empty())
                .map(|ids| ids[engine_id % ids.len()])
        } else {
            None
        };

        Ok(IsolatedContext {
            engine_id,
            local_store_bytes: self.config.local_store_bytes,
            core,
            signal: Arc::new(SignalRegister::new()),
            tags: Arc::new(TagPool::new()),
            engine: None,
            parked: false,
            _token: token,
        })
    }

    fn physical_engines(&self) -> Option<usize> {
        host_physical_cores()
    }

    fn usable_engines(&self) -> Option<usize> {
        let usable = host_usable_cores()?;
        Some(match self.config.max_contexts {
            Some(limit) => usable.min(limit),
            None => usable,
        })
    }
}

enum EngineCommand {
    Start(Arc<HostBlock>),
    Resume,
    Shutdown,
}

struct EngineThread {
    command_tx: Sender<EngineCommand>,
    stop_rx: Receiver<StopInfo>,
    handle: JoinHandle<()>,
}

pub struct IsolatedContext {
    engine_id: usize,
    local_store_bytes: usize,
    core: Option<core_affinity::CoreId>,
    signal: Arc<SignalRegister>,
    tags: Arc<TagPool>,
    engine: Option<EngineThread>,
    /// Engine sits in a stop-and-signal and can be resumed.
    parked: bool,
    _token: LedgerToken,
}

impl IsolatedContext {
    /// Tag space of this engine's transfer unit.
    pub fn tag_pool(&self) -> Arc<TagPool> {
        Arc::clone(&self.tags)
    }
}

impl EngineContext for IsolatedContext {
    fn load_program(&mut self, program: EngineProgram) -> Result<(), PlatformError> {
        if program.image_size > self.local_store_bytes {
            return Err(PlatformError::new(format!(
                "program '{}' needs {} bytes of local store, engine has {}",
                program.name, program.image_size, self.local_store_bytes
            )));
        }
        if self.engine.is_some() {
            return Err(PlatformError::new(format!(
                "engine {} already has a program loaded",
                self.engine_id
            )));
        }

        let (command_tx, command_rx) = bounded::<EngineCommand>(1);
        let (stop_tx, stop_rx) = bounded::<StopInfo>(1);
        let engine_id = self.engine_id;
        let core = self.core;
        let signal = Arc::clone(&self.signal);
        let tags = Arc::clone(&self.tags);

        let handle = thread::Builder::new()
            .name(format!("cellminer-engine-{engine_id}"))
            .spawn(move || {
                if let Some(core) = core {
                    let _ = core_affinity::set_for_current(core);
                }
                engine_thread(engine_id, program, signal, tags, command_rx, stop_tx)
            })
            .map_err(|err| PlatformError::new(format!("failed to spawn engine {engine_id}: {err}")))?;

        self.engine = Some(EngineThread {
            command_tx,
            stop_rx,
            handle,
        });
        self.parked = false;
        Ok(())
    }

    fn run(&mut self, entry: &mut EntryPoint, argp: &Arc<HostBlock>) -> Result<StopInfo, PlatformError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| PlatformError::new("no program loaded"))?;

        let command = if *entry == EntryPoint::Resume && self.parked {
            EngineCommand::Resume
        } else {
            EngineCommand::Start(Arc::clone(argp))
        };
        engine
            .command_tx
            .send(command)
            .map_err(|_| PlatformError::new(format!("engine {} is not running", self.engine_id)))?;

        let info = engine.stop_rx.recv().map_err(|_| {
            PlatformError::new(format!("engine {} terminated during run", self.engine_id))
        })?;

        self.parked = matches!(info, StopInfo::StopAndSignal(_));
        *entry = if self.parked {
            EntryPoint::Resume
        } else {
            EntryPoint::Default
        };
        Ok(info)
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.signal))
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let _ = engine.command_tx.send(EngineCommand::Shutdown);
        drop(engine.command_tx);
        if engine.handle.join().is_err() {
            warn!(target: "cellminer::isolated", "engine {} thread panicked", self.engine_id);
        }
    }
}

/// Stop-and-signal as seen from inside an isolated engine.
struct MailboxSink<'a> {
    command_rx: &'a Receiver<EngineCommand>,
    stop_tx: &'a Sender<StopInfo>,
    pending: Option<EngineCommand>,
}

impl StopSink for MailboxSink<'_> {
    fn stop_and_signal(&mut self, code: u32) -> Resume {
        if self.stop_tx.send(StopInfo::StopAndSignal(code)).is_err() {
            self.pending = Some(EngineCommand::Shutdown);
            return Resume::Abandon;
        }
        match self.command_rx.recv() {
            Ok(EngineCommand::Resume) => Resume::Continue,
            Ok(command) => {
                self.pending = Some(command);
                Resume::Abandon
            }
            Err(_) => {
                self.pending = Some(EngineCommand::Shutdown);
                Resume::Abandon
            }
        }
    }
}

fn engine_thread(
    engine_id: usize,
    program: EngineProgram,
    signal: Arc<SignalRegister>,
    tags: Arc<TagPool>,
    command_rx: Receiver<EngineCommand>,
    stop_tx: Sender<StopInfo>,
) {
    let mut next = command_rx.recv().ok();

    loop {
        let host = match next.take() {
            Some(EngineCommand::Start(host)) => host,
            // Nothing is parked, so there is nothing to resume.
            Some(EngineCommand::Resume) => {
                warn!(target: "cellminer::isolated", "engine {engine_id}: resume without program state");
                if stop_tx.send(StopInfo::RuntimeError(0)).is_err() {
                    break;
                }
                next = command_rx.recv().ok();
                continue;
            }
            Some(EngineCommand::Shutdown) | None => break,
        };

        debug!(target: "cellminer::isolated", "engine {engine_id}: starting {}", program.name);
        let transfer = HostTransfer::new(host, Arc::clone(&tags));
        let mut sink = MailboxSink {
            command_rx: &command_rx,
            stop_tx: &stop_tx,
            pending: None,
        };
        let mut run_loop =
            EngineRunLoop::new(engine_id, Arc::clone(&program.evaluator), Arc::clone(&signal));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_loop.run_program(&transfer, &mut sink)
        }));

        let report = match outcome {
            Ok(ProgramExit::Abandoned) => {
                next = sink.pending.take();
                continue;
            }
            Ok(ProgramExit::Exit(code)) => StopInfo::Exit(code),
            Err(_) => StopInfo::RuntimeException(EXCEPTION_EVALUATOR_PANIC),
        };
        if stop_tx.send(report).is_err() {
            break;
        }
        next = command_rx.recv().ok();
    }

    debug!(target: "cellminer::isolated", "engine {engine_id}: shut down");
}
