//! One worker thread per engine. Workers pull units from a shared bounded
//! queue, run them on their own miner and report back on an event channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use cellminer::backend::signal::StopHandle;
use cellminer::{Miner, RunOutcome};
use cellminer_work_spec::{splice_nonce, DATA_LEN, TARGET_LEN};
use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};
use log::debug;

pub(super) const WORK_QUEUE_CAPACITY: usize = 64;

/// A worker that has not picked up work for this long counts as dead.
pub(super) const ALIVE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(super) struct WorkUnit {
    pub id: u64,
    pub data: Arc<[u8; DATA_LEN]>,
    pub target: Arc<[u8; TARGET_LEN]>,
    pub start_nonce: u64,
    pub range: u64,
}

#[derive(Debug)]
pub(super) enum WorkerEvent {
    Found {
        engine: usize,
        unit_id: u64,
        nonce: u32,
        block: [u8; DATA_LEN],
    },
    Exhausted {
        engine: usize,
        unit_id: u64,
        range: u64,
    },
    Stopped {
        engine: usize,
        unit_id: u64,
    },
    Failed {
        engine: usize,
        unit_id: u64,
        message: String,
    },
}

#[derive(Debug)]
struct WorkerStats {
    /// Hashes per second of the last unit searched to the end, as f64 bits.
    rate_bits: AtomicU64,
    /// Milliseconds after pool start at which the worker last asked for work.
    alive_at_ms: AtomicU64,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            rate_bits: AtomicU64::new(0f64.to_bits()),
            alive_at_ms: AtomicU64::new(0),
        }
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}

struct EngineWorker {
    stats: Arc<WorkerStats>,
    handle: JoinHandle<Miner>,
}

pub(super) struct EnginePool {
    started_at: Instant,
    running: Arc<AtomicBool>,
    work_tx: Option<Sender<WorkUnit>>,
    work_rx: Receiver<WorkUnit>,
    events_rx: Receiver<WorkerEvent>,
    stop_handles: Vec<StopHandle>,
    workers: Vec<EngineWorker>,
}

impl EnginePool {
    pub(super) fn start(miners: Vec<Miner>) -> Result<Self> {
        let started_at = Instant::now();
        let running = Arc::new(AtomicBool::new(true));
        let (work_tx, work_rx) = bounded::<WorkUnit>(WORK_QUEUE_CAPACITY);
        let (events_tx, events_rx) = unbounded::<WorkerEvent>();

        let mut stop_handles = Vec::with_capacity(miners.len());
        let mut workers = Vec::with_capacity(miners.len());
        for (engine, miner) in miners.into_iter().enumerate() {
            stop_handles.push(miner.stop_handle());
            let stats = Arc::new(WorkerStats::new());
            let ctx = WorkerContext {
                engine,
                started_at,
                running: Arc::clone(&running),
                work_rx: work_rx.clone(),
                events_tx: events_tx.clone(),
                stats: Arc::clone(&stats),
            };
            let handle = thread::Builder::new()
                .name(format!("cellminer-worker-{engine}"))
                .spawn(move || worker_loop(miner, ctx))
                .map_err(|err| anyhow!("failed to spawn worker {engine}: {err}"))?;
            workers.push(EngineWorker { stats, handle });
        }

        Ok(Self {
            started_at,
            running,
            work_tx: Some(work_tx),
            work_rx,
            events_rx,
            stop_handles,
            workers,
        })
    }

    pub(super) fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events_rx
    }

    pub(super) fn queued(&self) -> usize {
        self.work_rx.len()
    }

    pub(super) fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue `unit`, giving up after `timeout` when the queue stays full.
    pub(super) fn submit(&self, unit: WorkUnit, timeout: Duration) -> Result<Option<WorkUnit>> {
        let sender = self
            .work_tx
            .as_ref()
            .ok_or_else(|| anyhow!("engine pool is shut down"))?;
        match sender.send_timeout(unit, timeout) {
            Ok(()) => Ok(None),
            Err(SendTimeoutError::Timeout(unit)) => Ok(Some(unit)),
            Err(SendTimeoutError::Disconnected(_)) => Err(anyhow!("all engine workers exited")),
        }
    }

    pub(super) fn total_rate(&self) -> f64 {
        self.workers.iter().map(|worker| worker.stats.rate()).sum()
    }

    pub(super) fn alive(&self) -> usize {
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        let window_ms = ALIVE_WINDOW.as_millis() as u64;
        self.workers
            .iter()
            .filter(|worker| !worker.handle.is_finished())
            .filter(|worker| {
                now_ms.saturating_sub(worker.stats.alive_at_ms.load(Ordering::Relaxed)) <= window_ms
            })
            .count()
    }

    pub(super) fn stop_handles(&self) -> Vec<StopHandle> {
        self.stop_handles.clone()
    }

    /// Stop every engine, close the queue and hand the miners back.
    pub(super) fn shutdown(mut self) -> Vec<Miner> {
        self.running.store(false, Ordering::SeqCst);
        self.work_tx = None;
        while self.work_rx.try_recv().is_ok() {}
        for stop in &self.stop_handles {
            stop.stop();
        }

        let mut miners = Vec::with_capacity(self.workers.len());
        for (engine, worker) in self.workers.drain(..).enumerate() {
            match worker.handle.join() {
                Ok(miner) => miners.push(miner),
                Err(_) => super::ui::error("WORKER", format!("worker {engine} panicked")),
            }
        }
        miners
    }
}

struct WorkerContext {
    engine: usize,
    started_at: Instant,
    running: Arc<AtomicBool>,
    work_rx: Receiver<WorkUnit>,
    events_tx: Sender<WorkerEvent>,
    stats: Arc<WorkerStats>,
}

fn worker_loop(mut miner: Miner, ctx: WorkerContext) -> Miner {
    while ctx.running.load(Ordering::Relaxed) {
        let started = Instant::now();
        ctx.stats.alive_at_ms.store(
            ctx.started_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );

        debug!(target: "cellminer::worker", "worker {} waiting ({} queued)", ctx.engine, ctx.work_rx.len());
        let Ok(unit) = ctx.work_rx.recv() else {
            break;
        };

        let event = match run_unit(&mut miner, &unit) {
            Ok(RunOutcome::Found(nonce)) => WorkerEvent::Found {
                engine: ctx.engine,
                unit_id: unit.id,
                nonce,
                block: splice_nonce(&unit.data, nonce),
            },
            Ok(RunOutcome::NotFound) => {
                let elapsed = started.elapsed().as_secs_f64().max(0.001);
                ctx.stats
                    .rate_bits
                    .store((unit.range as f64 / elapsed).to_bits(), Ordering::Relaxed);
                WorkerEvent::Exhausted {
                    engine: ctx.engine,
                    unit_id: unit.id,
                    range: unit.range,
                }
            }
            Ok(RunOutcome::Stopped) => WorkerEvent::Stopped {
                engine: ctx.engine,
                unit_id: unit.id,
            },
            Err(err) => WorkerEvent::Failed {
                engine: ctx.engine,
                unit_id: unit.id,
                message: err.diagnostic(),
            },
        };

        let failed = matches!(event, WorkerEvent::Failed { .. });
        if ctx.events_tx.send(event).is_err() || failed {
            break;
        }
    }
    miner
}

fn run_unit(miner: &mut Miner, unit: &WorkUnit) -> cellminer::Result<RunOutcome> {
    miner.load_work(&unit.data[..], &unit.target[..], unit.start_nonce, unit.range)?;
    miner.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellminer::Realization;

    fn unit(id: u64, target: u8, start_nonce: u64, range: u64) -> WorkUnit {
        WorkUnit {
            id,
            data: Arc::new([0u8; DATA_LEN]),
            target: Arc::new([target; TARGET_LEN]),
            start_nonce,
            range,
        }
    }

    #[test]
    fn workers_report_each_unit_and_return_their_miners() {
        let miners = (0..2)
            .map(|_| Miner::create(Realization::Local).expect("miner should be created"))
            .collect();
        let pool = EnginePool::start(miners).expect("pool should start");

        assert!(pool
            .submit(unit(1, 0xff, 7, 1), Duration::from_secs(1))
            .expect("submit should succeed")
            .is_none());
        assert!(pool
            .submit(unit(2, 0x00, 0, 64), Duration::from_secs(1))
            .expect("submit should succeed")
            .is_none());

        let mut found = None;
        let mut exhausted = None;
        for _ in 0..2 {
            match pool
                .events()
                .recv_timeout(Duration::from_secs(10))
                .expect("worker should report")
            {
                WorkerEvent::Found { unit_id, nonce, block, .. } => {
                    found = Some((unit_id, nonce, block));
                }
                WorkerEvent::Exhausted { unit_id, range, .. } => exhausted = Some((unit_id, range)),
                other => panic!("unexpected event {other:?}"),
            }
        }

        let (unit_id, nonce, block) = found.expect("unit 1 should find a nonce");
        assert_eq!((unit_id, nonce), (1, 7));
        assert_eq!(&block[76..80], &7u32.to_be_bytes());
        assert_eq!(exhausted, Some((2, 64)));
        assert!(pool.total_rate() > 0.0);
        assert_eq!(pool.alive(), 2);

        let miners = pool.shutdown();
        assert_eq!(miners.len(), 2);
    }
}
