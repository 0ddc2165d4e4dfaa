mod bench;
mod engine_pool;
pub(crate) mod ui;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use cellminer::backend::evaluator::Sha256dEvaluator;
use cellminer::backend::isolated::IsolatedConfig;
use cellminer::backend::signal::StopHandle;
use cellminer::backend::EngineProgram;
use cellminer::binding::configure_isolated;
use cellminer::{physical_engines, usable_engines, Miner, Realization};
use cellminer_work_spec::{header_hash, QUANTUM};
use crossbeam_channel::after;

use crate::config::{EngineConfig, SearchConfig};
use engine_pool::{EnginePool, WorkUnit, WorkerEvent};
use ui::{error, info, startup_banner, success, warn};

pub(crate) use bench::run_benchmark;

const SUBMIT_WAIT: Duration = Duration::from_millis(50);

/// Stop handles reachable from the Ctrl-C handler.
#[derive(Clone, Default)]
pub(crate) struct Shutdown {
    requested: Arc<AtomicBool>,
    stops: Arc<Mutex<Vec<StopHandle>>>,
}

impl Shutdown {
    pub(crate) fn install() -> Result<Self> {
        let shutdown = Self::default();
        let handler = shutdown.clone();
        ctrlc::set_handler(move || handler.request())?;
        Ok(shutdown)
    }

    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let stops = self.stops.lock().unwrap_or_else(PoisonError::into_inner);
        for stop in stops.iter() {
            stop.stop();
        }
    }

    pub(crate) fn requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    fn watch(&self, handles: Vec<StopHandle>) {
        *self.stops.lock().unwrap_or_else(PoisonError::into_inner) = handles;
        if self.requested() {
            self.request();
        }
    }
}

pub(crate) fn print_info() {
    for realization in [Realization::Local, Realization::Isolated] {
        info(
            "ENGINES",
            format!(
                "{realization}: physical={} usable={}",
                format_count(physical_engines(realization)),
                format_count(usable_engines(realization)),
            ),
        );
    }
}

fn format_count(count: Option<usize>) -> String {
    count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
}

fn configure_platform(cfg: &EngineConfig) {
    if cfg.realization == Realization::Isolated
        && !configure_isolated(IsolatedConfig {
            pin_cores: cfg.pin_cores,
            ..IsolatedConfig::default()
        })
    {
        warn("ENGINES", "isolated platform already configured; ignoring pin setting");
    }
}

fn create_miners(cfg: &EngineConfig) -> Result<Vec<Miner>> {
    let evaluator = Arc::new(Sha256dEvaluator::new(cfg.check_interval));
    (0..cfg.engines)
        .map(|engine| {
            let mut miner =
                Miner::with_program(cfg.realization, EngineProgram::worker(evaluator.clone()))
                    .map_err(|err| anyhow!("engine {engine}: {}", err.diagnostic()))?;
            if cfg.debug {
                miner.set_debug();
            }
            Ok(miner)
        })
        .collect()
}

/// Cut `[start_nonce, start_nonce + range)` into at most `slices` units.
/// The whole 32-bit space in the default slice count gives units of
/// [`QUANTUM`] nonces each.
fn slice_work(start_nonce: u64, range: u64, slices: u64) -> Vec<(u64, u64)> {
    let slices = slices.clamp(1, range.max(1));
    let step = range.div_ceil(slices);
    let end = start_nonce.saturating_add(range);
    (0..slices)
        .map(|i| start_nonce.saturating_add(i.saturating_mul(step)))
        .take_while(|start| *start < end)
        .map(|start| (start, step.min(end - start)))
        .collect()
}

pub(crate) fn run_search(cfg: &SearchConfig, shutdown: &Shutdown) -> Result<()> {
    let engines = &cfg.engines;
    let units = slice_work(cfg.start_nonce, cfg.range, cfg.slices);

    startup_banner(
        "nonce search",
        &format!("{} realization", engines.realization),
        &[
            ("engines", engines.engines.to_string()),
            ("start nonce", format!("{:#010x}", cfg.start_nonce)),
            ("range", cfg.range.to_string()),
            ("work units", units.len().to_string()),
            (
                "unit size",
                units.first().map_or(0, |unit| unit.1).to_string(),
            ),
            ("full slice", QUANTUM.to_string()),
            ("target", hex::encode(cfg.target)),
        ],
    );

    configure_platform(engines);
    let miners = create_miners(engines)?;
    let pool = EnginePool::start(miners)?;
    shutdown.watch(pool.stop_handles());

    let result = drive_search(cfg, units, &pool, shutdown);
    let _ = pool.shutdown();
    result
}

fn drive_search(
    cfg: &SearchConfig,
    units: Vec<(u64, u64)>,
    pool: &EnginePool,
    shutdown: &Shutdown,
) -> Result<()> {
    let data = Arc::new(cfg.data);
    let target = Arc::new(cfg.target);
    let total = units.len();
    let mut pending = units
        .into_iter()
        .enumerate()
        .map(|(id, (start_nonce, range))| WorkUnit {
            id: id as u64,
            data: Arc::clone(&data),
            target: Arc::clone(&target),
            start_nonce,
            range,
        });
    let mut next_unit = pending.next();
    let mut finished = 0usize;
    let mut failed_workers = 0usize;
    let mut next_status = Instant::now() + cfg.status_interval;

    while !shutdown.requested() {
        if let Some(unit) = next_unit.take() {
            next_unit = match pool.submit(unit, SUBMIT_WAIT)? {
                Some(unit) => Some(unit),
                None => pending.next(),
            };
        }

        let wait = if next_unit.is_some() {
            SUBMIT_WAIT
        } else {
            next_status.saturating_duration_since(Instant::now())
        };
        crossbeam_channel::select! {
            recv(pool.events()) -> event => {
                let event = event.map_err(|_| anyhow!("worker event channel closed"))?;
                match event {
                    WorkerEvent::Found { engine, unit_id, nonce, block } => {
                        let digest = header_hash(&block, nonce);
                        success(
                            "FOUND",
                            format!("engine {engine} unit {unit_id}: nonce={nonce:#010x}"),
                        );
                        info("FOUND", format!("hash {}", hex::encode(digest)));
                        info("FOUND", format!("data {}", hex::encode(block)));
                        return Ok(());
                    }
                    WorkerEvent::Exhausted { engine, unit_id, range } => {
                        log::debug!(
                            target: "cellminer::search",
                            "engine {engine} exhausted unit {unit_id} ({range} nonces)"
                        );
                        finished += 1;
                    }
                    WorkerEvent::Stopped { engine, unit_id } => {
                        warn("WORKER", format!("engine {engine} stopped during unit {unit_id}"));
                        finished += 1;
                    }
                    WorkerEvent::Failed { engine, unit_id, message } => {
                        error("WORKER", format!("engine {engine} failed on unit {unit_id}: {message}"));
                        finished += 1;
                        failed_workers += 1;
                        if failed_workers == pool.workers() {
                            bail!("all {} engine workers failed", pool.workers());
                        }
                    }
                }
                if finished == total && next_unit.is_none() {
                    info("SEARCH", format!("no nonce meets the target in {total} units"));
                    return Ok(());
                }
            }
            recv(after(wait)) -> _ => {}
        }

        if Instant::now() >= next_status {
            print_status(pool, finished, total);
            next_status = Instant::now() + cfg.status_interval;
        }
    }

    info("SEARCH", "shutting down");
    Ok(())
}

fn print_status(pool: &EnginePool, finished: usize, total: usize) {
    info(
        "STATUS",
        format!(
            "{:.3} Mh/s | queues: W:{} | units: {finished}/{total}",
            pool.total_rate() / 1_000_000.0,
            pool.queued()
        ),
    );
    let alive = pool.alive();
    log::debug!(target: "cellminer::status", "{alive} miners alive");
    let dead = pool.workers().saturating_sub(alive);
    if dead > 0 {
        warn("STATUS", format!("{dead} miners dead"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellminer_work_spec::NSLICES;

    #[test]
    fn full_space_splits_into_quantum_sized_slices() {
        let units = slice_work(0, 1 << 32, NSLICES);
        assert_eq!(units.len(), NSLICES as usize);
        assert!(units.iter().all(|(_, range)| *range == QUANTUM));
        assert_eq!(units[1].0, QUANTUM);
    }

    #[test]
    fn uneven_ranges_cover_every_nonce_once() {
        let units = slice_work(10, 101, 4);
        let covered: u64 = units.iter().map(|(_, range)| range).sum();
        assert_eq!(covered, 101);
        assert_eq!(units.first(), Some(&(10, 26)));
        assert_eq!(units.last().map(|(start, range)| start + range), Some(111));
    }

    #[test]
    fn more_slices_than_nonces_yields_single_nonce_units() {
        let units = slice_work(5, 3, 128);
        assert_eq!(units, vec![(5, 1), (6, 1), (7, 1)]);
    }

    #[test]
    fn ranges_near_u64_max_do_not_overflow() {
        let units = slice_work(1, u64::MAX, 128);
        assert_eq!(units.len(), 128);
        assert!(units.iter().all(|(_, range)| *range > 0));
        let covered: u64 = units.iter().map(|(_, range)| range).sum();
        assert_eq!(covered, u64::MAX - 1);
    }
}
