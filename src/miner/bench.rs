use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use cellminer_work_spec::{DATA_LEN, TARGET_LEN};
use crossbeam_channel::after;
use serde::{Deserialize, Serialize};

use super::engine_pool::{EnginePool, WorkUnit, WorkerEvent};
use super::ui::{error, info, startup_banner, success};
use super::{configure_platform, create_miners, Shutdown, SUBMIT_WAIT};
use crate::config::{BenchConfig, EngineConfig};

/// Nonces per benchmark unit; only whole units count towards the rate.
const BENCH_UNIT: u64 = 1 << 16;
const NONCE_SPACE: u64 = 1 << 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchRun {
    round: u32,
    hashes: u64,
    elapsed_secs: f64,
    hps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BenchReport {
    realization: String,
    engines: usize,
    check_interval: u64,
    bench_secs: u64,
    rounds: u32,
    avg_hps: f64,
    median_hps: f64,
    min_hps: f64,
    max_hps: f64,
    runs: Vec<BenchRun>,
}

pub(crate) fn run_benchmark(cfg: &BenchConfig, shutdown: &Shutdown) -> Result<()> {
    let engines = &cfg.engines;
    startup_banner(
        "benchmark",
        &format!("{} realization", engines.realization),
        &[
            ("engines", engines.engines.to_string()),
            ("rounds", cfg.rounds.to_string()),
            ("seconds/round", cfg.secs.to_string()),
            ("check every", format!("{} nonces", engines.check_interval)),
        ],
    );

    configure_platform(engines);
    let mut runs = Vec::with_capacity(cfg.rounds as usize);
    let mut nonce_cursor = 0u64;

    for round in 0..cfg.rounds {
        if shutdown.requested() {
            break;
        }

        let pool = round_pool(engines)?;
        shutdown.watch(pool.stop_handles());
        let round_start = Instant::now();
        let stop_at = round_start + Duration::from_secs(cfg.secs);
        let result = bench_round(&pool, round, &mut nonce_cursor, stop_at, shutdown);
        let returned = pool.shutdown().len();
        let hashes = result?;

        let elapsed = round_start.elapsed().as_secs_f64().max(0.001);
        let hps = hashes as f64 / elapsed;
        info(
            "BENCH",
            format!(
                "round {}/{} | hashes={} | elapsed={:.2}s | {}",
                round + 1,
                cfg.rounds,
                hashes,
                elapsed,
                format_hashrate(hps),
            ),
        );
        runs.push(BenchRun {
            round: round + 1,
            hashes,
            elapsed_secs: elapsed,
            hps,
        });

        if returned != engines.engines {
            bail!("lost {} engine workers during round {}", engines.engines - returned, round + 1);
        }
    }

    summarize_benchmark(
        cfg,
        BenchReport {
            realization: engines.realization.to_string(),
            engines: engines.engines,
            check_interval: engines.check_interval,
            bench_secs: cfg.secs,
            rounds: runs.len() as u32,
            avg_hps: 0.0,
            median_hps: 0.0,
            min_hps: 0.0,
            max_hps: 0.0,
            runs,
        },
    )
}

/// Shutting a pool down leaves a stop pending on idle engines, so every
/// round starts from freshly created ones.
fn round_pool(engines: &EngineConfig) -> Result<EnginePool> {
    EnginePool::start(create_miners(engines)?)
}

fn bench_round(
    pool: &EnginePool,
    round: u32,
    nonce_cursor: &mut u64,
    stop_at: Instant,
    shutdown: &Shutdown,
) -> Result<u64> {
    let data = Arc::new(benchmark_data(round));
    let impossible_target = Arc::new([0u8; TARGET_LEN]);
    let mut next_id = 0u64;
    let mut hashes = 0u64;

    while Instant::now() < stop_at && !shutdown.requested() {
        let unit = WorkUnit {
            id: next_id,
            data: Arc::clone(&data),
            target: Arc::clone(&impossible_target),
            start_nonce: *nonce_cursor,
            range: BENCH_UNIT,
        };
        if pool.submit(unit, SUBMIT_WAIT)?.is_none() {
            next_id += 1;
            *nonce_cursor = (*nonce_cursor + BENCH_UNIT) % NONCE_SPACE;
        }

        let wait = stop_at
            .saturating_duration_since(Instant::now())
            .min(SUBMIT_WAIT);
        crossbeam_channel::select! {
            recv(pool.events()) -> event => {
                let event = event.map_err(|_| anyhow!("worker event channel closed"))?;
                hashes += handle_bench_event(event);
            }
            recv(after(wait)) -> _ => {}
        }
    }

    while let Ok(event) = pool.events().try_recv() {
        hashes += handle_bench_event(event);
    }
    Ok(hashes)
}

fn handle_bench_event(event: WorkerEvent) -> u64 {
    match event {
        WorkerEvent::Exhausted { range, .. } => range,
        WorkerEvent::Found { engine, nonce, .. } => {
            info("BENCH", format!("unexpected solution from engine {engine} at nonce={nonce}"));
            0
        }
        WorkerEvent::Stopped { .. } => 0,
        WorkerEvent::Failed { engine, message, .. } => {
            error("BENCH", format!("engine {engine} runtime error: {message}"));
            0
        }
    }
}

fn summarize_benchmark(cfg: &BenchConfig, mut report: BenchReport) -> Result<()> {
    let Some(stats) = RateStats::from_runs(&report.runs) else {
        info("BENCH", "benchmark aborted before first round");
        return Ok(());
    };
    report.avg_hps = stats.avg;
    report.median_hps = stats.median;
    report.min_hps = stats.min;
    report.max_hps = stats.max;

    success(
        "BENCH",
        format!(
            "{} rounds: avg {} (median {}, range {} .. {}), {} per engine",
            report.runs.len(),
            format_hashrate(stats.avg),
            format_hashrate(stats.median),
            format_hashrate(stats.min),
            format_hashrate(stats.max),
            format_hashrate(stats.avg / report.engines.max(1) as f64),
        ),
    );

    if let Some(path) = &cfg.baseline {
        let baseline = read_report(path)?;
        if baseline.avg_hps > 0.0 {
            info(
                "BENCH",
                format!(
                    "vs baseline {} ({} engines): {:+.2}%",
                    format_hashrate(baseline.avg_hps),
                    baseline.engines,
                    (stats.avg / baseline.avg_hps - 1.0) * 100.0
                ),
            );
        }
    }

    if let Some(path) = &cfg.output {
        write_report(path, &report)?;
        info("BENCH", format!("wrote report to {}", path.display()));
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct RateStats {
    avg: f64,
    median: f64,
    min: f64,
    max: f64,
}

impl RateStats {
    fn from_runs(runs: &[BenchRun]) -> Option<Self> {
        let mut rates: Vec<f64> = runs.iter().map(|run| run.hps).collect();
        rates.sort_by(f64::total_cmp);
        let (&min, &max) = (rates.first()?, rates.last()?);
        let mid = rates.len() / 2;
        let median = if rates.len() % 2 == 1 {
            rates[mid]
        } else {
            (rates[mid - 1] + rates[mid]) / 2.0
        };
        Some(Self {
            avg: rates.iter().sum::<f64>() / rates.len() as f64,
            median,
            min,
            max,
        })
    }
}

fn read_report(path: &Path) -> Result<BenchReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read baseline file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse baseline JSON {}", path.display()))
}

fn write_report(path: &Path, report: &BenchReport) -> Result<()> {
    let json =
        serde_json::to_string_pretty(report).context("failed to serialize benchmark report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write benchmark report {}", path.display()))
}

fn benchmark_data(round: u32) -> [u8; DATA_LEN] {
    let mut data = [0u8; DATA_LEN];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u8)
            .wrapping_mul(37)
            .wrapping_add(11)
            .wrapping_add((round % 251) as u8);
    }
    data
}

fn format_hashrate(hps: f64) -> String {
    const UNITS: [(f64, &str); 3] = [(1e9, "GH/s"), (1e6, "MH/s"), (1e3, "KH/s")];
    UNITS
        .iter()
        .find(|(scale, _)| hps >= *scale)
        .map_or_else(|| format!("{hps:.3} H/s"), |(scale, unit)| format!("{:.3} {unit}", hps / scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> BenchReport {
        BenchReport {
            realization: "local".to_string(),
            engines: 2,
            check_interval: 4096,
            bench_secs: 1,
            rounds: 1,
            avg_hps: 1500.0,
            median_hps: 1500.0,
            min_hps: 1500.0,
            max_hps: 1500.0,
            runs: vec![BenchRun {
                round: 1,
                hashes: 1500,
                elapsed_secs: 1.0,
                hps: 1500.0,
            }],
        }
    }

    fn runs(rates: &[f64]) -> Vec<BenchRun> {
        rates
            .iter()
            .zip(1..)
            .map(|(&hps, round)| BenchRun {
                round,
                hashes: hps as u64,
                elapsed_secs: 1.0,
                hps,
            })
            .collect()
    }

    #[test]
    fn rate_stats_take_the_middle_of_sorted_rounds() {
        assert_eq!(RateStats::from_runs(&[]), None);
        let odd = RateStats::from_runs(&runs(&[5.0, 1.0, 3.0])).expect("stats for three rounds");
        assert_eq!(odd, RateStats { avg: 3.0, median: 3.0, min: 1.0, max: 5.0 });
        let even = RateStats::from_runs(&runs(&[7.0, 1.0, 5.0, 3.0])).expect("stats for four rounds");
        assert_eq!(even.median, 4.0);
        assert_eq!(even.max, 7.0);
    }

    #[test]
    fn format_hashrate_units() {
        assert_eq!(format_hashrate(5.0), "5.000 H/s");
        assert_eq!(format_hashrate(5_000.0), "5.000 KH/s");
        assert_eq!(format_hashrate(5_000_000.0), "5.000 MH/s");
        assert_eq!(format_hashrate(2.5e9), "2.500 GH/s");
    }

    #[test]
    fn report_survives_a_trip_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("bench.json");
        write_report(&path, &sample_report()).expect("report should be written");
        let read = read_report(&path).expect("report should be read back");
        assert_eq!(read.engines, 2);
        assert_eq!(read.runs.len(), 1);
        assert_eq!(read.avg_hps, 1500.0);
    }

    #[test]
    fn later_rounds_do_not_start_with_a_stale_stop() {
        let engines = EngineConfig {
            realization: cellminer::Realization::Local,
            engines: 1,
            pin_cores: false,
            check_interval: 64,
            debug: false,
        };
        for round in 0..2 {
            let pool = round_pool(&engines).expect("round pool should start");
            let unit = WorkUnit {
                id: 0,
                data: Arc::new(benchmark_data(round)),
                target: Arc::new([0u8; TARGET_LEN]),
                start_nonce: 0,
                range: 256,
            };
            assert!(pool
                .submit(unit, Duration::from_secs(1))
                .expect("submit should succeed")
                .is_none());
            let event = pool
                .events()
                .recv_timeout(Duration::from_secs(10))
                .expect("worker should report");
            assert!(
                matches!(event, WorkerEvent::Exhausted { range: 256, .. }),
                "round {round} got {event:?}"
            );
            assert_eq!(pool.shutdown().len(), 1);
        }
    }

    #[test]
    fn benchmark_data_changes_every_round() {
        assert_ne!(benchmark_data(0), benchmark_data(1));
        assert_eq!(benchmark_data(3), benchmark_data(3 + 251));
    }
}
