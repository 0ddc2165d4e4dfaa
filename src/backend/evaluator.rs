use cellminer_work_spec::{hash_meets_target, header_hash};

use super::params::ParameterBlock;
use super::signal::SignalProbe;

pub const DEFAULT_CHECK_INTERVAL: u64 = 4096;

/// Exclusive upper bound of the nonce space.
const NONCE_SPACE_END: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Found(u32),
    Exhausted,
    /// Stop was requested; `next` is the first candidate not yet tested.
    Interrupted { next: u64 },
}

/// Inner search kernel run by an engine over one parameter block.
pub trait Evaluator: Send + Sync {
    /// Test candidates `from..block.start_nonce + block.range`.
    fn evaluate(&self, block: &ParameterBlock, from: u64, probe: &SignalProbe<'_>) -> Evaluation;
}

pub fn range_end(block: &ParameterBlock) -> u64 {
    block
        .start_nonce
        .saturating_add(block.range)
        .min(NONCE_SPACE_END)
}

/// Double SHA-256 over the 80-byte header carried in `data`.
#[derive(Debug, Clone, Copy)]
pub struct Sha256dEvaluator {
    check_interval: u64,
}

impl Default for Sha256dEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl Sha256dEvaluator {
    pub fn new(check_interval: u64) -> Self {
        Self {
            check_interval: check_interval.max(1),
        }
    }
}

impl Evaluator for Sha256dEvaluator {
    fn evaluate(&self, block: &ParameterBlock, from: u64, probe: &SignalProbe<'_>) -> Evaluation {
        let end = range_end(block);
        let mut nonce = from.max(block.start_nonce);
        let mut until_check = 0u64;

        while nonce < end {
            if until_check == 0 {
                if probe.interrupted() {
                    return Evaluation::Interrupted { next: nonce };
                }
                until_check = self.check_interval;
            }
            until_check -= 1;

            let candidate = nonce as u32;
            if hash_meets_target(&header_hash(&block.data, candidate), &block.target) {
                return Evaluation::Found(candidate);
            }
            nonce += 1;
        }

        Evaluation::Exhausted
    }
}
