use thiserror::Error;

use crate::backend::transfer::TransferError;

/// Capacity of the diagnostic text handed back across the binding layer.
pub const ERRSTR_MAX: usize = 128;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("unable to allocate aligned memory: {0}")]
    Allocation(String),

    #[error("failed to create engine context: {0}")]
    Context(String),

    #[error("failed to load engine program: {0}")]
    ProgramLoad(String),

    #[error("engine encountered transfer error")]
    Transfer(#[from] TransferError),

    #[error("engine worker stopped with {reason} (0x{code:08x})")]
    EngineFault { reason: &'static str, code: u32 },

    #[error("error running engine context: {0}")]
    Runtime(String),

    #[error("{field} must be {expected} bytes, got {actual}")]
    ContractViolation {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl MinerError {
    /// Message clipped to [`ERRSTR_MAX`] bytes.
    pub fn diagnostic(&self) -> String {
        let mut text = self.to_string();
        if text.len() > ERRSTR_MAX {
            let mut cut = ERRSTR_MAX;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_message_carries_reason_and_hex_code() {
        let err = MinerError::EngineFault {
            reason: "RUNTIME_EXCEPTION",
            code: 0x2a,
        };
        assert_eq!(
            err.to_string(),
            "engine worker stopped with RUNTIME_EXCEPTION (0x0000002a)"
        );
    }

    #[test]
    fn diagnostic_is_clipped_on_char_boundary() {
        let err = MinerError::Runtime("é".repeat(200));
        let text = err.diagnostic();
        assert!(text.len() <= ERRSTR_MAX);
        assert!(text.starts_with("error running engine context: "));
    }
}
