//! Shared identifier types for the engine core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique id of a request, assigned by the caller (or generated at admission).
pub type RequestId = String;

/// Unique id of a sequence within the engine.
pub type SeqId = u64;

/// Index of a physical KV-cache block in the block arena.
pub type BlockId = usize;

/// A single vocabulary token id.
pub type TokenId = u32;

/// Log-probabilities reported for one sampled position, keyed by token id.
pub type Logprobs = HashMap<TokenId, f32>;

/// Which memory pool a physical block lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Accelerator memory; blocks here are addressable by the model executor.
    Gpu,
    /// Host memory; the swap destination for preempted sequence groups.
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Gpu => write!(f, "GPU"),
            Device::Cpu => write!(f, "CPU"),
        }
    }
}

/// Monotonic generator for sequence ids.
#[derive(Debug, Default)]
pub struct SeqCounter(SeqId);

impl SeqCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next_id(&mut self) -> SeqId {
        let id = self.0;
        self.0 += 1;
        id
    }
}
