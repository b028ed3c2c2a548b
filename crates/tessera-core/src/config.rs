//! Configuration types for the Tessera engine core

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::engine::types::TokenId;

/// How a running group is preempted when the KV cache runs out of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Choose per victim: recompute while it has produced few tokens
    /// relative to its prompt, swap afterwards.
    #[default]
    Auto,
    /// Always free the victim's blocks and re-prefill it later.
    Recompute,
    /// Always move the victim's blocks to the host pool.
    Swap,
}

/// Model-level limits the engine must respect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hard cap on prompt + generated tokens per sequence.
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Maximum logprob depth a request may ask for.
    #[serde(default = "default_max_logprobs")]
    pub max_logprobs: usize,

    /// Whether the model consumes a separate encoder prompt.
    #[serde(default)]
    pub is_encoder_decoder: bool,

    /// Whether LoRA adapters may be attached to requests.
    #[serde(default)]
    pub enable_lora: bool,

    /// EOS token id injected into new sequences' stop conditions.
    #[serde(default)]
    pub eos_token_id: Option<TokenId>,

    /// First decoder token for encoder-decoder models; falls back to
    /// `eos_token_id` when unset.
    #[serde(default)]
    pub decoder_start_token_id: Option<TokenId>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_model_len: default_max_model_len(),
            max_logprobs: default_max_logprobs(),
            is_encoder_decoder: false,
            enable_lora: false,
            eos_token_id: None,
            decoder_start_token_id: None,
        }
    }
}

/// KV-cache memory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per physical block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Device block count; normally profiled by the executor at startup.
    #[serde(default)]
    pub num_gpu_blocks: Option<usize>,

    /// Host (swap) block count; normally profiled by the executor.
    #[serde(default)]
    pub num_cpu_blocks: Option<usize>,

    /// Debug override for the profiled device block count.
    #[serde(default)]
    pub num_gpu_blocks_override: Option<usize>,

    /// Reuse blocks across requests that share a prompt prefix.
    #[serde(default)]
    pub enable_prefix_caching: bool,

    /// Fraction of device blocks kept free as admission headroom.
    #[serde(default = "default_watermark")]
    pub watermark: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            num_gpu_blocks: None,
            num_cpu_blocks: None,
            num_gpu_blocks_override: None,
            enable_prefix_caching: false,
            watermark: default_watermark(),
        }
    }
}

/// Scheduler limits and feature toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-batch token ceiling.
    #[serde(default = "default_max_num_batched_tokens")]
    pub max_num_batched_tokens: usize,

    /// Per-batch sequence-group ceiling.
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: usize,

    /// Split long prompts across iterations instead of prefilling whole.
    #[serde(default)]
    pub enable_chunked_prefill: bool,

    /// Forward passes per scheduler call; >1 enables multi-step decode.
    #[serde(default = "default_num_scheduler_steps")]
    pub num_scheduler_steps: usize,

    /// Overlap output post-processing with the next forward pass when the
    /// batch allows it.
    #[serde(default)]
    pub use_async_output_proc: bool,

    /// Selects the block-allocator generation; prefix caching requires v2.
    #[serde(default = "default_use_v2_block_manager")]
    pub use_v2_block_manager: bool,

    #[serde(default)]
    pub preemption_mode: PreemptionMode,

    /// Number of virtual engines; each owns a scheduler and a block
    /// partition.
    #[serde(default = "default_pipeline_parallel_size")]
    pub pipeline_parallel_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: default_max_num_batched_tokens(),
            max_num_seqs: default_max_num_seqs(),
            enable_chunked_prefill: false,
            num_scheduler_steps: default_num_scheduler_steps(),
            use_async_output_proc: false,
            use_v2_block_manager: default_use_v2_block_manager(),
            preemption_mode: PreemptionMode::Auto,
            pipeline_parallel_size: default_pipeline_parallel_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn is_multi_step(&self) -> bool {
        self.num_scheduler_steps > 1
    }

    /// Extra slots each block table is pre-extended by so a multi-step
    /// window can append without re-scheduling.
    pub fn num_lookahead_slots(&self) -> usize {
        self.num_scheduler_steps.saturating_sub(1)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCoreConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Emit periodic stats through the attached stat loggers.
    #[serde(default = "default_log_stats")]
    pub log_stats: bool,

    /// Return only outputs of requests that terminated this tick.
    #[serde(default)]
    pub step_return_finished_only: bool,
}

impl Default for EngineCoreConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            log_stats: default_log_stats(),
            step_return_finished_only: false,
        }
    }
}

impl EngineCoreConfig {
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.verify()?;
        Ok(config)
    }

    /// Cross-field validation; called once at engine construction.
    pub fn verify(&self) -> Result<()> {
        if self.cache.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        if self.scheduler.pipeline_parallel_size == 0 {
            return Err(Error::Config(
                "pipeline_parallel_size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.num_scheduler_steps == 0 {
            return Err(Error::Config(
                "num_scheduler_steps must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_num_batched_tokens < self.scheduler.max_num_seqs {
            return Err(Error::Config(
                "max_num_batched_tokens must be at least max_num_seqs".to_string(),
            ));
        }
        if self.cache.enable_prefix_caching && !self.scheduler.use_v2_block_manager {
            return Err(Error::Config(
                "prefix caching requires the v2 block manager".to_string(),
            ));
        }
        if self.scheduler.is_multi_step() && self.scheduler.enable_chunked_prefill {
            return Err(Error::Config(
                "multi-step decoding is incompatible with chunked prefill".to_string(),
            ));
        }
        if self.scheduler.is_multi_step() && self.scheduler.use_async_output_proc {
            return Err(Error::Config(
                "multi-step decoding is incompatible with async output processing".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_model_len() -> usize {
    4096
}

fn default_max_logprobs() -> usize {
    20
}

fn default_block_size() -> usize {
    16
}

fn default_watermark() -> f32 {
    0.01
}

fn default_max_num_batched_tokens() -> usize {
    2048
}

fn default_max_num_seqs() -> usize {
    256
}

fn default_num_scheduler_steps() -> usize {
    1
}

fn default_use_v2_block_manager() -> bool {
    true
}

fn default_pipeline_parallel_size() -> usize {
    1
}

fn default_log_stats() -> bool {
    true
}
