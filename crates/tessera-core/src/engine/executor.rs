//! The model-executor boundary.
//!
//! The engine treats the executor as opaque: it profiles the cache, accepts
//! an [`ExecuteRequest`] describing one batch (plus the block movements to
//! perform first), and returns sampler outputs. For multi-step decode the
//! engine issues one `execute` call per sub-step against the same metadata;
//! the executor returns an empty list until the final sub-step, which
//! yields one [`SamplerOutput`] per forward pass of the window.

use std::sync::Arc;

use super::request::{LoraRequest, PromptAdapterRequest, SamplingParams};
use super::types::{BlockId, Logprobs, RequestId, SeqId, TokenId};
use crate::error::Result;

/// Per-sequence slice of the batch: the token ids to feed this step and
/// where their KV entries land.
#[derive(Debug, Clone)]
pub struct SequenceMetadata {
    pub seq_id: SeqId,
    /// Token ids at the positions computed this step.
    pub token_ids: Vec<TokenId>,
    /// Position of the first fed token.
    pub num_computed_tokens: usize,
    /// Physical blocks backing the sequence, in table order.
    pub block_table: Vec<BlockId>,
}

/// Per-group slice of the batch handed to the executor.
#[derive(Debug, Clone)]
pub struct SequenceGroupMetadata {
    pub request_id: RequestId,
    /// Prefill groups form the leading prefix of the batch.
    pub is_prompt: bool,
    pub seqs: Vec<SequenceMetadata>,
    pub sampling_params: Option<SamplingParams>,
    /// Tokens fed for this group this step (per sequence for decode).
    pub token_chunk_size: usize,
    /// False for prefill chunks that do not complete the prompt.
    pub do_sample: bool,
    pub lora: Option<LoraRequest>,
    pub prompt_adapter: Option<PromptAdapterRequest>,
    /// Encoder prompt for encoder-decoder models, fed on the first chunk.
    pub encoder_prompt_token_ids: Option<Vec<TokenId>>,
}

/// One batch submission.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub seq_group_metadata: Arc<Vec<SequenceGroupMetadata>>,
    pub blocks_to_swap_in: Vec<(BlockId, BlockId)>,
    pub blocks_to_swap_out: Vec<(BlockId, BlockId)>,
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    pub num_lookahead_slots: usize,
    pub running_queue_size: usize,
    /// Requests finished since the previous submission, so workers can
    /// drop their per-request state.
    pub finished_request_ids: Vec<RequestId>,
    /// Host-side copy of the previous step's sampled token ids; lets
    /// downstream pipeline stages prepare input without a broadcast.
    pub last_sampled_token_ids: Option<Vec<TokenId>>,
    pub virtual_engine: usize,
    /// Forward passes in the current window (1 outside multi-step).
    pub num_steps: usize,
    /// Sub-steps left in the window including this one.
    pub remaining_steps: usize,
}

/// One sampled candidate for one parent sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    pub parent_seq_id: SeqId,
    pub output_token: TokenId,
    pub logprobs: Logprobs,
}

/// Sampler output for one scheduled group in one forward pass.
#[derive(Debug, Clone, Default)]
pub struct SequenceGroupOutput {
    pub samples: Vec<SequenceOutput>,
    /// Per-prompt-position logprobs, present on the sampled prefill pass
    /// when the request asked for them.
    pub prompt_logprobs: Option<Vec<Option<Logprobs>>>,
    /// Pooled embedding for pooling requests.
    pub embeddings: Option<Vec<f32>>,
}

/// Output of one forward pass, aligned with the scheduled groups.
#[derive(Debug, Clone, Default)]
pub struct SamplerOutput {
    pub outputs: Vec<SequenceGroupOutput>,
    /// Host-resident copy of the sampled token ids, batch order.
    pub sampled_token_ids: Option<Vec<TokenId>>,
}

/// Contract between the engine core and the model execution backend.
pub trait ModelExecutor: Send {
    /// Profile how many device and host blocks the cache can hold.
    fn determine_num_available_blocks(&mut self) -> Result<(usize, usize)>;

    /// Size the physical KV cache after profiling.
    fn initialize_cache(&mut self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()>;

    /// Run the batch; performs the requested block moves first.
    fn execute(&mut self, request: &ExecuteRequest) -> Result<Vec<SamplerOutput>>;

    fn check_health(&self) -> Result<()>;

    /// Idle notification: no unfinished requests remain, workers may leave
    /// their execution loop.
    fn stop_remote_worker_execution_loop(&mut self) {}

    fn add_lora(&mut self, _lora: &LoraRequest) -> Result<bool> {
        Ok(false)
    }

    fn remove_lora(&mut self, _lora_id: u32) -> Result<bool> {
        Ok(false)
    }

    fn list_loras(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    fn pin_lora(&mut self, _lora_id: u32) -> Result<bool> {
        Ok(false)
    }

    fn add_prompt_adapter(&mut self, _adapter: &PromptAdapterRequest) -> Result<bool> {
        Ok(false)
    }

    fn remove_prompt_adapter(&mut self, _adapter_id: u32) -> Result<bool> {
        Ok(false)
    }

    fn list_prompt_adapters(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}

/// Column extraction for multi-step windows: one group's outputs across
/// all steps of the window, in step order.
pub fn outputs_for_group(outputs: &[SamplerOutput], group_idx: usize) -> Vec<&SequenceGroupOutput> {
    outputs
        .iter()
        .filter_map(|step| step.outputs.get(group_idx))
        .collect()
}
