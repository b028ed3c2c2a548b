//! Sequences and sequence groups: the per-request state machine.
//!
//! A [`Sequence`] is one linear token stream with its computed-token
//! accounting. A [`SequenceGroup`] is a request together with all of its
//! live child sequences; beam search and multi-sample decoding grow the
//! group by forking children, and every child shares the prompt prefix.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::request::{LoraRequest, PromptAdapterRequest, RequestParams, SamplingParams};
use super::types::{Logprobs, RequestId, SeqId, TokenId};

/// Lifecycle status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Waiting,
    Running,
    Swapped,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
    FinishedIgnored,
}

impl SequenceStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SequenceStatus::FinishedStopped
                | SequenceStatus::FinishedLengthCapped
                | SequenceStatus::FinishedAborted
                | SequenceStatus::FinishedIgnored
        )
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            SequenceStatus::FinishedStopped => Some(FinishReason::Stop),
            SequenceStatus::FinishedLengthCapped => Some(FinishReason::Length),
            SequenceStatus::FinishedAborted => Some(FinishReason::Abort),
            SequenceStatus::FinishedIgnored => Some(FinishReason::Ignore),
            _ => None,
        }
    }
}

/// User-visible reason a sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Abort,
    Ignore,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Abort => "abort",
            FinishReason::Ignore => "ignored",
        }
    }
}

/// Which stop condition fired, when the reason was `Stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    Eos,
    StopToken(TokenId),
    StopString(String),
}

/// Whether the sequence is still ingesting known tokens or generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStage {
    Prefill,
    Decode,
}

/// One linear token stream.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub prompt_token_ids: Vec<TokenId>,
    pub output_token_ids: Vec<TokenId>,
    /// Per-output-position logprobs, aligned with `output_token_ids`.
    pub output_logprobs: Vec<Logprobs>,
    pub cumulative_logprob: f32,
    pub status: SequenceStatus,
    pub stop_reason: Option<StopReason>,
    /// Detokenized output accumulated for stop-string checks and delivery.
    pub output_text: String,
    pub eos_token_id: Option<TokenId>,
    block_size: usize,
    num_computed_tokens: usize,
    stage: SequenceStage,
}

impl Sequence {
    pub fn new(
        seq_id: SeqId,
        prompt_token_ids: Vec<TokenId>,
        block_size: usize,
        eos_token_id: Option<TokenId>,
    ) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            output_logprobs: Vec::new(),
            cumulative_logprob: 0.0,
            status: SequenceStatus::Waiting,
            stop_reason: None,
            output_text: String::new(),
            eos_token_id,
            block_size,
            num_computed_tokens: 0,
            stage: SequenceStage::Prefill,
        }
    }

    pub fn len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn token_at(&self, position: usize) -> Option<TokenId> {
        if position < self.prompt_token_ids.len() {
            self.prompt_token_ids.get(position).copied()
        } else {
            self.output_token_ids
                .get(position - self.prompt_token_ids.len())
                .copied()
        }
    }

    pub fn last_token_id(&self) -> Option<TokenId> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Token ids at positions `[start, start + count)` across the prompt
    /// and output streams.
    pub fn token_slice(&self, start: usize, count: usize) -> Vec<TokenId> {
        (start..start + count)
            .filter_map(|pos| self.token_at(pos))
            .collect()
    }

    pub fn append_token(&mut self, token_id: TokenId, logprobs: Logprobs) {
        debug_assert!(!self.status.is_finished());
        if let Some(lp) = logprobs.get(&token_id) {
            self.cumulative_logprob += *lp;
        }
        self.output_token_ids.push(token_id);
        self.output_logprobs.push(logprobs);
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Tokens whose KV entries the executor has not produced yet.
    pub fn num_uncomputed_tokens(&self) -> usize {
        self.len() - self.num_computed_tokens
    }

    /// Advance the computed-token watermark; monotonically non-decreasing,
    /// flips the stage to decode when every known token is covered.
    pub fn update_num_computed_tokens(&mut self, num_new: usize) {
        self.num_computed_tokens += num_new;
        debug_assert!(self.num_computed_tokens <= self.len());
        if self.num_uncomputed_tokens() == 0 {
            self.stage = SequenceStage::Decode;
        }
    }

    pub fn is_prefill(&self) -> bool {
        self.stage == SequenceStage::Prefill
    }

    /// Discard computed-token state so the sequence can be re-prefilled
    /// after a recompute preemption.
    pub fn reset_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.stage = SequenceStage::Prefill;
    }

    pub fn n_blocks_needed(&self) -> usize {
        (self.len() + self.block_size - 1) / self.block_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Status transition; a finished sequence never becomes unfinished.
    pub fn set_status(&mut self, status: SequenceStatus) {
        if self.status.is_finished() {
            return;
        }
        self.status = status;
    }

    /// Copy of this sequence under a new id, for beam-search forking.
    pub fn fork(&self, new_seq_id: SeqId) -> Sequence {
        let mut child = self.clone();
        child.seq_id = new_seq_id;
        child
    }

    /// Length-normalized score used to rank finished beams.
    pub fn beam_score(&self, length_penalty: f32) -> f32 {
        let len = self.output_len().max(1) as f32;
        self.cumulative_logprob / len.powf(length_penalty)
    }
}

/// Latency bookkeeping for one request.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub arrival_time: Instant,
    pub last_token_time: Instant,
    pub first_scheduled_time: Option<Instant>,
    pub first_token_time: Option<Instant>,
    pub time_in_queue: Option<Duration>,
    pub finished_time: Option<Instant>,
}

impl RequestMetrics {
    fn new(arrival_time: Instant) -> Self {
        Self {
            arrival_time,
            last_token_time: arrival_time,
            first_scheduled_time: None,
            first_token_time: None,
            time_in_queue: None,
            finished_time: None,
        }
    }
}

/// A request and all of its live child sequences.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    pub request_id: RequestId,
    pub seqs: Vec<Sequence>,
    pub params: RequestParams,
    pub metrics: RequestMetrics,
    pub lora: Option<LoraRequest>,
    pub prompt_adapter: Option<PromptAdapterRequest>,
    pub trace_headers: Option<HashMap<String, String>>,
    /// Immutable encoder prompt for encoder-decoder models.
    pub encoder_seq: Option<Sequence>,
    /// Pooled embedding, set when a pooling request completes.
    pub embeddings: Option<Vec<f32>>,
    /// Prompt-token logprobs extracted from the prefill pass.
    pub prompt_logprobs: Option<Vec<Option<Logprobs>>>,
    remaining_steps: usize,
}

impl SequenceGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: RequestId,
        seqs: Vec<Sequence>,
        params: RequestParams,
        arrival_time: Instant,
        lora: Option<LoraRequest>,
        prompt_adapter: Option<PromptAdapterRequest>,
        trace_headers: Option<HashMap<String, String>>,
        encoder_seq: Option<Sequence>,
    ) -> Self {
        debug_assert!(!seqs.is_empty());
        Self {
            request_id,
            seqs,
            params,
            metrics: RequestMetrics::new(arrival_time),
            lora,
            prompt_adapter,
            trace_headers,
            encoder_seq,
            embeddings: None,
            prompt_logprobs: None,
            remaining_steps: 0,
        }
    }

    pub fn prompt_token_ids(&self) -> &[TokenId] {
        &self.seqs[0].prompt_token_ids
    }

    pub fn sampling_params(&self) -> Option<&SamplingParams> {
        self.params.sampling()
    }

    pub fn first_seq(&self) -> &Sequence {
        &self.seqs[0]
    }

    pub fn get_seqs(&self, status: Option<SequenceStatus>) -> Vec<&Sequence> {
        match status {
            Some(status) => self.seqs.iter().filter(|s| s.status == status).collect(),
            None => self.seqs.iter().collect(),
        }
    }

    pub fn seqs_mut(&mut self, status: Option<SequenceStatus>) -> Vec<&mut Sequence> {
        match status {
            Some(status) => self
                .seqs
                .iter_mut()
                .filter(|s| s.status == status)
                .collect(),
            None => self.seqs.iter_mut().collect(),
        }
    }

    pub fn seq_by_id(&self, seq_id: SeqId) -> Option<&Sequence> {
        self.seqs.iter().find(|s| s.seq_id == seq_id)
    }

    pub fn seq_mut_by_id(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|s| s.seq_id == seq_id)
    }

    /// Detach a sequence from the group, e.g. an evicted beam.
    pub fn remove_seq(&mut self, seq_id: SeqId) -> Option<Sequence> {
        let idx = self.seqs.iter().position(|s| s.seq_id == seq_id)?;
        Some(self.seqs.remove(idx))
    }

    pub fn num_seqs(&self, status: Option<SequenceStatus>) -> usize {
        self.get_seqs(status).len()
    }

    pub fn num_unfinished_seqs(&self) -> usize {
        self.seqs.iter().filter(|s| !s.is_finished()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|s| s.is_finished())
    }

    /// Whether the group is still ingesting its prompt.
    pub fn is_prefill(&self) -> bool {
        self.seqs[0].is_prefill()
    }

    /// Upper bound on concurrently running sequences this group may need.
    /// During prefill a sampling group can still fan out to `best_of`
    /// children; afterwards the live children are the bound.
    pub fn max_num_running_seqs(&self) -> usize {
        if let RequestParams::Sampling(params) = &self.params {
            if self.is_prefill() {
                return params.actual_best_of();
            }
        }
        self.num_unfinished_seqs()
    }

    pub fn maybe_set_first_scheduled_time(&mut self, now: Instant) {
        if self.metrics.first_scheduled_time.is_none() {
            self.metrics.first_scheduled_time = Some(now);
            self.metrics.time_in_queue = Some(now - self.metrics.arrival_time);
        }
    }

    pub fn maybe_set_first_token_time(&mut self, now: Instant) {
        if self.metrics.first_token_time.is_none() && self.seqs[0].output_len() > 0 {
            self.metrics.first_token_time = Some(now);
        }
    }

    pub fn set_finished_time(&mut self, now: Instant) {
        if self.metrics.finished_time.is_none() {
            self.metrics.finished_time = Some(now);
        }
    }

    /// Time since the previous token (or scheduling event); also advances
    /// the last-token timestamp.
    pub fn last_latency(&mut self, now: Instant) -> Duration {
        let latency = now - self.metrics.last_token_time;
        self.metrics.last_token_time = now;
        latency
    }

    pub fn init_multi_step(&mut self, num_steps: usize) {
        self.remaining_steps = num_steps;
    }

    pub fn finish_step(&mut self) {
        self.remaining_steps = self.remaining_steps.saturating_sub(1);
    }

    pub fn remaining_steps(&self) -> usize {
        self.remaining_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(id: SeqId, prompt: &[TokenId]) -> Sequence {
        Sequence::new(id, prompt.to_vec(), 4, Some(2))
    }

    fn group(seqs: Vec<Sequence>) -> SequenceGroup {
        SequenceGroup::new(
            "req-0".to_string(),
            seqs,
            RequestParams::Sampling(SamplingParams::default()),
            Instant::now(),
            None,
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_prefill_to_decode_transition() {
        let mut s = seq(0, &[1, 2, 3, 4, 5]);
        assert!(s.is_prefill());
        assert_eq!(s.num_uncomputed_tokens(), 5);

        s.update_num_computed_tokens(3);
        assert!(s.is_prefill());
        s.update_num_computed_tokens(2);
        assert!(!s.is_prefill());
        assert_eq!(s.num_computed_tokens(), 5);

        s.append_token(7, Logprobs::new());
        assert_eq!(s.num_uncomputed_tokens(), 1);
        assert!(!s.is_prefill());
    }

    #[test]
    fn test_recompute_reset() {
        let mut s = seq(0, &[1, 2, 3]);
        s.update_num_computed_tokens(3);
        s.append_token(9, Logprobs::new());
        s.update_num_computed_tokens(1);

        s.reset_for_recompute();
        assert!(s.is_prefill());
        assert_eq!(s.num_computed_tokens(), 0);
        // Generated tokens are retained; re-prefill covers them too.
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn test_finished_status_is_sticky() {
        let mut s = seq(0, &[1]);
        s.set_status(SequenceStatus::Running);
        s.set_status(SequenceStatus::FinishedStopped);
        s.set_status(SequenceStatus::Running);
        assert_eq!(s.status, SequenceStatus::FinishedStopped);
        assert_eq!(s.status.finish_reason(), Some(FinishReason::Stop));
    }

    #[test]
    fn test_blocks_needed_rounds_up() {
        let mut s = seq(0, &[1, 2, 3, 4, 5]);
        assert_eq!(s.n_blocks_needed(), 2);
        for t in 0..3 {
            s.append_token(t, Logprobs::new());
        }
        assert_eq!(s.len(), 8);
        assert_eq!(s.n_blocks_needed(), 2);
        s.append_token(9, Logprobs::new());
        assert_eq!(s.n_blocks_needed(), 3);
    }

    #[test]
    fn test_fork_copies_state_under_new_id() {
        let mut s = seq(0, &[1, 2]);
        s.update_num_computed_tokens(2);
        let mut lp = Logprobs::new();
        lp.insert(5, -0.5);
        s.append_token(5, lp);

        let child = s.fork(7);
        assert_eq!(child.seq_id, 7);
        assert_eq!(child.output_token_ids, vec![5]);
        assert!((child.cumulative_logprob + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_group_max_running_seqs_during_prefill() {
        let params = SamplingParams {
            n: 1,
            best_of: Some(4),
            use_beam_search: true,
            ..Default::default()
        };
        let mut g = group(vec![seq(0, &[1, 2, 3])]);
        g.params = RequestParams::Sampling(params);
        assert_eq!(g.max_num_running_seqs(), 4);

        g.seqs[0].update_num_computed_tokens(3);
        assert_eq!(g.max_num_running_seqs(), 1);
    }

    #[test]
    fn test_group_finished_when_all_children_terminal() {
        let mut g = group(vec![seq(0, &[1]), seq(1, &[1])]);
        assert!(!g.is_finished());
        g.seqs[0].set_status(SequenceStatus::FinishedStopped);
        assert!(!g.is_finished());
        g.seqs[1].set_status(SequenceStatus::FinishedLengthCapped);
        assert!(g.is_finished());
    }

    #[test]
    fn test_token_slice_spans_prompt_and_output() {
        let mut s = seq(0, &[10, 11, 12]);
        s.append_token(20, Logprobs::new());
        s.append_token(21, Logprobs::new());
        assert_eq!(s.token_slice(1, 3), vec![11, 12, 20]);
        assert_eq!(s.last_token_id(), Some(21));
    }
}
