//! Applies sampler outputs to sequence groups.
//!
//! Appends sampled tokens, maintains detokenized text, runs stop checks,
//! and performs beam selection. Block-table changes (forks of surviving
//! beams, frees of evicted ones) are *planned* here and returned as
//! [`SeqOps`]; the engine applies them through the scheduler so every
//! block mutation still funnels through the block manager.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::executor::{SequenceGroupOutput, SequenceOutput};
use super::request::SamplingParams;
use super::sequence::{Sequence, SequenceGroup, SequenceStatus};
use super::stop_checker::StopChecker;
use super::types::{SeqCounter, SeqId};
use crate::tokenizer::TokenizerBackend;

/// Block-table operations to apply after processing one group.
/// Forks are applied before frees.
#[derive(Debug, Default)]
pub struct SeqOps {
    /// (parent, child) pairs whose block tables must be shared.
    pub forks: Vec<(SeqId, SeqId)>,
    /// Sequences whose blocks must be returned (evicted beams).
    pub frees: Vec<SeqId>,
}

impl SeqOps {
    fn merge(&mut self, other: SeqOps) {
        self.forks.extend(other.forks);
        self.frees.extend(other.frees);
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty() && self.frees.is_empty()
    }
}

pub struct OutputProcessor {
    stop_checker: StopChecker,
    tokenizer: Option<Arc<dyn TokenizerBackend>>,
}

impl OutputProcessor {
    pub fn new(stop_checker: StopChecker, tokenizer: Option<Arc<dyn TokenizerBackend>>) -> Self {
        Self {
            stop_checker,
            tokenizer,
        }
    }

    /// Attach prompt logprobs from a (possibly chunked) prefill pass.
    pub fn process_prompt_logprobs(&self, group: &mut SequenceGroup, output: &SequenceGroupOutput) {
        let wants = group
            .sampling_params()
            .map(|p| p.prompt_logprobs.is_some())
            .unwrap_or(false);
        if !wants {
            return;
        }
        if let Some(prompt_logprobs) = &output.prompt_logprobs {
            group
                .prompt_logprobs
                .get_or_insert_with(Vec::new)
                .extend(prompt_logprobs.iter().cloned());
        }
    }

    /// Apply one step (or one multi-step window) of sampler output.
    ///
    /// With `is_async` the step driver already appended the sampled token
    /// via its pre-execute path, so only detokenization, stop checks, and
    /// finalization run here.
    pub fn process_outputs(
        &self,
        group: &mut SequenceGroup,
        outputs: &[&SequenceGroupOutput],
        is_async: bool,
        seq_counter: &mut SeqCounter,
    ) -> SeqOps {
        let Some(params) = group.sampling_params().cloned() else {
            return SeqOps::default();
        };
        let mut ops = SeqOps::default();
        for (step_idx, step) in outputs.iter().enumerate() {
            if group.is_finished() {
                // Remaining sub-steps of the window are discarded.
                break;
            }
            if step_idx > 0 {
                // The executor computed KV for the tokens appended by the
                // previous sub-step before sampling this one.
                for seq in group.seqs_mut(Some(SequenceStatus::Running)) {
                    let pending = seq.num_uncomputed_tokens();
                    seq.update_num_computed_tokens(pending);
                }
            }
            let step_ops = if params.use_beam_search {
                self.process_beam_step(group, step, &params, seq_counter)
            } else {
                self.process_sampling_step(group, step, &params, is_async, seq_counter)
            };
            ops.merge(step_ops);
        }
        ops
    }

    /// Temperature / multi-sample path: one sample continues each parent
    /// in place, extra samples fork children.
    fn process_sampling_step(
        &self,
        group: &mut SequenceGroup,
        output: &SequenceGroupOutput,
        params: &SamplingParams,
        skip_append: bool,
        seq_counter: &mut SeqCounter,
    ) -> SeqOps {
        let mut ops = SeqOps::default();
        let mut by_parent = samples_by_parent(output);
        let parent_ids: Vec<SeqId> = group
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .map(|s| s.seq_id)
            .collect();
        let mut new_children: Vec<Sequence> = Vec::new();

        for parent_id in parent_ids {
            let Some(samples) = by_parent.remove(&parent_id) else {
                continue;
            };
            for sample in samples.iter().skip(1) {
                let parent = group
                    .seq_by_id(parent_id)
                    .expect("running parent present in group");
                let child_id = seq_counter.next_id();
                let mut child = parent.fork(child_id);
                ops.forks.push((parent_id, child_id));
                child.append_token(sample.output_token, sample.logprobs.clone());
                self.detok_and_check(&mut child, params);
                new_children.push(child);
            }
            let first = samples[0];
            let parent = group
                .seq_mut_by_id(parent_id)
                .expect("running parent present in group");
            if !skip_append {
                parent.append_token(first.output_token, first.logprobs.clone());
            }
            self.detok_and_check(parent, params);
        }
        group.seqs.extend(new_children);
        ops
    }

    /// Beam search: rank every parent×candidate continuation by cumulative
    /// logprob, keep the top `beam_width`, fork where a parent survives
    /// more than once, evict parents that lost every continuation.
    fn process_beam_step(
        &self,
        group: &mut SequenceGroup,
        output: &SequenceGroupOutput,
        params: &SamplingParams,
        seq_counter: &mut SeqCounter,
    ) -> SeqOps {
        let beam_width = params.actual_best_of();
        let mut ops = SeqOps::default();

        let mut candidates: Vec<(&SequenceOutput, f32)> = output
            .samples
            .iter()
            .filter_map(|sample| {
                let parent = group.seq_by_id(sample.parent_seq_id)?;
                if parent.status != SequenceStatus::Running {
                    return None;
                }
                let logprob = sample
                    .logprobs
                    .get(&sample.output_token)
                    .copied()
                    .unwrap_or(0.0);
                Some((sample, parent.cumulative_logprob + logprob))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        candidates.truncate(beam_width);

        let mut survivors: HashMap<SeqId, Vec<&SequenceOutput>> = HashMap::new();
        for (sample, _) in &candidates {
            survivors
                .entry(sample.parent_seq_id)
                .or_default()
                .push(sample);
        }

        let parent_ids: Vec<SeqId> = group
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .map(|s| s.seq_id)
            .collect();
        let mut new_children: Vec<Sequence> = Vec::new();

        for parent_id in parent_ids {
            match survivors.remove(&parent_id) {
                None => {
                    // Every continuation of this beam was outranked.
                    debug!(seq_id = parent_id, "beam evicted");
                    group.remove_seq(parent_id);
                    ops.frees.push(parent_id);
                }
                Some(samples) => {
                    for sample in samples.iter().skip(1) {
                        let parent = group
                            .seq_by_id(parent_id)
                            .expect("surviving parent present in group");
                        let child_id = seq_counter.next_id();
                        let mut child = parent.fork(child_id);
                        ops.forks.push((parent_id, child_id));
                        child.append_token(sample.output_token, sample.logprobs.clone());
                        self.detok_and_check(&mut child, params);
                        new_children.push(child);
                    }
                    let first = samples[0];
                    let parent = group
                        .seq_mut_by_id(parent_id)
                        .expect("surviving parent present in group");
                    parent.append_token(first.output_token, first.logprobs.clone());
                    self.detok_and_check(parent, params);
                }
            }
        }
        group.seqs.extend(new_children);

        // The search completes once a full beam of hypotheses finished;
        // still-running beams cannot be delivered and are dropped.
        let num_finished = group.seqs.iter().filter(|s| s.is_finished()).count();
        if num_finished >= beam_width {
            let running: Vec<SeqId> = group
                .get_seqs(Some(SequenceStatus::Running))
                .iter()
                .map(|s| s.seq_id)
                .collect();
            for seq_id in running {
                group.remove_seq(seq_id);
                ops.frees.push(seq_id);
            }
        }
        ops
    }

    /// Extend the detokenized tail with the newest token, then stop-check.
    fn detok_and_check(&self, seq: &mut Sequence, params: &SamplingParams) {
        if let (Some(tokenizer), Some(&token)) =
            (self.tokenizer.as_ref(), seq.output_token_ids.last())
        {
            match tokenizer.decode(&[token]) {
                Ok(piece) => seq.output_text.push_str(&piece),
                Err(e) => debug!(seq_id = seq.seq_id, "detokenization failed: {e}"),
            }
        }
        self.stop_checker.maybe_stop(seq, params);
    }
}

fn samples_by_parent(output: &SequenceGroupOutput) -> HashMap<SeqId, Vec<&SequenceOutput>> {
    let mut by_parent: HashMap<SeqId, Vec<&SequenceOutput>> = HashMap::new();
    for sample in &output.samples {
        by_parent.entry(sample.parent_seq_id).or_default().push(sample);
    }
    by_parent
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::engine::request::RequestParams;
    use crate::engine::types::{Logprobs, TokenId};
    use crate::error::Result;

    const EOS: TokenId = 2;

    /// Tokens decode to single ASCII characters, so stop strings work.
    struct ByteTokenizer;

    impl TokenizerBackend for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn decode(&self, ids: &[TokenId]) -> Result<String> {
            Ok(ids.iter().map(|&id| (id as u8) as char).collect())
        }

        fn eos_token_id(&self) -> Option<TokenId> {
            Some(EOS)
        }
    }

    fn processor() -> OutputProcessor {
        OutputProcessor::new(StopChecker::new(1024), Some(Arc::new(ByteTokenizer)))
    }

    fn running_group(params: SamplingParams, num_seqs: usize) -> (SequenceGroup, SeqCounter) {
        let mut counter = SeqCounter::new();
        let seqs: Vec<Sequence> = (0..num_seqs)
            .map(|_| {
                let mut s = Sequence::new(counter.next_id(), vec![100, 101], 4, Some(EOS));
                s.set_status(SequenceStatus::Running);
                s.update_num_computed_tokens(2);
                s
            })
            .collect();
        let group = SequenceGroup::new(
            "r".to_string(),
            seqs,
            RequestParams::Sampling(params),
            Instant::now(),
            None,
            None,
            None,
            None,
        );
        (group, counter)
    }

    fn sample(parent: SeqId, token: TokenId, logprob: f32) -> SequenceOutput {
        let mut logprobs = Logprobs::new();
        logprobs.insert(token, logprob);
        SequenceOutput {
            parent_seq_id: parent,
            output_token: token,
            logprobs,
        }
    }

    fn step(samples: Vec<SequenceOutput>) -> SequenceGroupOutput {
        SequenceGroupOutput {
            samples,
            prompt_logprobs: None,
            embeddings: None,
        }
    }

    #[test]
    fn test_single_sample_appends_and_detokenizes() {
        let p = processor();
        let (mut group, mut counter) = running_group(SamplingParams::default(), 1);
        let out = step(vec![sample(0, b'h' as TokenId, -0.25)]);

        let ops = p.process_outputs(&mut group, &[&out], false, &mut counter);
        assert!(ops.is_empty());
        let seq = group.first_seq();
        assert_eq!(seq.output_token_ids, vec![b'h' as TokenId]);
        assert_eq!(seq.output_text, "h");
        assert!((seq.cumulative_logprob + 0.25).abs() < 1e-6);
        assert!(!seq.is_finished());
    }

    #[test]
    fn test_eos_finishes_group() {
        let p = processor();
        let (mut group, mut counter) = running_group(SamplingParams::default(), 1);
        let out = step(vec![sample(0, EOS, -0.1)]);

        p.process_outputs(&mut group, &[&out], false, &mut counter);
        assert!(group.is_finished());
        assert_eq!(group.first_seq().status, SequenceStatus::FinishedStopped);
    }

    #[test]
    fn test_async_mode_does_not_double_append() {
        let p = processor();
        let (mut group, mut counter) = running_group(SamplingParams::default(), 1);
        // The step driver already appended the token.
        group.seqs[0].append_token(b'x' as TokenId, Logprobs::new());
        let out = step(vec![sample(0, b'x' as TokenId, -0.5)]);

        p.process_outputs(&mut group, &[&out], true, &mut counter);
        let seq = group.first_seq();
        assert_eq!(seq.output_token_ids, vec![b'x' as TokenId]);
        assert_eq!(seq.output_text, "x");
    }

    #[test]
    fn test_stop_string_fires_after_detokenization() {
        let p = processor();
        let params = SamplingParams {
            stop: vec!["hi".to_string()],
            max_tokens: Some(100),
            ..Default::default()
        };
        let (mut group, mut counter) = running_group(params, 1);

        let o1 = step(vec![sample(0, b'h' as TokenId, -0.1)]);
        p.process_outputs(&mut group, &[&o1], false, &mut counter);
        assert!(!group.is_finished());

        let o2 = step(vec![sample(0, b'i' as TokenId, -0.1)]);
        p.process_outputs(&mut group, &[&o2], false, &mut counter);
        assert!(group.is_finished());
        // Stop string stripped from the delivered text.
        assert_eq!(group.first_seq().output_text, "");
    }

    #[test]
    fn test_parallel_sampling_forks_extra_children() {
        let p = processor();
        let params = SamplingParams {
            n: 2,
            best_of: Some(2),
            max_tokens: Some(100),
            ..Default::default()
        };
        let (mut group, mut counter) = running_group(params, 1);
        let out = step(vec![
            sample(0, b'a' as TokenId, -0.1),
            sample(0, b'b' as TokenId, -0.7),
        ]);

        let ops = p.process_outputs(&mut group, &[&out], false, &mut counter);
        assert_eq!(group.seqs.len(), 2);
        assert_eq!(ops.forks.len(), 1);
        let (parent, child) = ops.forks[0];
        assert_eq!(parent, 0);
        assert_eq!(group.seqs[0].output_token_ids, vec![b'a' as TokenId]);
        let forked = group.seq_by_id(child).unwrap();
        assert_eq!(forked.output_token_ids, vec![b'b' as TokenId]);
    }

    #[test]
    fn test_beam_selection_keeps_top_width_and_evicts() {
        let p = processor();
        let params = SamplingParams {
            n: 2,
            best_of: Some(2),
            use_beam_search: true,
            max_tokens: Some(100),
            ..Default::default()
        };
        let (mut group, mut counter) = running_group(params, 2);
        group.seqs[0].cumulative_logprob = -1.0;
        group.seqs[1].cumulative_logprob = -5.0;

        // Parent 0's continuations dominate: both slots go to parent 0,
        // parent 1 is evicted.
        let out = step(vec![
            sample(0, b'a' as TokenId, -0.1),
            sample(0, b'b' as TokenId, -0.2),
            sample(1, b'c' as TokenId, -0.1),
            sample(1, b'd' as TokenId, -0.2),
        ]);
        let ops = p.process_outputs(&mut group, &[&out], false, &mut counter);

        assert_eq!(ops.frees, vec![1]);
        assert_eq!(ops.forks.len(), 1);
        assert_eq!(group.seqs.len(), 2);
        assert!(group.seq_by_id(1).is_none());
        // In-place survivor took the best-ranked token.
        assert_eq!(group.seqs[0].output_token_ids, vec![b'a' as TokenId]);
    }

    #[test]
    fn test_beam_completes_when_enough_finished() {
        let p = processor();
        let params = SamplingParams {
            n: 2,
            best_of: Some(2),
            use_beam_search: true,
            max_tokens: Some(100),
            ..Default::default()
        };
        let (mut group, mut counter) = running_group(params, 2);

        let out = step(vec![sample(0, EOS, -0.1), sample(1, EOS, -0.2)]);
        let ops = p.process_outputs(&mut group, &[&out], false, &mut counter);
        assert!(group.is_finished());
        assert_eq!(group.seqs.len(), 2);
        assert!(ops.frees.is_empty());
    }

    #[test]
    fn test_multi_step_window_appends_in_order() {
        let p = processor();
        let params = SamplingParams {
            max_tokens: Some(100),
            ..Default::default()
        };
        let (mut group, mut counter) = running_group(params, 1);

        let s1 = step(vec![sample(0, b'x' as TokenId, -0.1)]);
        let s2 = step(vec![sample(0, b'y' as TokenId, -0.1)]);
        p.process_outputs(&mut group, &[&s1, &s2], false, &mut counter);

        let seq = group.first_seq();
        assert_eq!(seq.output_token_ids, vec![b'x' as TokenId, b'y' as TokenId]);
        assert_eq!(seq.output_text, "xy");
        // Every token but the newest has computed KV.
        assert_eq!(seq.num_uncomputed_tokens(), 1);
    }

    #[test]
    fn test_window_discarded_after_finish() {
        let p = processor();
        let (mut group, mut counter) = running_group(SamplingParams::default(), 1);
        let s1 = step(vec![sample(0, EOS, -0.1)]);
        let s2 = step(vec![sample(0, b'z' as TokenId, -0.1)]);
        p.process_outputs(&mut group, &[&s1, &s2], false, &mut counter);

        // The post-EOS sub-step was dropped.
        assert_eq!(group.first_seq().output_token_ids, vec![EOS]);
    }

    #[test]
    fn test_prompt_logprobs_accumulate_across_chunks() {
        let p = processor();
        let params = SamplingParams {
            prompt_logprobs: Some(1),
            ..Default::default()
        };
        let (mut group, _) = running_group(params, 1);

        let mut chunk1 = step(vec![]);
        chunk1.prompt_logprobs = Some(vec![None, Some(Logprobs::new())]);
        p.process_prompt_logprobs(&mut group, &chunk1);
        let mut chunk2 = step(vec![]);
        chunk2.prompt_logprobs = Some(vec![Some(Logprobs::new())]);
        p.process_prompt_logprobs(&mut group, &chunk2);

        assert_eq!(group.prompt_logprobs.as_ref().unwrap().len(), 3);
    }
}
