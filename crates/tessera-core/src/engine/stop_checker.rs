//! Per-token stop conditions.

use super::request::SamplingParams;
use super::sequence::{Sequence, SequenceStatus, StopReason};

/// Decides, after each appended token, whether a sequence is done.
pub struct StopChecker {
    max_model_len: usize,
}

impl StopChecker {
    pub fn new(max_model_len: usize) -> Self {
        Self { max_model_len }
    }

    /// Inspect the newest output token (and detokenized tail) and finish
    /// the sequence when a stop condition fires. EOS, stop tokens, and
    /// stop strings are suppressed until `min_tokens` have been produced;
    /// the length caps are not.
    pub fn maybe_stop(&self, seq: &mut Sequence, params: &SamplingParams) {
        let Some(last_token) = seq.output_token_ids.last().copied() else {
            return;
        };

        if seq.output_len() >= params.min_tokens {
            if !params.ignore_eos && seq.eos_token_id == Some(last_token) {
                seq.stop_reason = Some(StopReason::Eos);
                seq.set_status(SequenceStatus::FinishedStopped);
                return;
            }
            if params.stop_token_ids.contains(&last_token) {
                seq.stop_reason = Some(StopReason::StopToken(last_token));
                seq.set_status(SequenceStatus::FinishedStopped);
                return;
            }
            if let Some(stop_str) = params
                .stop
                .iter()
                .find(|s| !s.is_empty() && seq.output_text.ends_with(s.as_str()))
            {
                // The stop string itself is not part of the delivered text.
                let cut = seq.output_text.len() - stop_str.len();
                seq.output_text.truncate(cut);
                seq.stop_reason = Some(StopReason::StopString(stop_str.clone()));
                seq.set_status(SequenceStatus::FinishedStopped);
                return;
            }
        }

        if seq.len() >= self.max_model_len {
            seq.set_status(SequenceStatus::FinishedLengthCapped);
            return;
        }
        if let Some(max_tokens) = params.max_tokens {
            if seq.output_len() >= max_tokens {
                seq.set_status(SequenceStatus::FinishedLengthCapped);
            }
        }
    }
}
