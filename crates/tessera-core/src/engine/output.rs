//! User-visible outputs assembled from sequence-group state.

use super::request::RequestParams;
use super::sequence::{FinishReason, RequestMetrics, SequenceGroup, StopReason};
use super::types::{Logprobs, RequestId, TokenId};

/// One completion candidate of a request.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    /// Rank within the request (0 is the best candidate).
    pub index: usize,
    pub text: String,
    pub token_ids: Vec<TokenId>,
    pub cumulative_logprob: f32,
    pub logprobs: Option<Vec<Logprobs>>,
    pub finish_reason: Option<FinishReason>,
    pub stop_reason: Option<StopReason>,
}

/// Snapshot of a generation request delivered from `step`.
#[derive(Debug, Clone)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<TokenId>,
    pub prompt_logprobs: Option<Vec<Option<Logprobs>>>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
    pub metrics: RequestMetrics,
}

/// Snapshot of a pooling (embedding) request.
#[derive(Debug, Clone)]
pub struct EmbeddingRequestOutput {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<TokenId>,
    pub embeddings: Vec<f32>,
    pub finished: bool,
}

/// What `step` returns: one entry per request with news this tick.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Completion(RequestOutput),
    Embedding(EmbeddingRequestOutput),
}

impl EngineOutput {
    pub fn request_id(&self) -> &str {
        match self {
            EngineOutput::Completion(o) => &o.request_id,
            EngineOutput::Embedding(o) => &o.request_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            EngineOutput::Completion(o) => o.finished,
            EngineOutput::Embedding(o) => o.finished,
        }
    }

    /// Build the delivery snapshot for a group's current state.
    pub fn from_group(group: &SequenceGroup) -> Self {
        match &group.params {
            RequestParams::Pooling(_) => EngineOutput::Embedding(EmbeddingRequestOutput {
                request_id: group.request_id.clone(),
                prompt_token_ids: group.prompt_token_ids().to_vec(),
                embeddings: group.embeddings.clone().unwrap_or_default(),
                finished: group.is_finished(),
            }),
            RequestParams::Sampling(params) => {
                // Rank candidates: beam groups by length-normalized score,
                // everything else by cumulative logprob; best first.
                let mut ranked: Vec<_> = group.seqs.iter().collect();
                if group.seqs.len() > 1 {
                    if params.use_beam_search {
                        ranked.sort_by(|a, b| {
                            b.beam_score(params.length_penalty)
                                .total_cmp(&a.beam_score(params.length_penalty))
                        });
                    } else {
                        ranked.sort_by(|a, b| {
                            b.cumulative_logprob.total_cmp(&a.cumulative_logprob)
                        });
                    }
                }
                let want_logprobs = params.logprobs.is_some();
                let outputs = ranked
                    .iter()
                    .take(params.n.max(1))
                    .enumerate()
                    .map(|(index, seq)| CompletionOutput {
                        index,
                        text: seq.output_text.clone(),
                        token_ids: seq.output_token_ids.clone(),
                        cumulative_logprob: seq.cumulative_logprob,
                        logprobs: want_logprobs.then(|| seq.output_logprobs.clone()),
                        finish_reason: seq.status.finish_reason(),
                        stop_reason: seq.stop_reason.clone(),
                    })
                    .collect();
                EngineOutput::Completion(RequestOutput {
                    request_id: group.request_id.clone(),
                    prompt_token_ids: group.prompt_token_ids().to_vec(),
                    prompt_logprobs: group.prompt_logprobs.clone(),
                    outputs,
                    finished: group.is_finished(),
                    metrics: group.metrics.clone(),
                })
            }
        }
    }
}
