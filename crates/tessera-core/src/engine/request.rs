//! Request inputs and per-request parameters.
//!
//! A request enters the engine as an [`EngineCoreRequest`]: prompt inputs,
//! either sampling or pooling parameters, and optional adapter references.
//! Validation that does not need engine state lives here; admission-time
//! checks (duplicate ids, tokenizer availability) live in the engine.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{RequestId, TokenId};
use crate::error::{Error, Result};

/// A single prompt: raw text or pre-tokenized ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SingletonPrompt {
    Text(String),
    Tokens(Vec<TokenId>),
}

/// Prompt inputs for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInputs {
    Singleton(SingletonPrompt),
    /// Explicit encoder/decoder prompt; only valid for encoder-decoder
    /// models.
    EncoderDecoder {
        encoder: SingletonPrompt,
        decoder: Option<SingletonPrompt>,
    },
}

impl From<&str> for PromptInputs {
    fn from(text: &str) -> Self {
        PromptInputs::Singleton(SingletonPrompt::Text(text.to_string()))
    }
}

impl From<String> for PromptInputs {
    fn from(text: String) -> Self {
        PromptInputs::Singleton(SingletonPrompt::Text(text))
    }
}

impl From<Vec<TokenId>> for PromptInputs {
    fn from(tokens: Vec<TokenId>) -> Self {
        PromptInputs::Singleton(SingletonPrompt::Tokens(tokens))
    }
}

/// Sampling parameters for text generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of completions returned to the caller.
    #[serde(default = "default_n")]
    pub n: usize,

    /// Number of candidate sequences kept live; defaults to `n`. Beam
    /// search uses this as the beam width.
    #[serde(default)]
    pub best_of: Option<usize>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub top_k: Option<usize>,

    /// Generation cap; `None` runs until a stop condition or the model
    /// context cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<usize>,

    /// Stop conditions are suppressed until this many tokens exist.
    #[serde(default)]
    pub min_tokens: usize,

    /// Stop strings checked against the detokenized output.
    #[serde(default)]
    pub stop: Vec<String>,

    /// Token ids that terminate generation when sampled.
    #[serde(default)]
    pub stop_token_ids: Vec<TokenId>,

    #[serde(default)]
    pub ignore_eos: bool,

    /// Logprob depth per sampled token; `None` disables logprobs.
    #[serde(default)]
    pub logprobs: Option<usize>,

    /// Logprob depth per prompt token.
    #[serde(default)]
    pub prompt_logprobs: Option<usize>,

    #[serde(default)]
    pub use_beam_search: bool,

    /// Exponent of the length normalization applied to finished beams.
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,

    #[serde(default)]
    pub early_stopping: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: default_n(),
            best_of: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            max_tokens: default_max_tokens(),
            min_tokens: 0,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            logprobs: None,
            prompt_logprobs: None,
            use_beam_search: false,
            length_penalty: default_length_penalty(),
            early_stopping: false,
        }
    }
}

impl SamplingParams {
    pub fn actual_best_of(&self) -> usize {
        self.best_of.unwrap_or(self.n)
    }

    pub fn verify(&self) -> Result<()> {
        if self.n == 0 {
            return Err(Error::InvalidRequest("n must be at least 1".to_string()));
        }
        if self.actual_best_of() < self.n {
            return Err(Error::InvalidRequest(format!(
                "best_of must be at least n ({} < {})",
                self.actual_best_of(),
                self.n
            )));
        }
        if self.temperature < 0.0 {
            return Err(Error::InvalidRequest(
                "temperature must be non-negative".to_string(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidRequest(
                "top_p must be in (0, 1]".to_string(),
            ));
        }
        if self.use_beam_search && self.actual_best_of() < 2 {
            return Err(Error::InvalidRequest(
                "beam search requires best_of of at least 2".to_string(),
            ));
        }
        if self.max_tokens == Some(0) {
            return Err(Error::InvalidRequest(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the batch may overlap post-processing with the next
    /// forward pass: a single sample per step and no condition that needs
    /// the previous token inspected before the next is scheduled.
    pub fn allows_async_output_proc(&self) -> bool {
        self.n == 1 && self.actual_best_of() == 1 && !self.use_beam_search && self.stop.is_empty()
    }
}

/// Pooling parameters for embedding requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolingParams {
    /// Requested embedding dimensionality; `None` returns the model's
    /// native width.
    #[serde(default)]
    pub dimensions: Option<usize>,
}

/// The admission-time branch between generation and pooling requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestParams {
    Sampling(SamplingParams),
    Pooling(PoolingParams),
}

impl RequestParams {
    pub fn sampling(&self) -> Option<&SamplingParams> {
        match self {
            RequestParams::Sampling(p) => Some(p),
            RequestParams::Pooling(_) => None,
        }
    }

    pub fn is_pooling(&self) -> bool {
        matches!(self, RequestParams::Pooling(_))
    }
}

impl From<SamplingParams> for RequestParams {
    fn from(params: SamplingParams) -> Self {
        RequestParams::Sampling(params)
    }
}

impl From<PoolingParams> for RequestParams {
    fn from(params: PoolingParams) -> Self {
        RequestParams::Pooling(params)
    }
}

/// Reference to a LoRA adapter the executor has loaded (or can load).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraRequest {
    pub name: String,
    pub id: u32,
}

/// Reference to a prompt adapter; its virtual tokens are prepended to the
/// prompt at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAdapterRequest {
    pub name: String,
    pub id: u32,
    pub num_virtual_tokens: usize,
}

/// A fully described request, ready for `EngineCore::add_request`.
#[derive(Debug, Clone)]
pub struct EngineCoreRequest {
    pub request_id: RequestId,
    pub inputs: PromptInputs,
    pub params: RequestParams,
    /// Caller-supplied arrival time; `None` stamps admission time.
    pub arrival_time: Option<Instant>,
    pub trace_headers: Option<HashMap<String, String>>,
    pub lora: Option<LoraRequest>,
    pub prompt_adapter: Option<PromptAdapterRequest>,
}

impl EngineCoreRequest {
    pub fn new(
        request_id: impl Into<RequestId>,
        inputs: impl Into<PromptInputs>,
        params: impl Into<RequestParams>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            inputs: inputs.into(),
            params: params.into(),
            arrival_time: None,
            trace_headers: None,
            lora: None,
            prompt_adapter: None,
        }
    }

    /// Generation request with a random id.
    pub fn generation(inputs: impl Into<PromptInputs>, params: SamplingParams) -> Self {
        Self::new(Uuid::new_v4().to_string(), inputs, params)
    }

    /// Embedding request with a random id.
    pub fn embedding(inputs: impl Into<PromptInputs>, params: PoolingParams) -> Self {
        Self::new(Uuid::new_v4().to_string(), inputs, params)
    }

    pub fn with_lora(mut self, lora: LoraRequest) -> Self {
        self.lora = Some(lora);
        self
    }

    pub fn with_prompt_adapter(mut self, adapter: PromptAdapterRequest) -> Self {
        self.prompt_adapter = Some(adapter);
        self
    }

    pub fn with_trace_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.trace_headers = Some(headers);
        self
    }
}

fn default_n() -> usize {
    1
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_tokens() -> Option<usize> {
    Some(16)
}

fn default_length_penalty() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_defaults_valid() {
        let params = SamplingParams::default();
        assert!(params.verify().is_ok());
        assert_eq!(params.actual_best_of(), 1);
        assert!(params.allows_async_output_proc());
    }

    #[test]
    fn test_beam_search_requires_width() {
        let params = SamplingParams {
            use_beam_search: true,
            ..Default::default()
        };
        assert!(params.verify().is_err());

        let params = SamplingParams {
            use_beam_search: true,
            best_of: Some(4),
            ..Default::default()
        };
        assert!(params.verify().is_ok());
        assert!(!params.allows_async_output_proc());
    }

    #[test]
    fn test_best_of_below_n_rejected() {
        let params = SamplingParams {
            n: 3,
            best_of: Some(2),
            ..Default::default()
        };
        assert!(params.verify().is_err());
    }

    #[test]
    fn test_stop_strings_disable_async_proc() {
        let params = SamplingParams {
            stop: vec!["\n".to_string()],
            ..Default::default()
        };
        assert!(!params.allows_async_output_proc());
    }

    #[test]
    fn test_generation_request_gets_unique_id() {
        let a = EngineCoreRequest::generation("hello", SamplingParams::default());
        let b = EngineCoreRequest::generation("hello", SamplingParams::default());
        assert_ne!(a.request_id, b.request_id);
    }
}
