//! Tessera Core - Continuous-Batching Request Engine for LLM Serving
//!
//! This crate provides the request engine core of an LLM serving system:
//! it accepts generation requests, schedules them against a fixed pool of
//! paged KV-cache blocks, drives iterative token-by-token execution of an
//! opaque model executor, and streams outputs back to callers.
//!
//! # Architecture
//!
//! The engine implements iteration-level scheduling (continuous batching):
//! - Batch membership is rebuilt at every forward pass
//! - Paged KV-cache blocks with copy-on-write sharing and host swap
//! - Preemption by recompute or swap under memory pressure
//! - Async output post-processing and multi-step decode
//! - Pipeline-parallel virtual engines
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::{EngineCore, EngineCoreConfig, EngineCoreRequest, SamplingParams};
//!
//! let config = EngineCoreConfig::default();
//! let mut engine = EngineCore::new(config, executor, Some(tokenizer))?;
//!
//! engine.add_request(EngineCoreRequest::generation("Hello!", SamplingParams::default()))?;
//! while engine.has_unfinished_requests() {
//!     for output in engine.step()? {
//!         // stream output back to the caller
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod tokenizer;

pub use config::{CacheConfig, EngineCoreConfig, ModelConfig, PreemptionMode, SchedulerConfig};
pub use engine::{
    AllocStatus, BlockManager, CompletionOutput, EmbeddingRequestOutput, EngineCore,
    EngineCoreRequest, EngineOutput, ExecuteRequest, FinishReason, LoggingStatLogger, LoraRequest,
    ModelExecutor, OutputProcessor, OutputRouter, OutputStream, PoolingParams,
    PromptAdapterRequest, PromptInputs, RequestOutput, SamplerOutput, SamplingParams,
    ScheduleDecision, Scheduler, Sequence, SequenceGroup, SequenceGroupMetadata, SequenceStatus,
    StatLogger, Stats, StopChecker, StopReason,
};
pub use error::{Error, Result};
pub use tokenizer::{HfTokenizer, TokenizerBackend};
