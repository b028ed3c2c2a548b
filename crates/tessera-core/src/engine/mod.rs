//! The request engine core.
//!
//! Subsystems, leaves first: the block arena and [`BlockManager`] own the
//! paged KV cache; [`Scheduler`] rebuilds the batch every iteration;
//! [`Sequence`]/[`SequenceGroup`] model in-flight requests;
//! [`OutputProcessor`] turns sampler outputs into sequence updates and
//! user-visible outputs; [`EngineCore`] drives the whole loop.

pub mod block;
pub mod block_manager;
pub mod core;
pub mod executor;
pub mod metrics;
pub mod output;
pub mod output_processor;
pub mod request;
pub mod scheduler;
pub mod sequence;
pub mod stop_checker;
pub mod stream;
pub mod types;

pub use block_manager::{AllocStatus, BlockManager};
pub use self::core::EngineCore;
pub use executor::{
    ExecuteRequest, ModelExecutor, SamplerOutput, SequenceGroupMetadata, SequenceGroupOutput,
    SequenceMetadata, SequenceOutput,
};
pub use metrics::{LoggingStatLogger, StatLogger, Stats};
pub use output::{CompletionOutput, EmbeddingRequestOutput, EngineOutput, RequestOutput};
pub use output_processor::OutputProcessor;
pub use request::{
    EngineCoreRequest, LoraRequest, PoolingParams, PromptAdapterRequest, PromptInputs,
    RequestParams, SamplingParams, SingletonPrompt,
};
pub use scheduler::{ScheduleDecision, ScheduledGroup, Scheduler};
pub use sequence::{
    FinishReason, RequestMetrics, Sequence, SequenceGroup, SequenceStatus, StopReason,
};
pub use stop_checker::StopChecker;
pub use stream::{OutputRouter, OutputStream};
pub use types::{BlockId, Device, Logprobs, RequestId, SeqId, TokenId};
