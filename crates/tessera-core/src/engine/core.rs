//! The engine core: admission, the step loop, and output delivery.
//!
//! One logical driver advances every state machine. Each tick runs
//! schedule → execute → post-process per virtual engine; with async
//! post-processing the outputs of step `k` are drained on the tick that
//! submits step `k+1`, after the sampled tokens of `k` have been
//! pre-appended so the next batch could be built immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::executor::{
    outputs_for_group, ExecuteRequest, ModelExecutor, SamplerOutput, SequenceGroupMetadata,
};
use super::metrics::{LoggingStatLogger, StatLogger, Stats};
use super::output::EngineOutput;
use super::output_processor::OutputProcessor;
use super::request::{EngineCoreRequest, PromptInputs, RequestParams, SingletonPrompt};
use super::scheduler::{ScheduleDecision, Scheduler};
use super::sequence::{Sequence, SequenceGroup, SequenceStatus};
use super::stop_checker::StopChecker;
use super::stream::{OutputRouter, OutputStream};
use super::block_manager::BlockManager;
use super::types::{RequestId, SeqCounter, TokenId};
use crate::config::{EngineCoreConfig, ModelConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::tokenizer::TokenizerBackend;

/// Cached scheduling state for one virtual engine (multi-step windows).
#[derive(Default)]
struct SchedulerOutputState {
    metadata: Option<Arc<Vec<SequenceGroupMetadata>>>,
    decision: Option<ScheduleDecision>,
    remaining_steps: usize,
    last_output: Option<SamplerOutput>,
}

/// One executed step awaiting post-processing.
struct QueuedOutput {
    outputs: Vec<SamplerOutput>,
    metadata: Arc<Vec<SequenceGroupMetadata>>,
    decision: ScheduleDecision,
    is_async: bool,
}

/// The request engine core: accepts generation requests, schedules them
/// against the paged KV cache, drives the model executor, and streams
/// outputs back.
pub struct EngineCore {
    config: EngineCoreConfig,
    tokenizer: Option<Arc<dyn TokenizerBackend>>,
    executor: Box<dyn ModelExecutor>,
    schedulers: Vec<Scheduler>,
    output_processor: OutputProcessor,
    seq_counter: SeqCounter,
    cached: Vec<SchedulerOutputState>,
    output_queues: Vec<VecDeque<QueuedOutput>>,
    router: OutputRouter,
    stat_loggers: Vec<Box<dyn StatLogger>>,
}

impl EngineCore {
    pub fn new(
        config: EngineCoreConfig,
        mut executor: Box<dyn ModelExecutor>,
        tokenizer: Option<Arc<dyn TokenizerBackend>>,
    ) -> Result<Self> {
        let mut config = config;
        config.verify()?;

        // Profile the cache, honor the debug override, then size it.
        let (mut num_gpu_blocks, num_cpu_blocks) = executor.determine_num_available_blocks()?;
        if let Some(num_gpu_override) = config.cache.num_gpu_blocks_override {
            info!(
                profiled = num_gpu_blocks,
                num_gpu_override, "overriding profiled device block count"
            );
            num_gpu_blocks = num_gpu_override;
        }
        config.cache.num_gpu_blocks = Some(num_gpu_blocks);
        config.cache.num_cpu_blocks = Some(num_cpu_blocks);
        executor.initialize_cache(num_gpu_blocks, num_cpu_blocks)?;

        // Each virtual engine schedules against its own block partition.
        let num_virtual_engines = config.scheduler.pipeline_parallel_size;
        let gpu_per_engine = num_gpu_blocks / num_virtual_engines;
        let cpu_per_engine = num_cpu_blocks / num_virtual_engines;
        let schedulers = (0..num_virtual_engines)
            .map(|_| {
                let block_manager = BlockManager::new(
                    config.cache.block_size,
                    gpu_per_engine,
                    cpu_per_engine,
                    config.cache.watermark,
                    config.cache.enable_prefix_caching,
                );
                Scheduler::new(
                    config.scheduler.clone(),
                    config.model.max_model_len,
                    block_manager,
                )
            })
            .collect();

        let output_processor = OutputProcessor::new(
            StopChecker::new(config.model.max_model_len),
            tokenizer.clone(),
        );
        let stat_loggers: Vec<Box<dyn StatLogger>> = if config.log_stats {
            vec![Box::<LoggingStatLogger>::default()]
        } else {
            Vec::new()
        };

        info!(
            max_model_len = config.model.max_model_len,
            block_size = config.cache.block_size,
            num_gpu_blocks,
            num_cpu_blocks,
            max_num_batched_tokens = config.scheduler.max_num_batched_tokens,
            max_num_seqs = config.scheduler.max_num_seqs,
            num_scheduler_steps = config.scheduler.num_scheduler_steps,
            pipeline_parallel_size = num_virtual_engines,
            enable_prefix_caching = config.cache.enable_prefix_caching,
            use_async_output_proc = config.scheduler.use_async_output_proc,
            "initializing engine core"
        );

        Ok(Self {
            tokenizer,
            executor,
            schedulers,
            output_processor,
            seq_counter: SeqCounter::new(),
            cached: (0..num_virtual_engines)
                .map(|_| SchedulerOutputState::default())
                .collect(),
            output_queues: (0..num_virtual_engines).map(|_| VecDeque::new()).collect(),
            router: OutputRouter::new(),
            stat_loggers,
            config,
        })
    }

    pub fn add_stat_logger(&mut self, logger: Box<dyn StatLogger>) {
        self.stat_loggers.push(logger);
    }

    pub fn get_model_config(&self) -> &ModelConfig {
        &self.config.model
    }

    pub fn get_scheduler_config(&self) -> &SchedulerConfig {
        &self.config.scheduler
    }

    pub fn get_config(&self) -> &EngineCoreConfig {
        &self.config
    }

    pub fn num_unfinished_requests(&self) -> usize {
        self.schedulers.iter().map(|s| s.num_unfinished_groups()).sum()
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.schedulers.iter().any(|s| s.has_unfinished_groups())
    }

    pub fn has_unfinished_requests_for_virtual_engine(&self, virtual_engine: usize) -> bool {
        self.schedulers[virtual_engine].has_unfinished_groups()
    }

    /// Open a stream of this request's outputs; valid before or after
    /// `add_request`.
    pub fn subscribe(&mut self, request_id: impl Into<RequestId>) -> OutputStream {
        self.router.subscribe(request_id)
    }

    /// Admit a request. Fails without engine-state changes on validation
    /// errors; admitted requests are picked up by subsequent `step` calls.
    pub fn add_request(&mut self, request: EngineCoreRequest) -> Result<()> {
        if self
            .schedulers
            .iter()
            .any(|s| s.has_request(&request.request_id))
        {
            return Err(Error::DuplicateRequest(request.request_id));
        }
        if request.lora.is_some() && !self.config.model.enable_lora {
            return Err(Error::InvalidRequest(
                "got a LoRA request but LoRA is not enabled".to_string(),
            ));
        }
        if let RequestParams::Sampling(params) = &request.params {
            params.verify()?;
            let max_logprobs = self.config.model.max_logprobs;
            if params.logprobs.unwrap_or(0) > max_logprobs
                || params.prompt_logprobs.unwrap_or(0) > max_logprobs
            {
                return Err(Error::InvalidRequest(format!(
                    "cannot request more than {max_logprobs} logprobs"
                )));
            }
            if !params.stop.is_empty() && self.tokenizer.is_none() {
                return Err(Error::InvalidRequest(
                    "stop strings require a tokenizer".to_string(),
                ));
            }
        }

        let (mut prompt_token_ids, encoder_prompt) = self.process_prompt(&request)?;
        if let Some(adapter) = &request.prompt_adapter {
            let mut padded = vec![0u32; adapter.num_virtual_tokens];
            padded.extend_from_slice(&prompt_token_ids);
            prompt_token_ids = padded;
        }
        let primary = encoder_prompt.as_ref().unwrap_or(&prompt_token_ids);
        if primary.is_empty() {
            return Err(Error::InvalidRequest("prompt cannot be empty".to_string()));
        }
        if prompt_token_ids.len() > self.config.model.max_model_len {
            return Err(Error::InvalidRequest(format!(
                "prompt has {} tokens, over the model limit of {}",
                prompt_token_ids.len(),
                self.config.model.max_model_len
            )));
        }

        let block_size = self.config.cache.block_size;
        let eos_token_id = self
            .config
            .model
            .eos_token_id
            .or_else(|| self.tokenizer.as_ref().and_then(|t| t.eos_token_id()));
        let seq = Sequence::new(
            self.seq_counter.next_id(),
            prompt_token_ids,
            block_size,
            eos_token_id,
        );
        let encoder_seq = encoder_prompt.map(|tokens| {
            Sequence::new(self.seq_counter.next_id(), tokens, block_size, eos_token_id)
        });
        let arrival_time = request.arrival_time.unwrap_or_else(Instant::now);
        let group = SequenceGroup::new(
            request.request_id,
            vec![seq],
            request.params,
            arrival_time,
            request.lora,
            request.prompt_adapter,
            request.trace_headers,
            encoder_seq,
        );

        // Route to the virtual engine with the fewest unfinished groups.
        let virtual_engine = self
            .schedulers
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.num_unfinished_groups())
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.schedulers[virtual_engine].add_group(group);
        Ok(())
    }

    fn process_prompt(
        &self,
        request: &EngineCoreRequest,
    ) -> Result<(Vec<TokenId>, Option<Vec<TokenId>>)> {
        let encode = |prompt: &SingletonPrompt| -> Result<Vec<TokenId>> {
            match prompt {
                SingletonPrompt::Tokens(ids) => Ok(ids.clone()),
                SingletonPrompt::Text(text) => {
                    let tokenizer = self.tokenizer.as_deref().ok_or_else(|| {
                        Error::InvalidRequest("text prompts require a tokenizer".to_string())
                    })?;
                    let tokenizer = request
                        .lora
                        .as_ref()
                        .and_then(|l| tokenizer.adapter(&l.name))
                        .unwrap_or(tokenizer);
                    tokenizer.encode(text)
                }
            }
        };

        match &request.inputs {
            PromptInputs::Singleton(prompt) => {
                if self.config.model.is_encoder_decoder {
                    // A singleton prompt feeds the encoder; the decoder
                    // starts from its start token.
                    let encoder = encode(prompt)?;
                    Ok((vec![self.decoder_start_token()?], Some(encoder)))
                } else {
                    Ok((encode(prompt)?, None))
                }
            }
            PromptInputs::EncoderDecoder { encoder, decoder } => {
                if !self.config.model.is_encoder_decoder {
                    return Err(Error::InvalidRequest(
                        "encoder-decoder prompt passed to a decoder-only model".to_string(),
                    ));
                }
                let encoder_ids = encode(encoder)?;
                let start = self.decoder_start_token()?;
                let mut decoder_ids = match decoder {
                    Some(prompt) => encode(prompt)?,
                    None => Vec::new(),
                };
                if decoder_ids.first() != Some(&start) {
                    decoder_ids.insert(0, start);
                }
                Ok((decoder_ids, Some(encoder_ids)))
            }
        }
    }

    fn decoder_start_token(&self) -> Result<TokenId> {
        self.config
            .model
            .decoder_start_token_id
            .or(self.config.model.eos_token_id)
            .ok_or_else(|| {
                Error::InvalidRequest(
                    "encoder-decoder model without a decoder start token".to_string(),
                )
            })
    }

    /// Abort a request wherever it is. Idempotent; unknown ids are
    /// ignored. Any in-flight forward pass still referencing the request
    /// completes normally and its outputs are discarded.
    pub fn abort_request(&mut self, request_id: &str) {
        for scheduler in &mut self.schedulers {
            if scheduler.abort(request_id) {
                break;
            }
        }
        self.router.close(request_id);
    }

    pub fn abort_requests(&mut self, request_ids: &[RequestId]) {
        for request_id in request_ids {
            self.abort_request(request_id);
        }
    }

    pub fn check_health(&self) -> Result<()> {
        if let Some(tokenizer) = &self.tokenizer {
            tokenizer
                .ping()
                .map_err(|e| Error::Health(format!("tokenizer: {e}")))?;
        }
        self.executor
            .check_health()
            .map_err(|e| Error::Health(format!("executor: {e}")))
    }

    /// Run one iteration over every virtual engine and return the outputs
    /// produced since the previous tick.
    pub fn step(&mut self) -> Result<Vec<EngineOutput>> {
        let mut produced = Vec::new();
        for virtual_engine in 0..self.schedulers.len() {
            produced.extend(self.step_virtual(virtual_engine)?);
        }
        if !self.has_unfinished_requests() {
            for virtual_engine in 0..self.schedulers.len() {
                produced.extend(self.drain_queue(virtual_engine));
            }
            self.executor.stop_remote_worker_execution_loop();
        }
        Ok(produced)
    }

    fn step_virtual(&mut self, virtual_engine: usize) -> Result<Vec<EngineOutput>> {
        let mut produced = Vec::new();
        let multi_step = self.config.scheduler.is_multi_step();

        // Reuse the cached decision while a multi-step window is open.
        let window_open = self.cached[virtual_engine].remaining_steps > 0
            && self.cached[virtual_engine].metadata.is_some();
        let (metadata, decision, allow_async) = if window_open {
            let cached = &self.cached[virtual_engine];
            (
                cached.metadata.clone().expect("window has metadata"),
                cached.decision.clone().expect("window has decision"),
                false,
            )
        } else {
            let (metadata, mut decision) = self.schedulers[virtual_engine].schedule();
            let ignored = std::mem::take(&mut decision.ignored_groups);
            for group in &ignored {
                let output = EngineOutput::from_group(group);
                self.router.route(&output);
                produced.push(output);
            }
            let allow_async = decision.allow_async_output_proc;
            if !allow_async {
                // Pending async entries must land before this tick's
                // synchronous processing to keep per-request ordering.
                produced.extend(self.drain_queue(virtual_engine));
            }
            if multi_step && !decision.is_empty() {
                let cached = &mut self.cached[virtual_engine];
                cached.metadata = Some(metadata.clone());
                cached.decision = Some(decision.clone());
                cached.remaining_steps = self.config.scheduler.num_scheduler_steps;
                cached.last_output = None;
            }
            (metadata, decision, allow_async)
        };

        let mut sampler_outputs = Vec::new();
        if !decision.is_empty() {
            let finished_request_ids =
                self.schedulers[virtual_engine].get_and_reset_finished_request_ids();
            // Block moves were already performed on the window's first
            // sub-step.
            let (swap_in, swap_out, copies) = if window_open {
                (Vec::new(), Vec::new(), Vec::new())
            } else {
                (
                    decision.blocks_to_swap_in.clone(),
                    decision.blocks_to_swap_out.clone(),
                    decision.blocks_to_copy.clone(),
                )
            };
            let execute_request = ExecuteRequest {
                seq_group_metadata: metadata.clone(),
                blocks_to_swap_in: swap_in,
                blocks_to_swap_out: swap_out,
                blocks_to_copy: copies,
                num_lookahead_slots: decision.num_lookahead_slots,
                running_queue_size: decision.running_queue_size,
                finished_request_ids,
                last_sampled_token_ids: self.last_sampled_token_ids(virtual_engine),
                virtual_engine,
                num_steps: self.config.scheduler.num_scheduler_steps,
                remaining_steps: if multi_step {
                    self.cached[virtual_engine].remaining_steps
                } else {
                    1
                },
            };
            // An executor failure propagates without touching sequence
            // state: nothing has been appended or freed for this step.
            sampler_outputs = self.executor.execute(&execute_request)?;
            if multi_step {
                if let Some(last) = sampler_outputs.last() {
                    self.cached[virtual_engine].last_output = Some(last.clone());
                }
            }
        } else {
            produced.extend(self.drain_queue(virtual_engine));
        }

        // Multi-step window accounting.
        let mut window_done = true;
        if multi_step && self.cached[virtual_engine].metadata.is_some() {
            let cached = &mut self.cached[virtual_engine];
            cached.remaining_steps = cached.remaining_steps.saturating_sub(1);
            window_done = cached.remaining_steps == 0;
            for meta in metadata.iter() {
                if let Some(group) = self.schedulers[virtual_engine].group_mut(&meta.request_id) {
                    group.finish_step();
                }
            }
            if window_done {
                let cached = &mut self.cached[virtual_engine];
                cached.metadata = None;
                cached.decision = None;
            }
        }

        if window_done && !decision.is_empty() {
            if allow_async {
                // Deliver the previous step's outputs, pre-append this
                // step's tokens so the next batch can be built, and leave
                // this step's outputs for the next tick.
                produced.extend(self.drain_queue(virtual_engine));
                self.advance_to_next_step(virtual_engine, &sampler_outputs, &metadata);
                self.output_queues[virtual_engine].push_back(QueuedOutput {
                    outputs: sampler_outputs,
                    metadata,
                    decision,
                    is_async: true,
                });
            } else {
                self.output_queues[virtual_engine].push_back(QueuedOutput {
                    outputs: sampler_outputs,
                    metadata,
                    decision,
                    is_async: false,
                });
                produced.extend(self.drain_queue(virtual_engine));
            }
        }
        Ok(produced)
    }

    fn last_sampled_token_ids(&self, virtual_engine: usize) -> Option<Vec<TokenId>> {
        if !self.config.scheduler.is_multi_step() || self.config.scheduler.pipeline_parallel_size <= 1
        {
            return None;
        }
        self.cached[virtual_engine]
            .last_output
            .as_ref()
            .and_then(|o| o.sampled_token_ids.clone())
    }

    /// Eagerly append the single sampled token per sequence so the next
    /// forward pass can be scheduled before post-processing runs. Mutates
    /// only token arrays and computed-token counters; the async
    /// post-processing path touches the disjoint status fields.
    fn advance_to_next_step(
        &mut self,
        virtual_engine: usize,
        outputs: &[SamplerOutput],
        metadata: &Arc<Vec<SequenceGroupMetadata>>,
    ) {
        let Some(output) = outputs.first() else {
            return;
        };
        for (idx, meta) in metadata.iter().enumerate() {
            let Some(group) = self.schedulers[virtual_engine].group_mut(&meta.request_id) else {
                continue;
            };
            if group.is_finished() {
                continue;
            }
            for seq in group.seqs_mut(Some(SequenceStatus::Running)) {
                let num_new = if meta.is_prompt {
                    meta.token_chunk_size.min(seq.num_uncomputed_tokens())
                } else {
                    seq.num_uncomputed_tokens()
                };
                seq.update_num_computed_tokens(num_new);
            }
            if !meta.do_sample {
                continue;
            }
            let Some(group_output) = output.outputs.get(idx) else {
                continue;
            };
            debug_assert!(
                group_output.samples.len() <= 1,
                "async output processing expects a single sample"
            );
            if let Some(sample) = group_output.samples.first() {
                if let Some(seq) = group.seq_mut_by_id(sample.parent_seq_id) {
                    seq.append_token(sample.output_token, sample.logprobs.clone());
                }
            }
        }
    }

    fn drain_queue(&mut self, virtual_engine: usize) -> Vec<EngineOutput> {
        let mut produced = Vec::new();
        while let Some(entry) = self.output_queues[virtual_engine].pop_front() {
            produced.extend(self.process_entry(virtual_engine, entry));
        }
        produced
    }

    /// Apply one executed step to its groups: computed-token accounting,
    /// token appends (unless pre-appended), stop checks, fork/free
    /// application, output assembly, stats, and traces.
    fn process_entry(&mut self, virtual_engine: usize, entry: QueuedOutput) -> Vec<EngineOutput> {
        let now = Instant::now();
        let QueuedOutput {
            outputs,
            metadata,
            decision,
            is_async,
        } = entry;
        let mut produced = Vec::new();
        let mut finished_ids: Vec<RequestId> = Vec::new();
        let mut ttft_samples = Vec::new();
        let mut tpot_samples = Vec::new();
        let mut e2e_samples = Vec::new();

        for (idx, meta) in metadata.iter().enumerate() {
            let Some(group) = self.schedulers[virtual_engine].group_mut(&meta.request_id) else {
                // Aborted while in flight; outputs discarded.
                continue;
            };
            if group.is_finished() {
                // Already finalized by an earlier drain of this window.
                continue;
            }

            let group_outputs = outputs_for_group(&outputs, idx);

            if !is_async {
                for seq in group.seqs_mut(Some(SequenceStatus::Running)) {
                    let num_new = if meta.is_prompt {
                        meta.token_chunk_size.min(seq.num_uncomputed_tokens())
                    } else {
                        seq.num_uncomputed_tokens()
                    };
                    seq.update_num_computed_tokens(num_new);
                }
            }

            let was_prefill = meta.is_prompt;
            if group.params.is_pooling() {
                if let Some(first) = group_outputs.first() {
                    group.embeddings = first.embeddings.clone();
                }
                for seq in group.seqs_mut(None) {
                    seq.set_status(SequenceStatus::FinishedStopped);
                }
            } else {
                if let Some(first) = group_outputs.first() {
                    self.output_processor.process_prompt_logprobs(group, first);
                }
                if meta.do_sample && !group_outputs.is_empty() {
                    let ops = self.output_processor.process_outputs(
                        group,
                        &group_outputs,
                        is_async,
                        &mut self.seq_counter,
                    );
                    for (parent, child) in ops.forks {
                        self.schedulers[virtual_engine].fork_seq(parent, child);
                    }
                    for seq_id in ops.frees {
                        self.schedulers[virtual_engine].free_seq(seq_id);
                    }
                }
            }

            let group = self.schedulers[virtual_engine]
                .group_mut(&meta.request_id)
                .expect("group still present after processing");
            group.maybe_set_first_token_time(now);
            let latency = group.last_latency(now);
            if was_prefill && !group.is_prefill() {
                ttft_samples.push(latency);
            } else if !was_prefill {
                tpot_samples.push(latency);
            }

            let finished = group.is_finished();
            if finished {
                group.set_finished_time(now);
                e2e_samples.push(now - group.metrics.arrival_time);
                let ttft_ms = group
                    .metrics
                    .first_token_time
                    .map(|t| (t - group.metrics.arrival_time).as_millis());
                debug!(
                    request_id = %group.request_id,
                    num_output_tokens = group.first_seq().output_len(),
                    ttft_ms,
                    e2e_ms = (now - group.metrics.arrival_time).as_millis(),
                    "request finished"
                );
                trace_finished_request(group, now);
                finished_ids.push(meta.request_id.clone());
            }
            if finished || !self.config.step_return_finished_only {
                produced.push(EngineOutput::from_group(group));
            }
        }

        self.schedulers[virtual_engine].free_finished(&finished_ids);

        for output in &produced {
            self.router.route(output);
        }

        if !self.stat_loggers.is_empty() {
            let stats = self.build_stats(
                &decision,
                ttft_samples,
                tpot_samples,
                e2e_samples,
                finished_ids.len(),
            );
            for logger in &mut self.stat_loggers {
                logger.log(&stats);
            }
        }
        produced
    }

    fn build_stats(
        &self,
        decision: &ScheduleDecision,
        ttft: Vec<std::time::Duration>,
        tpot: Vec<std::time::Duration>,
        e2e: Vec<std::time::Duration>,
        num_finished: usize,
    ) -> Stats {
        let total_gpu: usize = self
            .schedulers
            .iter()
            .map(|s| s.block_manager().num_total_device_blocks())
            .sum();
        let free_gpu: usize = self
            .schedulers
            .iter()
            .map(|s| s.block_manager().num_free_device_blocks())
            .sum();
        let total_cpu: usize = self
            .schedulers
            .iter()
            .map(|s| s.block_manager().num_total_host_blocks())
            .sum();
        let free_cpu: usize = self
            .schedulers
            .iter()
            .map(|s| s.block_manager().num_free_host_blocks())
            .sum();
        let usage = |total: usize, free: usize| {
            if total == 0 {
                0.0
            } else {
                1.0 - free as f32 / total as f32
            }
        };

        let num_prompt_tokens: usize = decision
            .scheduled
            .iter()
            .take(decision.num_prefill_groups)
            .map(|sg| sg.token_chunk_size)
            .sum();

        Stats {
            num_running: self.schedulers.iter().map(|s| s.num_running()).sum(),
            num_swapped: self.schedulers.iter().map(|s| s.num_swapped()).sum(),
            num_waiting: self.schedulers.iter().map(|s| s.num_waiting()).sum(),
            gpu_cache_usage: usage(total_gpu, free_gpu),
            cpu_cache_usage: usage(total_cpu, free_cpu),
            gpu_prefix_cache_hit_rate: self.schedulers[0].block_manager().prefix_hit_rate(),
            num_prompt_tokens_iter: num_prompt_tokens,
            num_generation_tokens_iter: decision.num_batched_tokens.saturating_sub(num_prompt_tokens),
            num_preempted_iter: decision.preempted,
            time_to_first_tokens_iter: ttft,
            time_per_output_tokens_iter: tpot,
            time_e2e_requests: e2e,
            num_finished_requests: num_finished,
        }
    }

    // Adapter management passes straight through to the executor.

    pub fn add_lora(&mut self, lora: &super::request::LoraRequest) -> Result<bool> {
        if !self.config.model.enable_lora {
            return Err(Error::InvalidRequest("LoRA is not enabled".to_string()));
        }
        self.executor.add_lora(lora)
    }

    pub fn remove_lora(&mut self, lora_id: u32) -> Result<bool> {
        self.executor.remove_lora(lora_id)
    }

    pub fn list_loras(&self) -> Result<Vec<u32>> {
        self.executor.list_loras()
    }

    pub fn pin_lora(&mut self, lora_id: u32) -> Result<bool> {
        self.executor.pin_lora(lora_id)
    }

    pub fn add_prompt_adapter(
        &mut self,
        adapter: &super::request::PromptAdapterRequest,
    ) -> Result<bool> {
        self.executor.add_prompt_adapter(adapter)
    }

    pub fn remove_prompt_adapter(&mut self, adapter_id: u32) -> Result<bool> {
        self.executor.remove_prompt_adapter(adapter_id)
    }

    pub fn list_prompt_adapters(&self) -> Result<Vec<u32>> {
        self.executor.list_prompt_adapters()
    }
}

/// Per-request trace emission for a finished group. Only requests that
/// arrived with trace headers are traced; the span carries the request id,
/// sampling attributes, token counts, and the latency breakdown, so an
/// attached subscriber sees one span per traced request.
fn trace_finished_request(group: &SequenceGroup, now: Instant) {
    if group.trace_headers.is_none() {
        return;
    }
    let Some(params) = group.sampling_params() else {
        return;
    };
    let metrics = &group.metrics;
    let ttft_ms = metrics
        .first_token_time
        .map(|t| (t - metrics.arrival_time).as_millis() as u64);
    let time_in_queue_ms = metrics.time_in_queue.map(|d| d.as_millis() as u64);
    let num_output_tokens: u64 = group.seqs.iter().map(|s| s.output_len() as u64).sum();

    let span = tracing::info_span!(
        "llm_request",
        request_id = %group.request_id,
        temperature = params.temperature as f64,
        top_p = params.top_p as f64,
        max_tokens = ?params.max_tokens,
        n = params.n as u64,
        best_of = params.actual_best_of() as u64,
        num_seqs = group.num_seqs(None) as u64,
        num_prompt_tokens = group.prompt_token_ids().len() as u64,
        num_output_tokens,
        time_in_queue_ms,
        ttft_ms,
        e2e_ms = (now - metrics.arrival_time).as_millis() as u64,
    );
    span.in_scope(|| {
        info!("request trace");
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::engine::executor::{SequenceGroupOutput, SequenceOutput};
    use crate::engine::request::{PoolingParams, SamplingParams};
    use crate::engine::types::{Logprobs, SeqId};

    const EOS: TokenId = 2;

    /// Deterministic executor: samples sequential token ids per sequence
    /// and EOS after `eos_after` samples when set. Multi-step windows
    /// buffer their outputs until the final sub-step.
    struct MockExecutor {
        gpu_blocks: usize,
        cpu_blocks: usize,
        eos_after: Option<usize>,
        next_token: HashMap<SeqId, TokenId>,
        samples_emitted: HashMap<SeqId, usize>,
        window_outputs: Vec<SamplerOutput>,
        num_execute_calls: usize,
        fail_next: bool,
    }

    impl MockExecutor {
        fn new(gpu_blocks: usize, cpu_blocks: usize) -> Self {
            Self {
                gpu_blocks,
                cpu_blocks,
                eos_after: None,
                next_token: HashMap::new(),
                samples_emitted: HashMap::new(),
                window_outputs: Vec::new(),
                num_execute_calls: 0,
                fail_next: false,
            }
        }

        fn with_eos_after(mut self, n: usize) -> Self {
            self.eos_after = Some(n);
            self
        }

        fn sample_step(&mut self, request: &ExecuteRequest) -> SamplerOutput {
            let mut outputs = Vec::new();
            let mut sampled = Vec::new();
            for meta in request.seq_group_metadata.iter() {
                let mut group_output = SequenceGroupOutput::default();
                if meta.sampling_params.is_none() {
                    group_output.embeddings = Some(vec![0.5, -0.5]);
                } else if meta.do_sample {
                    for seq in &meta.seqs {
                        let emitted = self.samples_emitted.entry(seq.seq_id).or_insert(0);
                        *emitted += 1;
                        let token = if self.eos_after.map(|n| *emitted >= n).unwrap_or(false) {
                            EOS
                        } else {
                            let t = self.next_token.entry(seq.seq_id).or_insert(1000);
                            let token = *t;
                            *t += 1;
                            token
                        };
                        let mut logprobs = Logprobs::new();
                        logprobs.insert(token, -0.1);
                        group_output.samples.push(SequenceOutput {
                            parent_seq_id: seq.seq_id,
                            output_token: token,
                            logprobs,
                        });
                        sampled.push(token);
                    }
                }
                outputs.push(group_output);
            }
            SamplerOutput {
                outputs,
                sampled_token_ids: Some(sampled),
            }
        }
    }

    impl ModelExecutor for MockExecutor {
        fn determine_num_available_blocks(&mut self) -> crate::error::Result<(usize, usize)> {
            Ok((self.gpu_blocks, self.cpu_blocks))
        }

        fn initialize_cache(&mut self, _gpu: usize, _cpu: usize) -> crate::error::Result<()> {
            Ok(())
        }

        fn execute(
            &mut self,
            request: &ExecuteRequest,
        ) -> crate::error::Result<Vec<SamplerOutput>> {
            if self.fail_next {
                self.fail_next = false;
                return Err(Error::Executor("injected failure".to_string()));
            }
            self.num_execute_calls += 1;
            let step = self.sample_step(request);
            if request.num_steps <= 1 {
                return Ok(vec![step]);
            }
            self.window_outputs.push(step);
            if request.remaining_steps == 1 {
                return Ok(std::mem::take(&mut self.window_outputs));
            }
            Ok(Vec::new())
        }

        fn check_health(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn engine_with(scheduler: SchedulerConfig, executor: MockExecutor) -> EngineCore {
        let config = EngineCoreConfig {
            model: crate::config::ModelConfig {
                eos_token_id: Some(EOS),
                ..Default::default()
            },
            scheduler,
            log_stats: false,
            ..Default::default()
        };
        EngineCore::new(config, Box::new(executor), None).unwrap()
    }

    fn generation_request(id: &str, prompt_len: usize, max_tokens: usize) -> EngineCoreRequest {
        let prompt: Vec<TokenId> = (0..prompt_len as TokenId).collect();
        EngineCoreRequest::new(
            id,
            prompt,
            SamplingParams {
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
        )
    }

    fn run_to_completion(engine: &mut EngineCore, max_ticks: usize) -> Vec<EngineOutput> {
        let mut all = Vec::new();
        for _ in 0..max_ticks {
            all.extend(engine.step().unwrap());
            if !engine.has_unfinished_requests() {
                break;
            }
        }
        all
    }

    #[test]
    fn test_generation_runs_to_max_tokens() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        engine.add_request(generation_request("r1", 8, 4)).unwrap();

        let outputs = run_to_completion(&mut engine, 20);
        assert!(!engine.has_unfinished_requests());
        let last = outputs.last().unwrap();
        assert!(last.is_finished());
        let EngineOutput::Completion(out) = last else {
            panic!("expected completion");
        };
        assert_eq!(out.outputs[0].token_ids.len(), 4);
        assert_eq!(
            out.outputs[0].finish_reason,
            Some(crate::engine::sequence::FinishReason::Length)
        );
        // All blocks reclaimed on completion.
        let bm = engine.schedulers[0].block_manager();
        assert_eq!(bm.num_free_device_blocks(), bm.num_total_device_blocks());
    }

    #[test]
    fn test_eos_finishes_early() {
        let executor = MockExecutor::new(64, 0).with_eos_after(2);
        let mut engine = engine_with(SchedulerConfig::default(), executor);
        engine.add_request(generation_request("r1", 4, 16)).unwrap();

        let outputs = run_to_completion(&mut engine, 20);
        let EngineOutput::Completion(out) = outputs.last().unwrap() else {
            panic!("expected completion");
        };
        assert!(out.finished);
        assert_eq!(out.outputs[0].token_ids.len(), 2);
        assert_eq!(*out.outputs[0].token_ids.last().unwrap(), EOS);
        assert_eq!(
            out.outputs[0].finish_reason,
            Some(crate::engine::sequence::FinishReason::Stop)
        );
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        engine.add_request(generation_request("dup", 4, 4)).unwrap();
        let err = engine
            .add_request(generation_request("dup", 4, 4))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRequest(_)));
    }

    #[test]
    fn test_validation_errors() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));

        // Empty prompt.
        let err = engine
            .add_request(generation_request("empty", 0, 4))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Prompt over the model cap.
        let err = engine
            .add_request(generation_request("long", 5000, 4))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Text prompt without a tokenizer.
        let err = engine
            .add_request(EngineCoreRequest::new(
                "text",
                "hello",
                SamplingParams::default(),
            ))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // LoRA without LoRA support.
        let err = engine
            .add_request(
                generation_request("lora", 4, 4).with_lora(super::super::request::LoraRequest {
                    name: "adapter".to_string(),
                    id: 1,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // None of the failures were admitted.
        assert_eq!(engine.num_unfinished_requests(), 0);
    }

    #[test]
    fn test_abort_in_flight() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        engine.add_request(generation_request("r", 8, 64)).unwrap();
        engine.add_request(generation_request("keep", 8, 64)).unwrap();

        for _ in 0..3 {
            engine.step().unwrap();
        }
        engine.abort_request("r");
        engine.abort_request("r"); // idempotent
        assert_eq!(engine.num_unfinished_requests(), 1);

        let outputs = engine.step().unwrap();
        assert!(outputs.iter().all(|o| o.request_id() != "r"));

        // Aborted blocks were reclaimed: only "keep" holds blocks.
        let bm = engine.schedulers[0].block_manager();
        let used = bm.num_total_device_blocks() - bm.num_free_device_blocks();
        assert!(used <= 4);
    }

    #[test]
    fn test_executor_failure_propagates_without_append() {
        let mut executor = MockExecutor::new(64, 0);
        executor.fail_next = true;
        let mut engine = engine_with(SchedulerConfig::default(), executor);
        engine.add_request(generation_request("r", 8, 4)).unwrap();

        let err = engine.step().unwrap_err();
        assert!(matches!(err, Error::Executor(_)));
        // No tokens were appended for the failed step.
        let group = engine.schedulers[0].group("r").unwrap();
        assert_eq!(group.first_seq().output_len(), 0);

        // The next step succeeds and the request completes normally.
        let outputs = run_to_completion(&mut engine, 20);
        assert!(outputs.last().unwrap().is_finished());
    }

    #[test]
    fn test_async_output_proc_preserves_order_and_counts() {
        let scheduler = SchedulerConfig {
            use_async_output_proc: true,
            ..Default::default()
        };
        let mut engine = engine_with(scheduler, MockExecutor::new(64, 0));
        engine.add_request(generation_request("a", 4, 5)).unwrap();
        engine.add_request(generation_request("b", 4, 5)).unwrap();

        let mut per_request: HashMap<String, Vec<usize>> = HashMap::new();
        for _ in 0..30 {
            for output in engine.step().unwrap() {
                if let EngineOutput::Completion(out) = &output {
                    per_request
                        .entry(out.request_id.clone())
                        .or_default()
                        .push(out.outputs[0].token_ids.len());
                }
            }
            if !engine.has_unfinished_requests() {
                break;
            }
        }

        for id in ["a", "b"] {
            let counts = &per_request[id];
            // Token counts only grow: per-request ordering is preserved.
            assert!(counts.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(*counts.last().unwrap(), 5);
        }
    }

    #[test]
    fn test_step_return_finished_only() {
        let scheduler = SchedulerConfig::default();
        let config = EngineCoreConfig {
            scheduler,
            log_stats: false,
            step_return_finished_only: true,
            ..Default::default()
        };
        let mut engine =
            EngineCore::new(config, Box::new(MockExecutor::new(64, 0)), None).unwrap();
        engine.add_request(generation_request("r", 4, 3)).unwrap();

        let outputs = run_to_completion(&mut engine, 20);
        // Only the terminal output came back.
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_finished());
    }

    #[test]
    fn test_multi_step_schedules_once_per_window() {
        let scheduler = SchedulerConfig {
            num_scheduler_steps: 4,
            ..Default::default()
        };
        let mut engine = engine_with(scheduler, MockExecutor::new(64, 0));
        engine.add_request(generation_request("r", 4, 8)).unwrap();

        // Window 1: prefill + 3 decode sub-steps; outputs land at its end.
        let mut outputs = Vec::new();
        for _ in 0..4 {
            outputs.extend(engine.step().unwrap());
        }
        let EngineOutput::Completion(out) = outputs.last().unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(out.outputs[0].token_ids.len(), 4);

        let outputs = run_to_completion(&mut engine, 8);
        let EngineOutput::Completion(out) = outputs.last().unwrap() else {
            panic!("expected completion");
        };
        assert!(out.finished);
        assert_eq!(out.outputs[0].token_ids.len(), 8);
    }

    #[test]
    fn test_pooling_request_finishes_after_prefill() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        let prompt: Vec<TokenId> = (0..6).collect();
        engine
            .add_request(EngineCoreRequest::new(
                "embed",
                prompt,
                PoolingParams::default(),
            ))
            .unwrap();

        let outputs = run_to_completion(&mut engine, 5);
        let EngineOutput::Embedding(out) = outputs.last().unwrap() else {
            panic!("expected embedding output");
        };
        assert!(out.finished);
        assert_eq!(out.embeddings, vec![0.5, -0.5]);
        assert!(!engine.has_unfinished_requests());
    }

    #[test]
    fn test_pipeline_parallel_routes_to_least_loaded() {
        let scheduler = SchedulerConfig {
            pipeline_parallel_size: 2,
            ..Default::default()
        };
        let mut engine = engine_with(scheduler, MockExecutor::new(64, 0));
        engine.add_request(generation_request("a", 4, 3)).unwrap();
        engine.add_request(generation_request("b", 4, 3)).unwrap();

        assert_eq!(engine.schedulers[0].num_unfinished_groups(), 1);
        assert_eq!(engine.schedulers[1].num_unfinished_groups(), 1);

        let outputs = run_to_completion(&mut engine, 20);
        let finished: Vec<_> = outputs.iter().filter(|o| o.is_finished()).collect();
        assert_eq!(finished.len(), 2);
    }

    #[test]
    fn test_never_fitting_request_surfaced_once_as_ignored() {
        // 8 blocks of 16 tokens: a 200-token prompt can never fit.
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(8, 0));
        engine.add_request(generation_request("big", 200, 4)).unwrap();

        let outputs = engine.step().unwrap();
        assert_eq!(outputs.len(), 1);
        let EngineOutput::Completion(out) = &outputs[0] else {
            panic!("expected completion");
        };
        assert!(out.finished);
        assert_eq!(
            out.outputs[0].finish_reason,
            Some(crate::engine::sequence::FinishReason::Ignore)
        );

        let outputs = engine.step().unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_check_health() {
        let engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        assert!(engine.check_health().is_ok());
    }

    #[test]
    fn test_traced_request_runs_to_completion() {
        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        engine
            .add_request(generation_request("traced", 4, 3).with_trace_headers(headers))
            .unwrap();

        // The finish path emits the request span for traced requests; the
        // request itself completes like any other.
        let outputs = run_to_completion(&mut engine, 20);
        let last = outputs.last().unwrap();
        assert_eq!(last.request_id(), "traced");
        assert!(last.is_finished());
    }

    #[tokio::test]
    async fn test_subscription_streams_outputs() {
        use futures::StreamExt;

        let mut engine = engine_with(SchedulerConfig::default(), MockExecutor::new(64, 0));
        let mut stream = engine.subscribe("r");
        engine.add_request(generation_request("r", 4, 3)).unwrap();
        run_to_completion(&mut engine, 20);

        let mut seen = 0;
        while let Some(output) = stream.next().await {
            seen += 1;
            if output.is_finished() {
                break;
            }
        }
        assert!(seen >= 1);
    }
}
