//! Iteration-level scheduler.
//!
//! Holds the three request queues (`waiting`, `running`, `swapped`) and
//! produces one [`ScheduleDecision`] per tick: which groups run in the next
//! forward pass and which block movements must happen first. Queues store
//! request ids; the groups themselves live in an id-indexed table so abort
//! and preemption never scan a queue.
//!
//! Priorities per tick, highest first: advance running groups, resume
//! swapped groups (only on ticks with no preemption), admit waiting
//! prompts under the token and group budgets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::block_manager::{AllocStatus, BlockManager};
use super::executor::{SequenceGroupMetadata, SequenceMetadata};
use super::sequence::{SequenceGroup, SequenceStatus};
use super::types::{BlockId, RequestId, SeqId};
use crate::config::{PreemptionMode, SchedulerConfig};

/// One group picked for the next forward pass.
#[derive(Debug, Clone)]
pub struct ScheduledGroup {
    pub request_id: RequestId,
    /// Prompt tokens fed this step for prefill groups; 1 for decode.
    pub token_chunk_size: usize,
}

/// Everything the engine needs to run one iteration.
#[derive(Debug, Clone, Default)]
pub struct ScheduleDecision {
    /// Scheduled groups; prefills form the leading prefix.
    pub scheduled: Vec<ScheduledGroup>,
    pub num_prefill_groups: usize,
    pub num_batched_tokens: usize,
    pub blocks_to_swap_in: Vec<(BlockId, BlockId)>,
    pub blocks_to_swap_out: Vec<(BlockId, BlockId)>,
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    /// Groups rejected this tick (prompt can never fit); already finished.
    pub ignored_groups: Vec<SequenceGroup>,
    pub num_lookahead_slots: usize,
    pub running_queue_size: usize,
    /// Preemptions performed this tick, for metrics.
    pub preempted: usize,
    pub allow_async_output_proc: bool,
}

impl ScheduleDecision {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

/// Running tally against the per-batch ceilings.
struct TokenBudget {
    token_limit: usize,
    group_limit: usize,
    num_batched_tokens: usize,
    num_groups: usize,
}

impl TokenBudget {
    fn new(token_limit: usize, group_limit: usize) -> Self {
        Self {
            token_limit,
            group_limit,
            num_batched_tokens: 0,
            num_groups: 0,
        }
    }

    fn can_schedule(&self, tokens: usize, groups: usize) -> bool {
        self.num_batched_tokens + tokens <= self.token_limit
            && self.num_groups + groups <= self.group_limit
    }

    fn remaining_tokens(&self) -> usize {
        self.token_limit - self.num_batched_tokens.min(self.token_limit)
    }

    fn add(&mut self, tokens: usize, groups: usize) {
        self.num_batched_tokens += tokens;
        self.num_groups += groups;
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    max_model_len: usize,
    block_manager: BlockManager,
    /// Every live group, keyed by request id.
    groups: HashMap<RequestId, SequenceGroup>,
    /// Arrival order.
    waiting: VecDeque<RequestId>,
    /// Admission order.
    running: VecDeque<RequestId>,
    /// Preempted groups resume before older ones.
    swapped: VecDeque<RequestId>,
    /// Ids finished since the last drain, reported to the executor.
    finished_request_ids: Vec<RequestId>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, max_model_len: usize, block_manager: BlockManager) -> Self {
        Self {
            config,
            max_model_len,
            block_manager,
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            swapped: VecDeque::new(),
            finished_request_ids: Vec::new(),
        }
    }

    pub fn add_group(&mut self, group: SequenceGroup) {
        debug!(request_id = %group.request_id, "request queued");
        self.waiting.push_back(group.request_id.clone());
        self.groups.insert(group.request_id.clone(), group);
    }

    pub fn has_request(&self, request_id: &str) -> bool {
        self.groups.contains_key(request_id)
    }

    pub fn group(&self, request_id: &str) -> Option<&SequenceGroup> {
        self.groups.get(request_id)
    }

    pub fn group_mut(&mut self, request_id: &str) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(request_id)
    }

    /// Finished groups are removed as soon as they are drained, so the
    /// table size is the number of unfinished groups.
    pub fn num_unfinished_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn has_unfinished_groups(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_swapped(&self) -> usize {
        self.swapped.len()
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Abort a request wherever it currently is. Idempotent; stale queue
    /// entries are dropped lazily by the next `schedule` call.
    pub fn abort(&mut self, request_id: &str) -> bool {
        let Some(mut group) = self.groups.remove(request_id) else {
            return false;
        };
        let seq_ids: Vec<SeqId> = group.seqs.iter().map(|s| s.seq_id).collect();
        for seq in group.seqs_mut(None) {
            seq.set_status(SequenceStatus::FinishedAborted);
        }
        for seq_id in seq_ids {
            self.block_manager.free(seq_id);
        }
        self.finished_request_ids.push(request_id.to_string());
        debug!(request_id, "request aborted");
        true
    }

    /// Share the parent's block table with a forked child sequence.
    pub fn fork_seq(&mut self, parent: SeqId, child: SeqId) {
        self.block_manager.fork(parent, child);
    }

    /// Release the blocks of a single sequence (an evicted beam).
    pub fn free_seq(&mut self, seq_id: SeqId) {
        self.block_manager.free(seq_id);
    }

    /// Drop finished groups and reclaim their blocks.
    pub fn free_finished(&mut self, request_ids: &[RequestId]) {
        for request_id in request_ids {
            let finished = self
                .groups
                .get(request_id)
                .map(|g| g.is_finished())
                .unwrap_or(false);
            if !finished {
                continue;
            }
            if let Some(group) = self.groups.remove(request_id) {
                for seq in &group.seqs {
                    self.block_manager.free(seq.seq_id);
                }
                self.finished_request_ids.push(request_id.clone());
            }
        }
    }

    pub fn get_and_reset_finished_request_ids(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.finished_request_ids)
    }

    /// Produce the batch for the next forward pass.
    pub fn schedule(&mut self) -> (Arc<Vec<SequenceGroupMetadata>>, ScheduleDecision) {
        let now = Instant::now();
        let lookahead = self.config.num_lookahead_slots();
        let mut budget = TokenBudget::new(
            self.config.max_num_batched_tokens,
            self.config.max_num_seqs,
        );
        let mut decision = ScheduleDecision {
            num_lookahead_slots: lookahead,
            ..Default::default()
        };
        let mut prefills: Vec<ScheduledGroup> = Vec::new();
        let mut decodes: Vec<ScheduledGroup> = Vec::new();

        self.schedule_running(&mut budget, &mut prefills, &mut decodes, &mut decision);
        if decision.preempted == 0 {
            self.schedule_swapped(&mut budget, &mut decodes, &mut decision, lookahead);
        }
        self.schedule_waiting(&mut budget, &mut prefills, &mut decision, now);

        decision.num_prefill_groups = prefills.len();
        decision.scheduled = prefills;
        decision.scheduled.extend(decodes);
        decision.num_batched_tokens = budget.num_batched_tokens;
        decision.running_queue_size = self.running.len();
        decision.allow_async_output_proc = self.compute_allow_async(&decision.scheduled);

        if self.config.is_multi_step() {
            for sg in &decision.scheduled {
                if let Some(group) = self.groups.get_mut(&sg.request_id) {
                    group.init_multi_step(self.config.num_scheduler_steps);
                }
            }
        }

        let metadata = Arc::new(self.build_metadata(&decision));
        (metadata, decision)
    }

    /// Phase A: keep every running group advancing, preempting the most
    /// recently admitted groups when blocks run out.
    fn schedule_running(
        &mut self,
        budget: &mut TokenBudget,
        prefills: &mut Vec<ScheduledGroup>,
        decodes: &mut Vec<ScheduledGroup>,
        decision: &mut ScheduleDecision,
    ) {
        let lookahead = self.config.num_lookahead_slots();
        let mut queue: VecDeque<RequestId> = std::mem::take(&mut self.running);
        let mut kept: VecDeque<RequestId> = VecDeque::new();

        while let Some(id) = queue.pop_front() {
            if !self.groups.contains_key(&id) {
                continue;
            }

            let mut preempted_self = false;
            loop {
                let group = &self.groups[&id];
                if self.block_manager.can_append_slots(group, lookahead) {
                    break;
                }
                // Victims are the last-admitted groups still behind us.
                if let Some(victim) = queue.pop_back() {
                    self.preempt(&victim, decision);
                } else {
                    self.preempt(&id, decision);
                    preempted_self = true;
                    break;
                }
            }
            if preempted_self {
                continue;
            }

            let group = &self.groups[&id];
            for seq in group.get_seqs(Some(SequenceStatus::Running)) {
                if let Some(copies) = self.block_manager.append_slots(seq, lookahead) {
                    decision.blocks_to_copy.extend(copies);
                }
            }

            let group = &self.groups[&id];
            if group.is_prefill() {
                // Chunked prefill continuation.
                let uncomputed = group.first_seq().num_uncomputed_tokens();
                let chunk = uncomputed.min(budget.remaining_tokens());
                if chunk == 0 {
                    kept.push_back(id);
                    continue;
                }
                budget.add(chunk, 1);
                prefills.push(ScheduledGroup {
                    request_id: id.clone(),
                    token_chunk_size: chunk,
                });
            } else {
                let num_seqs = group.num_seqs(Some(SequenceStatus::Running));
                budget.add(num_seqs, 1);
                decodes.push(ScheduledGroup {
                    request_id: id.clone(),
                    token_chunk_size: 1,
                });
            }
            kept.push_back(id);
        }
        self.running = kept;
    }

    /// Phase B: resume swapped groups while room exists. Gated on a tick
    /// with no preemptions so eviction and re-admission never interleave.
    fn schedule_swapped(
        &mut self,
        budget: &mut TokenBudget,
        decodes: &mut Vec<ScheduledGroup>,
        decision: &mut ScheduleDecision,
        lookahead: usize,
    ) {
        let mut queue: VecDeque<RequestId> = std::mem::take(&mut self.swapped);

        while let Some(id) = queue.pop_front() {
            let Some(group) = self.groups.get(&id) else {
                continue;
            };
            let seq_ids: Vec<SeqId> = group
                .get_seqs(Some(SequenceStatus::Swapped))
                .iter()
                .map(|s| s.seq_id)
                .collect();
            let num_seqs = seq_ids.len();

            if !self.block_manager.can_swap_in(&seq_ids, lookahead)
                || !budget.can_schedule(num_seqs, 1)
            {
                queue.push_front(id);
                break;
            }

            let moves = self.block_manager.swap_in(&seq_ids);
            decision.blocks_to_swap_in.extend(moves);
            let group = self.groups.get_mut(&id).unwrap();
            for seq in group.seqs_mut(Some(SequenceStatus::Swapped)) {
                seq.set_status(SequenceStatus::Running);
            }
            debug!(request_id = %id, "swapped in");

            let group = &self.groups[&id];
            for seq in group.get_seqs(Some(SequenceStatus::Running)) {
                if let Some(copies) = self.block_manager.append_slots(seq, lookahead) {
                    decision.blocks_to_copy.extend(copies);
                }
            }
            budget.add(num_seqs, 1);
            decodes.push(ScheduledGroup {
                request_id: id.clone(),
                token_chunk_size: 1,
            });
            self.running.push_back(id);
        }
        self.swapped = queue;
    }

    /// Phase C: admit waiting prompts in arrival order.
    fn schedule_waiting(
        &mut self,
        budget: &mut TokenBudget,
        prefills: &mut Vec<ScheduledGroup>,
        decision: &mut ScheduleDecision,
        now: Instant,
    ) {
        let prompt_limit = if self.config.enable_chunked_prefill {
            self.max_model_len
        } else {
            self.max_model_len
                .min(self.config.max_num_batched_tokens)
        };

        while let Some(id) = self.waiting.front().cloned() {
            let Some(group) = self.groups.get(&id) else {
                self.waiting.pop_front();
                continue;
            };

            let num_new_tokens = group.first_seq().num_uncomputed_tokens();
            if num_new_tokens > prompt_limit {
                warn!(
                    request_id = %id,
                    num_new_tokens, prompt_limit, "prompt over length limit; ignoring"
                );
                self.waiting.pop_front();
                self.ignore_group(&id, decision);
                continue;
            }

            match self.block_manager.can_allocate(group) {
                AllocStatus::Never => {
                    warn!(
                        request_id = %id,
                        "prompt cannot fit in an empty KV cache; ignoring"
                    );
                    self.waiting.pop_front();
                    self.ignore_group(&id, decision);
                    continue;
                }
                AllocStatus::Later => break,
                AllocStatus::Ok => {}
            }

            let chunk = if self.config.enable_chunked_prefill {
                num_new_tokens.min(budget.remaining_tokens())
            } else {
                num_new_tokens
            };
            if chunk == 0 || !budget.can_schedule(chunk, 1) {
                break;
            }

            let group = &self.groups[&id];
            if !self.block_manager.allocate(group) {
                break;
            }
            let group = self.groups.get_mut(&id).unwrap();
            for seq in group.seqs_mut(Some(SequenceStatus::Waiting)) {
                seq.set_status(SequenceStatus::Running);
            }
            group.maybe_set_first_scheduled_time(now);
            debug!(request_id = %id, chunk, "admitted for prefill");

            budget.add(chunk, 1);
            prefills.push(ScheduledGroup {
                request_id: id.clone(),
                token_chunk_size: chunk,
            });
            self.running.push_back(id);
            self.waiting.pop_front();
        }
    }

    /// Remove a group from the table, finish its sequences as ignored, and
    /// surface it through the decision.
    fn ignore_group(&mut self, request_id: &str, decision: &mut ScheduleDecision) {
        let Some(mut group) = self.groups.remove(request_id) else {
            return;
        };
        let seq_ids: Vec<SeqId> = group.seqs.iter().map(|s| s.seq_id).collect();
        for seq in group.seqs_mut(None) {
            seq.set_status(SequenceStatus::FinishedIgnored);
        }
        for seq_id in seq_ids {
            self.block_manager.free(seq_id);
        }
        self.finished_request_ids.push(request_id.to_string());
        decision.ignored_groups.push(group);
    }

    fn preempt(&mut self, request_id: &RequestId, decision: &mut ScheduleDecision) {
        let Some(group) = self.groups.get(request_id) else {
            return;
        };
        let mode = match self.config.preemption_mode {
            PreemptionMode::Recompute => PreemptionMode::Recompute,
            PreemptionMode::Swap => PreemptionMode::Swap,
            PreemptionMode::Auto => {
                if group.num_unfinished_seqs() > 1 {
                    // Recompute would lose the forked sibling structure.
                    PreemptionMode::Swap
                } else {
                    let seq = group.first_seq();
                    if seq.output_len() * 2 < seq.prompt_len() {
                        PreemptionMode::Recompute
                    } else {
                        PreemptionMode::Swap
                    }
                }
            }
        };
        decision.preempted += 1;
        match mode {
            PreemptionMode::Recompute | PreemptionMode::Auto => {
                self.preempt_by_recompute(request_id)
            }
            PreemptionMode::Swap => self.preempt_by_swap(request_id, decision),
        }
    }

    fn preempt_by_recompute(&mut self, request_id: &RequestId) {
        let Some(group) = self.groups.get_mut(request_id) else {
            return;
        };
        debug!(request_id = %request_id, "preempting by recompute");
        let mut seq_ids = Vec::new();
        for seq in group.seqs_mut(Some(SequenceStatus::Running)) {
            seq.set_status(SequenceStatus::Waiting);
            seq.reset_for_recompute();
            seq_ids.push(seq.seq_id);
        }
        for seq_id in seq_ids {
            self.block_manager.free(seq_id);
        }
        // Re-prefill before older arrivals to bound the victim's delay.
        self.waiting.push_front(request_id.clone());
    }

    fn preempt_by_swap(&mut self, request_id: &RequestId, decision: &mut ScheduleDecision) {
        let seq_ids: Vec<SeqId> = self.groups[request_id]
            .get_seqs(Some(SequenceStatus::Running))
            .iter()
            .map(|s| s.seq_id)
            .collect();

        if !self.block_manager.can_swap_out(&seq_ids) {
            if self.groups[request_id].num_unfinished_seqs() == 1 {
                warn!(request_id = %request_id, "host pool full; falling back to recompute");
                self.preempt_by_recompute(request_id);
            } else {
                warn!(request_id = %request_id, "host pool full; dropping multi-sequence group");
                self.ignore_group(request_id, decision);
            }
            return;
        }

        debug!(request_id = %request_id, "preempting by swap");
        let moves = self.block_manager.swap_out(&seq_ids);
        decision.blocks_to_swap_out.extend(moves);
        let group = self.groups.get_mut(request_id).unwrap();
        for seq in group.seqs_mut(Some(SequenceStatus::Running)) {
            seq.set_status(SequenceStatus::Swapped);
        }
        // Resume before older swapped groups.
        self.swapped.push_front(request_id.clone());
    }

    fn compute_allow_async(&self, scheduled: &[ScheduledGroup]) -> bool {
        if !self.config.use_async_output_proc || self.config.is_multi_step() {
            return false;
        }
        scheduled.iter().all(|sg| {
            self.groups
                .get(&sg.request_id)
                .and_then(|g| g.sampling_params())
                .map(|p| p.allows_async_output_proc())
                .unwrap_or(false)
        })
    }

    fn build_metadata(&self, decision: &ScheduleDecision) -> Vec<SequenceGroupMetadata> {
        decision
            .scheduled
            .iter()
            .enumerate()
            .map(|(idx, sg)| {
                let group = &self.groups[&sg.request_id];
                let is_prompt = idx < decision.num_prefill_groups;
                let seqs = group
                    .get_seqs(Some(SequenceStatus::Running))
                    .iter()
                    .map(|seq| {
                        let start = seq.num_computed_tokens();
                        let count = if is_prompt {
                            sg.token_chunk_size
                        } else {
                            seq.num_uncomputed_tokens()
                        };
                        SequenceMetadata {
                            seq_id: seq.seq_id,
                            token_ids: seq.token_slice(start, count),
                            num_computed_tokens: start,
                            block_table: self
                                .block_manager
                                .block_table(seq.seq_id)
                                .map(|t| t.to_vec())
                                .unwrap_or_default(),
                        }
                    })
                    .collect();
                let do_sample = !is_prompt
                    || group.first_seq().num_uncomputed_tokens() == sg.token_chunk_size;
                let encoder_prompt_token_ids = if is_prompt
                    && group.first_seq().num_computed_tokens() == 0
                {
                    group
                        .encoder_seq
                        .as_ref()
                        .map(|s| s.prompt_token_ids.clone())
                } else {
                    None
                };
                SequenceGroupMetadata {
                    request_id: sg.request_id.clone(),
                    is_prompt,
                    seqs,
                    sampling_params: group.sampling_params().cloned(),
                    token_chunk_size: sg.token_chunk_size,
                    do_sample,
                    lora: group.lora.clone(),
                    prompt_adapter: group.prompt_adapter.clone(),
                    encoder_prompt_token_ids,
                }
            })
            .collect()
    }
}
