//! Block tables and the allocation policy over the block arena.
//!
//! The block manager owns every mapping from sequences to physical blocks.
//! Sibling sequences of one group share their prompt blocks through
//! ref-counts; the write block is copied on demand when shared, and whole
//! groups can be moved between the device and host pools.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use super::block::{content_hash, BlockArena};
use super::sequence::{Sequence, SequenceGroup, SequenceStatus};
use super::types::{BlockId, Device, SeqId};

/// Admission answer for a new sequence group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStatus {
    /// Fits right now.
    Ok,
    /// Does not fit now but would in an emptier cache.
    Later,
    /// Cannot fit even in an empty cache; the group must be ignored.
    Never,
}

pub struct BlockManager {
    block_size: usize,
    arena: BlockArena,
    block_tables: HashMap<SeqId, Vec<BlockId>>,
    watermark_blocks: usize,
    enable_prefix_caching: bool,
}

impl BlockManager {
    pub fn new(
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
        watermark: f32,
        enable_prefix_caching: bool,
    ) -> Self {
        let watermark_blocks = (watermark * num_gpu_blocks as f32) as usize;
        Self {
            block_size,
            arena: BlockArena::new(num_gpu_blocks, num_cpu_blocks, enable_prefix_caching),
            block_tables: HashMap::new(),
            watermark_blocks,
            enable_prefix_caching,
        }
    }

    fn blocks_for(&self, num_tokens: usize) -> usize {
        (num_tokens + self.block_size - 1) / self.block_size
    }

    /// Whether the prompt of a new group fits, and if not, whether it ever
    /// could.
    pub fn can_allocate(&self, group: &SequenceGroup) -> AllocStatus {
        let seq = group.first_seq();
        let required = seq.n_blocks_needed();
        if required > self.arena.num_total(Device::Gpu) {
            return AllocStatus::Never;
        }
        if self.arena.num_free(Device::Gpu) >= required + self.watermark_blocks {
            AllocStatus::Ok
        } else {
            AllocStatus::Later
        }
    }

    /// Build block tables for every waiting sequence of a new group. The
    /// first child owns (or prefix-shares) the prompt blocks; siblings
    /// share them by reference.
    pub fn allocate(&mut self, group: &SequenceGroup) -> bool {
        let waiting = group.get_seqs(Some(SequenceStatus::Waiting));
        let Some(first) = waiting.first() else {
            return false;
        };

        let table = match self.build_prompt_table(first) {
            Some(table) => table,
            None => {
                warn!(
                    request_id = %group.request_id,
                    "prompt allocation failed despite admission check"
                );
                return false;
            }
        };

        for seq in &waiting[1..] {
            for &block in &table {
                self.arena.ref_inc(block);
            }
            self.block_tables.insert(seq.seq_id, table.clone());
        }
        debug!(
            request_id = %group.request_id,
            num_blocks = table.len(),
            num_seqs = waiting.len(),
            "allocated prompt blocks"
        );
        self.block_tables.insert(first.seq_id, table);
        true
    }

    fn build_prompt_table(&mut self, seq: &Sequence) -> Option<Vec<BlockId>> {
        let required = seq.n_blocks_needed();
        let mut table = Vec::with_capacity(required);
        let mut parent_hash = None;

        for block_idx in 0..required {
            let start = block_idx * self.block_size;
            let is_full = start + self.block_size <= seq.len();
            let block = if self.enable_prefix_caching && is_full {
                let window = seq.token_slice(start, self.block_size);
                let hash = content_hash(parent_hash, &window);
                parent_hash = Some(hash);
                self.arena.allocate_cached(hash)
            } else {
                self.arena.allocate(Device::Gpu)
            };
            match block {
                Some(id) => table.push(id),
                None => {
                    for &id in &table {
                        self.arena.free(id);
                    }
                    return None;
                }
            }
        }
        Some(table)
    }

    /// Whether every running child of the group can take its next slots
    /// (including the lookahead reservation and a possible copy-on-write).
    pub fn can_append_slots(&self, group: &SequenceGroup, num_lookahead: usize) -> bool {
        let mut needed = 0;
        for seq in group.get_seqs(Some(SequenceStatus::Running)) {
            let Some(table) = self.block_tables.get(&seq.seq_id) else {
                continue;
            };
            let target = self.blocks_for(seq.len() + num_lookahead);
            needed += target.saturating_sub(table.len());
            if self.write_block_needs_copy(seq, table) {
                needed += 1;
            }
        }
        self.arena.num_free(Device::Gpu) >= needed
    }

    fn write_block_needs_copy(&self, seq: &Sequence, table: &[BlockId]) -> bool {
        let write_idx = self.blocks_for(seq.len()).saturating_sub(1);
        match table.get(write_idx) {
            Some(&block) => self.arena.ref_count(block) > 1,
            None => false,
        }
    }

    /// Grow a sequence's table for its next tokens. Returns the
    /// copy-on-write pairs the executor must materialize, or `None` when
    /// the pool is exhausted (callers check `can_append_slots` first).
    pub fn append_slots(
        &mut self,
        seq: &Sequence,
        num_lookahead: usize,
    ) -> Option<Vec<(BlockId, BlockId)>> {
        let table = self.block_tables.get_mut(&seq.seq_id)?;
        let mut copies = Vec::new();

        // Copy-on-write applies only when the block holding the next write
        // position already exists and is shared.
        let write_idx = (seq.len() + self.block_size - 1) / self.block_size;
        let write_idx = write_idx.saturating_sub(1);
        if let Some(&write_block) = table.get(write_idx) {
            if self.arena.ref_count(write_block) > 1 {
                let fresh = self.arena.allocate(Device::Gpu)?;
                self.arena.free(write_block);
                table[write_idx] = fresh;
                copies.push((write_block, fresh));
            }
        }

        let target = (seq.len() + num_lookahead + self.block_size - 1) / self.block_size;
        while table.len() < target {
            let fresh = self.arena.allocate(Device::Gpu)?;
            table.push(fresh);
        }
        Some(copies)
    }

    /// Share the parent's blocks with a forked child.
    pub fn fork(&mut self, parent: SeqId, child: SeqId) {
        let Some(table) = self.block_tables.get(&parent).cloned() else {
            return;
        };
        for &block in &table {
            self.arena.ref_inc(block);
        }
        self.block_tables.insert(child, table);
    }

    /// Return every block the sequence references. Idempotent.
    pub fn free(&mut self, seq_id: SeqId) {
        if let Some(table) = self.block_tables.remove(&seq_id) {
            for block in table {
                self.arena.free(block);
            }
        }
    }

    pub fn can_swap_out(&self, seq_ids: &[SeqId]) -> bool {
        self.arena.num_free(Device::Cpu) >= self.unique_blocks(seq_ids)
    }

    /// Move every device block of the given sequences to the host pool.
    /// Returns the (device, host) move map for the executor.
    pub fn swap_out(&mut self, seq_ids: &[SeqId]) -> Vec<(BlockId, BlockId)> {
        self.swap(seq_ids, Device::Cpu)
    }

    pub fn can_swap_in(&self, seq_ids: &[SeqId], num_lookahead: usize) -> bool {
        let extra_per_seq = 1 + num_lookahead / self.block_size;
        let required = self.unique_blocks(seq_ids) + seq_ids.len() * extra_per_seq;
        self.arena.num_free(Device::Gpu) >= required + self.watermark_blocks
    }

    /// Inverse of `swap_out`; returns the (host, device) move map.
    pub fn swap_in(&mut self, seq_ids: &[SeqId]) -> Vec<(BlockId, BlockId)> {
        self.swap(seq_ids, Device::Gpu)
    }

    fn swap(&mut self, seq_ids: &[SeqId], target: Device) -> Vec<(BlockId, BlockId)> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        let mut moves = Vec::new();
        for &seq_id in seq_ids {
            let Some(table) = self.block_tables.get_mut(&seq_id) else {
                continue;
            };
            for slot in table.iter_mut() {
                let src = *slot;
                let dst = match mapping.get(&src) {
                    Some(&dst) => {
                        self.arena.ref_inc(dst);
                        dst
                    }
                    None => {
                        // Capacity was checked by the can_swap_* gate.
                        let Some(dst) = self.arena.allocate(target) else {
                            warn!("swap allocation failed mid-group");
                            continue;
                        };
                        mapping.insert(src, dst);
                        moves.push((src, dst));
                        dst
                    }
                };
                self.arena.free(src);
                *slot = dst;
            }
        }
        moves
    }

    fn unique_blocks(&self, seq_ids: &[SeqId]) -> usize {
        let mut unique: HashSet<BlockId> = HashSet::new();
        for seq_id in seq_ids {
            if let Some(table) = self.block_tables.get(seq_id) {
                unique.extend(table.iter().copied());
            }
        }
        unique.len()
    }

    pub fn block_table(&self, seq_id: SeqId) -> Option<&[BlockId]> {
        self.block_tables.get(&seq_id).map(|t| t.as_slice())
    }

    pub fn num_free_device_blocks(&self) -> usize {
        self.arena.num_free(Device::Gpu)
    }

    pub fn num_free_host_blocks(&self) -> usize {
        self.arena.num_free(Device::Cpu)
    }

    pub fn num_total_device_blocks(&self) -> usize {
        self.arena.num_total(Device::Gpu)
    }

    pub fn num_total_host_blocks(&self) -> usize {
        self.arena.num_total(Device::Cpu)
    }

    pub fn prefix_hit_rate(&self) -> f32 {
        self.arena.prefix_hit_rate()
    }
}
