//! Physical KV-cache blocks and the free-list arena that owns them.
//!
//! Blocks are indexed by small integers spanning both pools: device blocks
//! occupy `[0, num_gpu)` and host blocks `[num_gpu, num_gpu + num_cpu)`, so
//! a block id is globally unique and carries its pool implicitly. All
//! sharing goes through the per-entry ref-count; a block with ref-count 0
//! is on its pool's free list and nowhere else.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::types::{BlockId, Device, TokenId};

/// One fixed-size slab of KV cache.
#[derive(Debug, Clone)]
pub struct PhysicalBlock {
    pub id: BlockId,
    pub device: Device,
    pub ref_count: u32,
    /// Content hash of the full token window this block holds, when prefix
    /// caching is enabled.
    pub content_hash: Option<u64>,
}

/// Rolling content hash over one block-sized window of tokens, chained to
/// the previous window's hash so equal hashes imply equal prefixes.
pub fn content_hash(parent: Option<u64>, tokens: &[TokenId]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or(0).to_le_bytes());
    for token in tokens {
        hasher.update(token.to_le_bytes());
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Free-list arena over both block pools.
pub struct BlockArena {
    blocks: Vec<PhysicalBlock>,
    gpu_free: VecDeque<BlockId>,
    cpu_free: VecDeque<BlockId>,
    num_gpu: usize,
    num_cpu: usize,
    enable_prefix_caching: bool,
    /// Live device blocks by content hash.
    cached: HashMap<u64, BlockId>,
    cache_queries: u64,
    cache_hits: u64,
}

impl BlockArena {
    pub fn new(num_gpu: usize, num_cpu: usize, enable_prefix_caching: bool) -> Self {
        let mut blocks = Vec::with_capacity(num_gpu + num_cpu);
        for id in 0..num_gpu {
            blocks.push(PhysicalBlock {
                id,
                device: Device::Gpu,
                ref_count: 0,
                content_hash: None,
            });
        }
        for id in num_gpu..num_gpu + num_cpu {
            blocks.push(PhysicalBlock {
                id,
                device: Device::Cpu,
                ref_count: 0,
                content_hash: None,
            });
        }
        Self {
            blocks,
            gpu_free: (0..num_gpu).collect(),
            cpu_free: (num_gpu..num_gpu + num_cpu).collect(),
            num_gpu,
            num_cpu,
            enable_prefix_caching,
            cached: HashMap::new(),
            cache_queries: 0,
            cache_hits: 0,
        }
    }

    pub fn num_total(&self, device: Device) -> usize {
        match device {
            Device::Gpu => self.num_gpu,
            Device::Cpu => self.num_cpu,
        }
    }

    pub fn num_free(&self, device: Device) -> usize {
        match device {
            Device::Gpu => self.gpu_free.len(),
            Device::Cpu => self.cpu_free.len(),
        }
    }

    pub fn can_allocate(&self, device: Device, n: usize) -> bool {
        self.num_free(device) >= n
    }

    pub fn device_of(&self, block_id: BlockId) -> Device {
        self.blocks[block_id].device
    }

    pub fn ref_count(&self, block_id: BlockId) -> u32 {
        self.blocks[block_id].ref_count
    }

    /// Take a fresh block from the pool's free list with ref-count 1.
    pub fn allocate(&mut self, device: Device) -> Option<BlockId> {
        let free_list = match device {
            Device::Gpu => &mut self.gpu_free,
            Device::Cpu => &mut self.cpu_free,
        };
        let id = free_list.pop_front()?;
        let block = &mut self.blocks[id];
        block.ref_count = 1;
        block.content_hash = None;
        Some(id)
    }

    /// Allocate a device block for a hashed token window, reusing a live
    /// block with the same content when one exists.
    pub fn allocate_cached(&mut self, hash: u64) -> Option<BlockId> {
        debug_assert!(self.enable_prefix_caching);
        self.cache_queries += 1;
        if let Some(&id) = self.cached.get(&hash) {
            self.cache_hits += 1;
            self.blocks[id].ref_count += 1;
            debug!(block_id = id, hash, "prefix cache hit");
            return Some(id);
        }
        let id = self.allocate(Device::Gpu)?;
        self.blocks[id].content_hash = Some(hash);
        self.cached.insert(hash, id);
        Some(id)
    }

    /// Add one reference to a live block (fork / shared-prompt sharing).
    pub fn ref_inc(&mut self, block_id: BlockId) {
        debug_assert!(self.blocks[block_id].ref_count > 0);
        self.blocks[block_id].ref_count += 1;
    }

    /// Drop one reference; the block returns to its free list at zero.
    pub fn free(&mut self, block_id: BlockId) {
        let block = &mut self.blocks[block_id];
        debug_assert!(block.ref_count > 0, "double free of block {}", block_id);
        block.ref_count -= 1;
        if block.ref_count == 0 {
            if let Some(hash) = block.content_hash.take() {
                self.cached.remove(&hash);
            }
            match block.device {
                Device::Gpu => self.gpu_free.push_back(block_id),
                Device::Cpu => self.cpu_free.push_back(block_id),
            }
        }
    }

    pub fn prefix_hit_rate(&self) -> f32 {
        if self.cache_queries == 0 {
            return 0.0;
        }
        self.cache_hits as f32 / self.cache_queries as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_round_trip() {
        let mut arena = BlockArena::new(4, 2, false);
        assert_eq!(arena.num_free(Device::Gpu), 4);
        assert_eq!(arena.num_free(Device::Cpu), 2);

        let a = arena.allocate(Device::Gpu).unwrap();
        let b = arena.allocate(Device::Gpu).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.num_free(Device::Gpu), 2);
        assert_eq!(arena.ref_count(a), 1);

        arena.free(a);
        arena.free(b);
        assert_eq!(arena.num_free(Device::Gpu), 4);
    }

    #[test]
    fn test_cpu_blocks_have_distinct_ids() {
        let mut arena = BlockArena::new(3, 3, false);
        let gpu = arena.allocate(Device::Gpu).unwrap();
        let cpu = arena.allocate(Device::Cpu).unwrap();
        assert_ne!(gpu, cpu);
        assert_eq!(arena.device_of(gpu), Device::Gpu);
        assert_eq!(arena.device_of(cpu), Device::Cpu);
    }

    #[test]
    fn test_shared_block_freed_once_per_reference() {
        let mut arena = BlockArena::new(2, 0, false);
        let a = arena.allocate(Device::Gpu).unwrap();
        arena.ref_inc(a);
        assert_eq!(arena.ref_count(a), 2);

        arena.free(a);
        assert_eq!(arena.num_free(Device::Gpu), 1);
        arena.free(a);
        assert_eq!(arena.num_free(Device::Gpu), 2);
    }

    #[test]
    fn test_prefix_cache_reuse() {
        let mut arena = BlockArena::new(4, 0, true);
        let h = content_hash(None, &[1, 2, 3, 4]);

        let a = arena.allocate_cached(h).unwrap();
        let b = arena.allocate_cached(h).unwrap();
        assert_eq!(a, b);
        assert_eq!(arena.ref_count(a), 2);
        assert_eq!(arena.num_free(Device::Gpu), 3);
        assert!(arena.prefix_hit_rate() > 0.4);

        arena.free(a);
        arena.free(a);
        // Fully freed blocks leave the cache; the next request re-registers.
        let c = arena.allocate_cached(h).unwrap();
        assert_eq!(arena.ref_count(c), 1);
    }

    #[test]
    fn test_content_hash_chains_parent() {
        let first = content_hash(None, &[1, 2, 3, 4]);
        let second = content_hash(Some(first), &[5, 6, 7, 8]);
        let second_other_parent = content_hash(None, &[5, 6, 7, 8]);
        assert_ne!(second, second_other_parent);
        assert_eq!(content_hash(None, &[1, 2, 3, 4]), first);
    }
}
