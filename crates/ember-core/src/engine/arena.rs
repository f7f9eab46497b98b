//! Paged KV cache arena.
//!
//! Implements block-based memory management for autoregressive attention
//! caches. Key features:
//! - Fixed-size blocks (pages) pre-allocated at construction
//! - LIFO free lists per residency location for allocation locality
//! - Reference counting for block sharing between forked sequences
//! - Monotonic access clock for LRU eviction
//! - Zero-copy views over block storage for the model forward pass

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::types::BlockId;
use crate::config::{EngineConfig, ModelSpec};
use crate::error::{Error, Result};

/// Storage data type for KV entries.
///
/// The control plane computes in f32; the dtype governs byte accounting
/// and the on-disk layout of persisted blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvDtype {
    Float32,
    Float16,
    BFloat16,
}

impl KvDtype {
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "float32" | "f32" => Ok(Self::Float32),
            "float16" | "f16" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            other => Err(Error::Config(format!("unknown kv dtype: {other}"))),
        }
    }
}

/// Residency of a block's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    Device,
    Host,
}

/// Configuration for the KV cache arena.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Number of blocks to pre-allocate
    pub num_blocks: usize,
    /// Tokens per block
    pub block_size_tokens: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of KV heads (GQA: may be fewer than query heads)
    pub num_kv_heads: usize,
    /// Dimension of each attention head
    pub head_dim: usize,
    /// Storage data type
    pub dtype: KvDtype,
    /// Whether blocks may migrate to host memory
    pub allow_host_overflow: bool,
    /// Maximum blocks resident on host
    pub max_host_blocks: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            num_blocks: 1024,
            block_size_tokens: 32,
            num_layers: 32,
            num_kv_heads: 4,
            head_dim: 128,
            dtype: KvDtype::Float16,
            allow_host_overflow: true,
            max_host_blocks: 256,
        }
    }
}

impl ArenaConfig {
    pub fn from_engine(config: &EngineConfig, spec: &ModelSpec) -> Result<Self> {
        Ok(Self {
            num_blocks: config.kv_num_blocks,
            block_size_tokens: config.kv_block_size,
            num_layers: spec.num_layers,
            num_kv_heads: spec.num_kv_heads,
            head_dim: spec.head_dim,
            dtype: KvDtype::parse(&config.kv_dtype)?,
            allow_host_overflow: config.allow_host_overflow,
            max_host_blocks: config.max_host_blocks,
        })
    }

    /// Elements in one K (or V) slab: layers * block_size * kv_heads * head_dim.
    pub fn slab_elements(&self) -> usize {
        self.num_layers * self.block_size_tokens * self.num_kv_heads * self.head_dim
    }

    /// Bytes per block (K and V slabs) at the configured dtype.
    pub fn block_bytes(&self) -> usize {
        2 * self.slab_elements() * self.dtype.size_bytes()
    }

    /// Blocks required to hold `num_tokens` tokens.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        (num_tokens + self.block_size_tokens - 1) / self.block_size_tokens
    }
}

/// Metadata for one block; storage lives separately so the model's
/// forward pass never holds the allocator lock.
#[derive(Debug)]
struct BlockMeta {
    location: BlockLocation,
    ref_count: usize,
    last_access: u64,
}

/// K and V slabs for one block, each shaped
/// `[num_layers, block_size, num_kv_heads, head_dim]` row-major.
pub struct BlockData {
    k: Vec<f32>,
    v: Vec<f32>,
    dirty: bool,
}

struct ArenaState {
    meta: Vec<BlockMeta>,
    /// Free block IDs on device, LIFO for reuse locality
    free_device: Vec<BlockId>,
    /// Free block IDs on host
    free_host: Vec<BlockId>,
    device_to_host_moves: u64,
    host_to_device_moves: u64,
}

/// Arena statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArenaStats {
    pub total_blocks: usize,
    pub free_device_blocks: usize,
    pub free_host_blocks: usize,
    pub allocated_blocks: usize,
    pub host_resident_blocks: usize,
    pub total_memory_bytes: usize,
    pub device_memory_bytes: usize,
    pub host_memory_bytes: usize,
    pub device_to_host_moves: u64,
    pub host_to_device_moves: u64,
}

/// KV cache arena with paged memory management.
pub struct Arena {
    config: ArenaConfig,
    state: Mutex<ArenaState>,
    storage: Vec<Mutex<BlockData>>,
    /// Monotonic access clock for LRU ordering
    clock: AtomicU64,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Self {
        let slab = config.slab_elements();
        let storage = (0..config.num_blocks)
            .map(|_| {
                Mutex::new(BlockData {
                    k: vec![0.0; slab],
                    v: vec![0.0; slab],
                    dirty: false,
                })
            })
            .collect();

        let meta = (0..config.num_blocks)
            .map(|_| BlockMeta {
                location: BlockLocation::Device,
                ref_count: 0,
                last_access: 0,
            })
            .collect();

        // LIFO: highest id pops first; ordering is irrelevant beyond reuse locality.
        let free_device: Vec<BlockId> = (0..config.num_blocks).collect();

        debug!(
            num_blocks = config.num_blocks,
            block_bytes = config.block_bytes(),
            "initialized KV arena"
        );

        Self {
            config,
            state: Mutex::new(ArenaState {
                meta,
                free_device,
                free_host: Vec::new(),
                device_to_host_moves: 0,
                host_to_device_moves: 0,
            }),
            storage,
            clock: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate one block from the device free list. O(1); never blocks.
    pub fn allocate_block(&self) -> Result<BlockId> {
        let mut state = self.lock_state();
        self.pop_device_block(&mut state)
            .ok_or_else(|| Error::NoCapacity("no free device blocks".to_string()))
    }

    /// Allocate `n` blocks atomically: either all succeed or none are taken.
    pub fn allocate_blocks(&self, n: usize) -> Result<Vec<BlockId>> {
        let mut state = self.lock_state();
        if state.free_device.len() < n {
            return Err(Error::NoCapacity(format!(
                "requested {n} blocks, {} free",
                state.free_device.len()
            )));
        }
        let ids: Vec<BlockId> = (0..n)
            .map(|_| self.pop_device_block(&mut state).expect("count checked"))
            .collect();
        Ok(ids)
    }

    fn pop_device_block(&self, state: &mut ArenaState) -> Option<BlockId> {
        let id = state.free_device.pop()?;
        let now = self.tick();
        let meta = &mut state.meta[id];
        meta.ref_count = 1;
        meta.last_access = now;
        // Storage is never zeroed on reuse; a stale dirty bit would only
        // trigger a redundant persist.
        if let Ok(mut data) = self.storage[id].try_lock() {
            data.dirty = false;
        }
        Some(id)
    }

    /// Return a block to the free list for its current location.
    /// Does not zero storage.
    pub fn free_block(&self, block_id: BlockId) {
        let mut state = self.lock_state();
        self.free_block_locked(&mut state, block_id);
    }

    fn free_block_locked(&self, state: &mut ArenaState, block_id: BlockId) {
        let meta = &mut state.meta[block_id];
        meta.ref_count = 0;
        match meta.location {
            BlockLocation::Device => state.free_device.push(block_id),
            BlockLocation::Host => state.free_host.push(block_id),
        }
    }

    /// Increment a block's reference count.
    pub fn ref_block(&self, block_id: BlockId) {
        let mut state = self.lock_state();
        state.meta[block_id].ref_count += 1;
    }

    /// Decrement a block's reference count; at zero the block is freed.
    pub fn unref_block(&self, block_id: BlockId) {
        let mut state = self.lock_state();
        let meta = &mut state.meta[block_id];
        meta.ref_count = meta.ref_count.saturating_sub(1);
        if meta.ref_count == 0 {
            self.free_block_locked(&mut state, block_id);
        }
    }

    /// Update a block's last-access time to the next clock tick.
    pub fn touch(&self, block_id: BlockId) {
        let now = self.tick();
        let mut state = self.lock_state();
        state.meta[block_id].last_access = now;
    }

    pub fn ref_count(&self, block_id: BlockId) -> usize {
        self.lock_state().meta[block_id].ref_count
    }

    pub fn location(&self, block_id: BlockId) -> BlockLocation {
        self.lock_state().meta[block_id].location
    }

    pub fn last_access(&self, block_id: BlockId) -> u64 {
        self.lock_state().meta[block_id].last_access
    }

    pub fn is_dirty(&self, block_id: BlockId) -> bool {
        self.storage[block_id].lock().expect("block lock poisoned").dirty
    }

    /// Move a block's residency to host memory.
    ///
    /// On unified-memory devices this is a metadata operation; the slabs
    /// stay in place. Fails if host overflow is disabled or the host
    /// budget is exhausted, leaving the block untouched.
    pub fn migrate_to_host(&self, block_id: BlockId) -> Result<()> {
        let mut state = self.lock_state();
        if !self.config.allow_host_overflow {
            return Err(Error::NoCapacity("host overflow disabled".to_string()));
        }
        let host_resident = state
            .meta
            .iter()
            .filter(|m| m.location == BlockLocation::Host)
            .count();
        if host_resident >= self.config.max_host_blocks {
            return Err(Error::NoCapacity("host block budget exhausted".to_string()));
        }
        let meta = &mut state.meta[block_id];
        if meta.location == BlockLocation::Host {
            return Ok(());
        }
        meta.location = BlockLocation::Host;
        state.device_to_host_moves += 1;
        Ok(())
    }

    /// Move a block's residency back to device memory.
    pub fn migrate_to_device(&self, block_id: BlockId) -> Result<()> {
        let mut state = self.lock_state();
        let meta = &mut state.meta[block_id];
        if meta.location == BlockLocation::Device {
            return Ok(());
        }
        meta.location = BlockLocation::Device;
        state.host_to_device_moves += 1;
        Ok(())
    }

    /// Build a zero-copy view over the given blocks, in page-table order.
    ///
    /// The view locks each block's storage for its lifetime; it must not
    /// outlive the model call it is handed to.
    pub fn block_views(&self, block_ids: &[BlockId]) -> Result<KvView<'_>> {
        let mut guards = Vec::with_capacity(block_ids.len());
        for &id in block_ids {
            let slot = self
                .storage
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("block {id}")))?;
            guards.push(slot.lock().expect("block lock poisoned"));
        }
        Ok(KvView {
            block_size: self.config.block_size_tokens,
            kv_heads: self.config.num_kv_heads,
            head_dim: self.config.head_dim,
            guards,
        })
    }

    /// Copy a block's slabs out (used by the eviction manager's persist path).
    pub fn export_block(&self, block_id: BlockId) -> Result<(Vec<f32>, Vec<f32>)> {
        let data = self
            .storage
            .get(block_id)
            .ok_or_else(|| Error::NotFound(format!("block {block_id}")))?
            .lock()
            .expect("block lock poisoned");
        Ok((data.k.clone(), data.v.clone()))
    }

    /// Overwrite a block's slabs (used by the restore path).
    pub fn import_block(&self, block_id: BlockId, k: &[f32], v: &[f32]) -> Result<()> {
        let slab = self.config.slab_elements();
        if k.len() != slab || v.len() != slab {
            return Err(Error::Persistence(format!(
                "slab size mismatch: got {}/{}, expected {slab}",
                k.len(),
                v.len()
            )));
        }
        let mut data = self
            .storage
            .get(block_id)
            .ok_or_else(|| Error::NotFound(format!("block {block_id}")))?
            .lock()
            .expect("block lock poisoned");
        data.k.copy_from_slice(k);
        data.v.copy_from_slice(v);
        data.dirty = false;
        Ok(())
    }

    pub fn mark_clean(&self, block_id: BlockId) {
        self.storage[block_id].lock().expect("block lock poisoned").dirty = false;
    }

    /// Release every block back to the device free list (teardown).
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.free_host.clear();
        state.free_device = (0..self.config.num_blocks).collect();
        for meta in &mut state.meta {
            meta.ref_count = 0;
            meta.location = BlockLocation::Device;
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.lock_state();
        let free_device = state.free_device.len();
        let free_host = state.free_host.len();
        let host_resident = state
            .meta
            .iter()
            .filter(|m| m.location == BlockLocation::Host)
            .count();
        let block_bytes = self.config.block_bytes();
        let total = self.config.num_blocks;
        ArenaStats {
            total_blocks: total,
            free_device_blocks: free_device,
            free_host_blocks: free_host,
            allocated_blocks: total - free_device - free_host,
            host_resident_blocks: host_resident,
            total_memory_bytes: total * block_bytes,
            device_memory_bytes: (total - host_resident) * block_bytes,
            host_memory_bytes: host_resident * block_bytes,
            device_to_host_moves: state.device_to_host_moves,
            host_to_device_moves: state.host_to_device_moves,
        }
    }

    pub fn free_device_blocks(&self) -> usize {
        self.lock_state().free_device.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock().expect("arena lock poisoned")
    }
}

/// Transient view over a batch's blocks, handed to the model for one
/// forward call. Entry layout within a slab is
/// `(layer, token_slot, kv_head, dim)` row-major; an "entry" below is the
/// contiguous `[num_kv_heads * head_dim]` span for one (layer, slot).
pub struct KvView<'a> {
    block_size: usize,
    kv_heads: usize,
    head_dim: usize,
    guards: Vec<MutexGuard<'a, BlockData>>,
}

impl KvView<'_> {
    pub fn num_blocks(&self) -> usize {
        self.guards.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Width of one (layer, slot) entry: kv_heads * head_dim.
    pub fn entry_width(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    fn entry_range(&self, layer: usize, slot: usize) -> std::ops::Range<usize> {
        let width = self.entry_width();
        let start = (layer * self.block_size + slot) * width;
        start..start + width
    }

    /// Write the K and V entries for one token position.
    pub fn write_token(&mut self, layer: usize, page_idx: usize, slot: usize, k: &[f32], v: &[f32]) {
        let range = self.entry_range(layer, slot);
        let data = &mut *self.guards[page_idx];
        data.k[range.clone()].copy_from_slice(k);
        data.v[range].copy_from_slice(v);
        data.dirty = true;
    }

    pub fn k_entry(&self, layer: usize, page_idx: usize, slot: usize) -> &[f32] {
        let range = self.entry_range(layer, slot);
        &self.guards[page_idx].k[range]
    }

    pub fn v_entry(&self, layer: usize, page_idx: usize, slot: usize) -> &[f32] {
        let range = self.entry_range(layer, slot);
        &self.guards[page_idx].v[range]
    }
}
