//! KV block eviction under memory pressure.
//!
//! When device usage crosses the configured threshold, the manager frees
//! blocks until usage drops to the target, choosing victims with an
//! interchangeable policy (LRU or working-set priority). Evicted entries
//! leave a tombstone in the owning page table; with persistence enabled
//! the block contents are spilled to disk first and restored on the next
//! access.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::arena::KvDtype;
use super::pager::Pager;
use super::types::{BlockId, Priority, SequenceId, TOMBSTONE_BLOCK};
use crate::error::{Error, Result};

/// Eviction configuration.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Used-block fraction that triggers eviction
    pub eviction_threshold: f32,
    /// Used-block fraction to reach after eviction
    pub target_usage: f32,
    /// Spill evicted blocks to disk for later restore
    pub enable_persistence: bool,
    /// Directory for spilled blocks
    pub persistence_dir: PathBuf,
    /// Resident blocks every sequence keeps, no matter the pressure
    pub min_blocks_per_sequence: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: 0.9,
            target_usage: 0.7,
            enable_persistence: false,
            persistence_dir: PathBuf::from(".ember-kv"),
            min_blocks_per_sequence: 1,
        }
    }
}

/// Eviction statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EvictionStats {
    pub num_evictions: u64,
    pub total_blocks_evicted: u64,
    pub blocks_persisted: u64,
    pub blocks_restored: u64,
    pub persistence_bytes: u64,
}

/// An evictable block with the keys policies order by.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub seq_id: SequenceId,
    pub block_idx: usize,
    pub block_id: BlockId,
    pub last_access: u64,
    pub priority: Priority,
}

/// Victim ordering policy. Candidates are sorted cheapest-to-evict first.
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn order(&self, candidates: &mut [Candidate]);

    /// Priority attributed to a sequence when collecting candidates.
    fn sequence_priority(&self, _seq_id: SequenceId) -> Priority {
        0
    }
}

/// Least-recently-used: oldest block access first.
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn order(&self, candidates: &mut [Candidate]) {
        candidates.sort_by_key(|c| c.last_access);
    }
}

/// Working-set priority: lowest sequence priority first, LRU within a
/// priority class.
pub struct WorkingSetPolicy {
    priorities: Mutex<HashMap<SequenceId, Priority>>,
}

impl WorkingSetPolicy {
    pub fn new() -> Self {
        Self {
            priorities: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_sequence_priority(&self, seq_id: SequenceId, priority: Priority) {
        self.priorities
            .lock()
            .expect("priority lock poisoned")
            .insert(seq_id, priority);
    }

    pub fn priority_of(&self, seq_id: SequenceId) -> Priority {
        self.priorities
            .lock()
            .expect("priority lock poisoned")
            .get(&seq_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for WorkingSetPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for WorkingSetPolicy {
    fn name(&self) -> &'static str {
        "working-set"
    }

    fn order(&self, candidates: &mut [Candidate]) {
        candidates.sort_by_key(|c| (c.priority, c.last_access));
    }

    fn sequence_priority(&self, seq_id: SequenceId) -> Priority {
        self.priority_of(seq_id)
    }
}

/// Coordinates victim selection, tombstoning, and optional persistence.
pub struct EvictionManager {
    pager: Arc<Pager>,
    config: EvictionConfig,
    policy: Box<dyn EvictionPolicy>,
    stats: Mutex<EvictionStats>,
}

impl EvictionManager {
    pub fn new(pager: Arc<Pager>, config: EvictionConfig, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            pager,
            config,
            policy,
            stats: Mutex::new(EvictionStats::default()),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Whether device usage has crossed the eviction threshold.
    pub fn should_evict(&self) -> bool {
        let stats = self.pager.arena().stats();
        if stats.total_blocks == 0 {
            return false;
        }
        let used = stats.allocated_blocks as f32 / stats.total_blocks as f32;
        used >= self.config.eviction_threshold
    }

    /// Evict down to the target usage if the threshold is crossed.
    /// Sequences in `protected` (actively decoding) are not candidates.
    pub fn maybe_evict(&self, protected: &HashSet<SequenceId>) -> usize {
        if !self.should_evict() {
            return 0;
        }
        let stats = self.pager.arena().stats();
        let target_used = (self.config.target_usage * stats.total_blocks as f32).floor() as usize;
        let excess = stats.allocated_blocks.saturating_sub(target_used);
        if excess == 0 {
            return 0;
        }
        self.evict_blocks(excess, protected)
    }

    /// Evict up to `num_blocks` blocks; returns how many were freed.
    pub fn evict_blocks(&self, num_blocks: usize, protected: &HashSet<SequenceId>) -> usize {
        let mut candidates = self.collect_candidates(protected);
        self.policy.order(&mut candidates);

        let mut evicted = 0;
        for candidate in candidates {
            if evicted >= num_blocks {
                break;
            }
            let resident = self.pager.resident_block_count(candidate.seq_id);
            if resident.saturating_sub(1) < self.config.min_blocks_per_sequence {
                continue;
            }
            if self.evict_one(&candidate) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            let mut stats = self.stats.lock().expect("eviction stats lock poisoned");
            stats.num_evictions += 1;
            stats.total_blocks_evicted += evicted as u64;
            debug!(evicted, policy = self.policy.name(), "evicted KV blocks");
        }
        evicted
    }

    /// All evictable (seq, block) pairs.
    ///
    /// A sequence in the active decoding set contributes nothing; this is
    /// what keeps an active request's tail block resident. Idle
    /// sequences are evictable in full, down to the per-sequence floor.
    fn collect_candidates(&self, protected: &HashSet<SequenceId>) -> Vec<Candidate> {
        let arena = self.pager.arena();
        let mut candidates = Vec::new();
        for seq_id in self.pager.sequence_ids() {
            if protected.contains(&seq_id) {
                continue;
            }
            let Some(seq) = self.pager.sequence(seq_id) else {
                continue;
            };
            let priority = self.policy.sequence_priority(seq_id);
            for (block_idx, &block_id) in seq.page_table().iter().enumerate() {
                if !seq.is_resident(block_idx) {
                    continue;
                }
                candidates.push(Candidate {
                    seq_id,
                    block_idx,
                    block_id,
                    last_access: arena.last_access(block_id),
                    priority,
                });
            }
        }
        candidates
    }

    /// Evict one block: persist if dirty, tombstone, release.
    ///
    /// A persistence failure is soft: the block stays resident and the
    /// caller moves on to the next victim.
    fn evict_one(&self, candidate: &Candidate) -> bool {
        let arena = self.pager.arena();
        if self.config.enable_persistence && arena.is_dirty(candidate.block_id) {
            if let Err(e) = self.persist_block(candidate.seq_id, candidate.block_idx) {
                warn!(
                    seq_id = candidate.seq_id,
                    block_idx = candidate.block_idx,
                    error = %e,
                    "persist failed; skipping victim"
                );
                return false;
            }
        }
        match self
            .pager
            .tombstone_entry(candidate.seq_id, candidate.block_idx)
        {
            Ok(block_id) => {
                arena.unref_block(block_id);
                true
            }
            Err(_) => false,
        }
    }

    fn block_path(&self, seq_id: SequenceId, block_idx: usize) -> PathBuf {
        self.config
            .persistence_dir
            .join(format!("seq-{seq_id}"))
            .join(format!("block-{block_idx}.bin"))
    }

    /// Write a block's K then V slabs as raw little-endian values at the
    /// arena dtype. No header; the size is implied by the arena config.
    pub fn persist_block(&self, seq_id: SequenceId, block_idx: usize) -> Result<()> {
        let arena = self.pager.arena();
        let block_id = self
            .pager
            .sequence(seq_id)
            .and_then(|s| s.page_table().get(block_idx).copied())
            .filter(|&id| id != TOMBSTONE_BLOCK)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id} block {block_idx}")))?;

        let (k, v) = arena.export_block(block_id)?;
        let dtype = arena.config().dtype;
        let path = self.block_path(seq_id, block_idx);
        let parent = path.parent().expect("block path has a parent");
        fs::create_dir_all(parent).map_err(|e| Error::Persistence(e.to_string()))?;

        let mut file = fs::File::create(&path).map_err(|e| Error::Persistence(e.to_string()))?;
        let mut written = 0u64;
        for slab in [&k, &v] {
            let bytes = encode_slab(slab, dtype);
            file.write_all(&bytes)
                .map_err(|e| Error::Persistence(e.to_string()))?;
            written += bytes.len() as u64;
        }

        arena.mark_clean(block_id);
        let mut stats = self.stats.lock().expect("eviction stats lock poisoned");
        stats.blocks_persisted += 1;
        stats.persistence_bytes += written;
        Ok(())
    }

    /// Restore a tombstoned block from disk into a freshly allocated
    /// block and re-install it in the page table.
    ///
    /// Refuses files whose length does not match the current arena
    /// geometry; spill files from a different configuration are invalid.
    pub fn restore_block(&self, seq_id: SequenceId, block_idx: usize) -> Result<BlockId> {
        let arena = self.pager.arena();
        let path = self.block_path(seq_id, block_idx);
        let expected = arena.config().block_bytes() as u64;

        let meta = fs::metadata(&path)
            .map_err(|e| Error::Persistence(format!("{}: {e}", path.display())))?;
        if meta.len() != expected {
            return Err(Error::Persistence(format!(
                "{}: size {} does not match arena geometry ({expected} bytes)",
                path.display(),
                meta.len()
            )));
        }

        let block_id = arena.allocate_block()?;
        let result = (|| -> Result<()> {
            let mut file =
                fs::File::open(&path).map_err(|e| Error::Persistence(e.to_string()))?;
            let mut bytes = Vec::with_capacity(expected as usize);
            file.read_to_end(&mut bytes)
                .map_err(|e| Error::Persistence(e.to_string()))?;

            let dtype = arena.config().dtype;
            let half = bytes.len() / 2;
            let k = decode_slab(&bytes[..half], dtype);
            let v = decode_slab(&bytes[half..], dtype);
            arena.import_block(block_id, &k, &v)?;
            self.pager.install_entry(seq_id, block_idx, block_id)
        })();

        match result {
            Ok(()) => {
                let mut stats = self.stats.lock().expect("eviction stats lock poisoned");
                stats.blocks_restored += 1;
                debug!(seq_id, block_idx, block_id, "restored block from disk");
                Ok(block_id)
            }
            Err(e) => {
                arena.free_block(block_id);
                Err(e)
            }
        }
    }

    /// Restore every tombstoned block covering positions `0..num_tokens`.
    /// The worker calls this before handing a page table to the model.
    pub fn ensure_resident(&self, seq_id: SequenceId, num_tokens: usize) -> Result<()> {
        let Some(seq) = self.pager.sequence(seq_id) else {
            return Ok(());
        };
        let block_size = self.pager.arena().config().block_size_tokens;
        let blocks_needed =
            ((num_tokens + block_size - 1) / block_size).min(seq.page_table().len());
        for block_idx in 0..blocks_needed {
            if !seq.is_resident(block_idx) {
                self.restore_block(seq_id, block_idx)?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> EvictionStats {
        self.stats.lock().expect("eviction stats lock poisoned").clone()
    }
}

fn encode_slab(slab: &[f32], dtype: KvDtype) -> Vec<u8> {
    match dtype {
        KvDtype::Float32 => slab.iter().flat_map(|f| f.to_le_bytes()).collect(),
        KvDtype::Float16 => slab
            .iter()
            .flat_map(|f| f32_to_f16_bits(*f).to_le_bytes())
            .collect(),
        KvDtype::BFloat16 => slab
            .iter()
            .flat_map(|f| ((f.to_bits() >> 16) as u16).to_le_bytes())
            .collect(),
    }
}

fn decode_slab(bytes: &[u8], dtype: KvDtype) -> Vec<f32> {
    match dtype {
        KvDtype::Float32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        KvDtype::Float16 => bytes
            .chunks_exact(2)
            .map(|c| f16_bits_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        KvDtype::BFloat16 => bytes
            .chunks_exact(2)
            .map(|c| f32::from_bits((u16::from_le_bytes([c[0], c[1]]) as u32) << 16))
            .collect(),
    }
}

/// IEEE 754 binary32 -> binary16, round-to-nearest-even.
fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x007f_ffff;

    if exp == 0xff {
        // Inf / NaN
        return sign | 0x7c00 | if mant != 0 { 0x0200 } else { 0 };
    }
    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00; // overflow -> inf
    }
    if half_exp <= 0 {
        if half_exp < -10 {
            return sign; // underflow -> zero
        }
        let mant = mant | 0x0080_0000;
        let shift = 14 - half_exp;
        let half_mant = mant >> shift;
        let round = (mant >> (shift - 1)) & 1;
        return sign | (half_mant as u16 + round as u16);
    }
    let half_mant = (mant >> 13) as u16;
    let round = ((mant >> 12) & 1) as u16;
    (sign | ((half_exp as u16) << 10) | half_mant).wrapping_add(round)
}

/// IEEE 754 binary16 -> binary32.
fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let mant = (bits & 0x03ff) as u32;

    let f32_bits = if exp == 0 {
        if mant == 0 {
            sign
        } else {
            // subnormal: normalize
            let mut exp = 127 - 15 + 1;
            let mut mant = mant;
            while mant & 0x0400 == 0 {
                mant <<= 1;
                exp -= 1;
            }
            sign | ((exp as u32) << 23) | ((mant & 0x03ff) << 13)
        }
    } else if exp == 0x1f {
        sign | 0x7f80_0000 | (mant << 13)
    } else {
        sign | ((exp + 127 - 15) << 23) | (mant << 13)
    };
    f32::from_bits(f32_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::arena::{Arena, ArenaConfig};
    use tempfile::TempDir;

    fn setup(num_blocks: usize, persistence_dir: Option<PathBuf>) -> (Arc<Pager>, EvictionManager) {
        let config = ArenaConfig {
            num_blocks,
            block_size_tokens: 4,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            dtype: KvDtype::Float32,
            allow_host_overflow: false,
            max_host_blocks: 0,
        };
        let pager = Arc::new(Pager::new(Arc::new(Arena::new(config))));
        let eviction_config = EvictionConfig {
            eviction_threshold: 0.5,
            target_usage: 0.25,
            enable_persistence: persistence_dir.is_some(),
            persistence_dir: persistence_dir.unwrap_or_else(|| PathBuf::from("/nonexistent")),
            min_blocks_per_sequence: 0,
        };
        let manager = EvictionManager::new(pager.clone(), eviction_config, Box::new(LruPolicy));
        (pager, manager)
    }

    #[test]
    fn lru_evicts_oldest_idle_block_first() {
        let (pager, manager) = setup(4, None);
        for seq in 1..=3u64 {
            pager.create_sequence(seq).unwrap();
            pager.grow_to(seq, 4).unwrap();
        }
        // Freshen sequences 2 and 3; sequence 1 stays oldest.
        pager.touch_sequence(2);
        pager.touch_sequence(3);

        let evicted = manager.evict_blocks(1, &HashSet::new());
        assert_eq!(evicted, 1);
        assert_eq!(pager.resident_block_count(1), 0);
        assert!(!pager.sequence(1).unwrap().is_resident(0));
        assert_eq!(pager.resident_block_count(2), 1);
        assert_eq!(pager.resident_block_count(3), 1);
    }

    #[test]
    fn active_sequences_are_protected() {
        let (pager, manager) = setup(4, None);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 4).unwrap();

        let protected: HashSet<SequenceId> = [1].into_iter().collect();
        assert_eq!(manager.evict_blocks(1, &protected), 0);
        assert_eq!(pager.resident_block_count(1), 1);
    }

    #[test]
    fn min_blocks_floor_is_respected() {
        let (pager, _) = setup(4, None);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 8).unwrap();

        let manager = EvictionManager::new(
            pager.clone(),
            EvictionConfig {
                min_blocks_per_sequence: 1,
                ..EvictionConfig::default()
            },
            Box::new(LruPolicy),
        );
        // Two resident blocks, floor of one: only one may go.
        let evicted = manager.evict_blocks(2, &HashSet::new());
        assert_eq!(evicted, 1);
        let seq = pager.sequence(1).unwrap();
        assert!(!seq.is_resident(0));
        assert!(seq.is_resident(1));
    }

    #[test]
    fn working_set_policy_prefers_low_priority() {
        let config = ArenaConfig {
            num_blocks: 4,
            block_size_tokens: 4,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 4,
            dtype: KvDtype::Float32,
            allow_host_overflow: false,
            max_host_blocks: 0,
        };
        let pager = Arc::new(Pager::new(Arc::new(Arena::new(config))));
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 4).unwrap();
        pager.create_sequence(2).unwrap();
        pager.grow_to(2, 4).unwrap();
        // Sequence 1 is older but higher priority.
        pager.touch_sequence(2);

        let policy = WorkingSetPolicy::new();
        policy.set_sequence_priority(1, 5);
        assert_eq!(policy.sequence_priority(1), 5);
        assert_eq!(policy.sequence_priority(2), 0);

        let mut candidates = vec![
            Candidate {
                seq_id: 1,
                block_idx: 0,
                block_id: pager.page_table(1).unwrap()[0],
                last_access: 1,
                priority: policy.sequence_priority(1),
            },
            Candidate {
                seq_id: 2,
                block_idx: 0,
                block_id: pager.page_table(2).unwrap()[0],
                last_access: 10,
                priority: policy.sequence_priority(2),
            },
        ];
        policy.order(&mut candidates);
        assert_eq!(candidates[0].seq_id, 2);
    }

    #[test]
    fn persist_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (pager, manager) = setup(4, Some(dir.path().to_path_buf()));
        pager.create_sequence(7).unwrap();
        pager.grow_to(7, 8).unwrap();

        // Write recognizable data into block 0.
        let table = pager.page_table(7).unwrap();
        let width = 2 * 4;
        {
            let mut view = pager.arena().block_views(&table[..1]).unwrap();
            view.write_token(1, 0, 3, &vec![9.0; width], &vec![11.0; width]);
        }

        assert_eq!(manager.evict_blocks(1, &HashSet::new()), 1);
        assert!(!pager.sequence(7).unwrap().is_resident(0));

        let restored = manager.restore_block(7, 0).unwrap();
        assert!(pager.sequence(7).unwrap().is_resident(0));
        let view = pager.arena().block_views(&[restored]).unwrap();
        assert_eq!(view.k_entry(1, 0, 3), vec![9.0; width].as_slice());
        assert_eq!(view.v_entry(1, 0, 3), vec![11.0; width].as_slice());

        let stats = manager.stats();
        assert_eq!(stats.blocks_persisted, 1);
        assert_eq!(stats.blocks_restored, 1);
    }

    #[test]
    fn restore_refuses_mismatched_geometry() {
        let dir = TempDir::new().unwrap();
        let (pager, manager) = setup(4, Some(dir.path().to_path_buf()));
        pager.create_sequence(7).unwrap();
        pager.grow_to(7, 8).unwrap();
        {
            let table = pager.page_table(7).unwrap();
            let width = 2 * 4;
            let mut view = pager.arena().block_views(&table[..1]).unwrap();
            view.write_token(0, 0, 0, &vec![1.0; width], &vec![1.0; width]);
        }
        assert_eq!(manager.evict_blocks(1, &HashSet::new()), 1);

        // Truncate the spill file to simulate a config change.
        let path = dir.path().join("seq-7").join("block-0.bin");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            manager.restore_block(7, 0),
            Err(Error::Persistence(_))
        ));
        assert!(!pager.sequence(7).unwrap().is_resident(0));
    }

    #[test]
    fn f16_conversion_roundtrips_exact_values() {
        for value in [0.0f32, 1.0, -2.5, 0.5, 1024.0, -0.125] {
            let bits = f32_to_f16_bits(value);
            assert_eq!(f16_bits_to_f32(bits), value);
        }
    }

    #[test]
    fn maybe_evict_reaches_target_usage() {
        let (pager, manager) = setup(4, None);
        // 3 of 4 blocks used (>= 0.5 threshold), target 0.25 => 1 block.
        for seq in 1..=3u64 {
            pager.create_sequence(seq).unwrap();
            pager.grow_to(seq, 4).unwrap();
        }
        let evicted = manager.maybe_evict(&HashSet::new());
        assert_eq!(evicted, 2);
        assert_eq!(pager.arena().stats().allocated_blocks, 1);
    }
}
