//! Page table management for KV cache sequences.
//!
//! Maps logical token positions of each sequence to physical arena
//! blocks. Handles growth as sequences extend, reference-counted block
//! sharing for forked sequences, and tombstone entries left behind by
//! the eviction manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::arena::Arena;
use super::types::{BlockId, SequenceId, TOMBSTONE_BLOCK};
use crate::error::{Error, Result};

/// A logical sequence and its page table.
///
/// Each page-table entry covers `block_size` contiguous token positions;
/// entry `i` holds positions `[i * B, (i + 1) * B)`.
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    block_size: usize,
    page_table: Vec<BlockId>,
    num_tokens: usize,
    last_access: u64,
    active: bool,
    parent_id: Option<SequenceId>,
}

impl Sequence {
    fn new(seq_id: SequenceId, block_size: usize) -> Self {
        Self {
            seq_id,
            block_size,
            page_table: Vec::new(),
            num_tokens: 0,
            last_access: 0,
            active: true,
            parent_id: None,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.seq_id
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn page_table(&self) -> &[BlockId] {
        &self.page_table
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn parent_id(&self) -> Option<SequenceId> {
        self.parent_id
    }

    /// Blocks required to cover the current token count.
    pub fn num_blocks_required(&self) -> usize {
        (self.num_tokens + self.block_size - 1) / self.block_size
    }

    /// The single source of truth for token -> (block_idx, offset).
    pub fn block_index_for_token(&self, pos: usize) -> (usize, usize) {
        (pos / self.block_size, pos % self.block_size)
    }

    pub fn block_id_for_token(&self, pos: usize) -> Option<BlockId> {
        self.page_table.get(pos / self.block_size).copied()
    }

    /// Page-table index of the tail block (position num_tokens - 1).
    pub fn tail_block_index(&self) -> Option<usize> {
        if self.num_tokens == 0 {
            None
        } else {
            Some((self.num_tokens - 1) / self.block_size)
        }
    }

    pub fn is_resident(&self, block_idx: usize) -> bool {
        self.page_table
            .get(block_idx)
            .is_some_and(|&id| id != TOMBSTONE_BLOCK)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PagerStats {
    pub num_sequences: usize,
    pub num_active_sequences: usize,
    pub total_tokens: usize,
    pub total_blocks_allocated: usize,
    pub num_forks: u64,
}

struct PagerState {
    sequences: HashMap<SequenceId, Sequence>,
    num_forks: u64,
}

/// Manages page tables for all live sequences against a shared arena.
pub struct Pager {
    arena: Arc<Arena>,
    state: Mutex<PagerState>,
}

impl Pager {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self {
            arena,
            state: Mutex::new(PagerState {
                sequences: HashMap::new(),
                num_forks: 0,
            }),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn create_sequence(&self, seq_id: SequenceId) -> Result<()> {
        let mut state = self.lock_state();
        if state.sequences.contains_key(&seq_id) {
            return Err(Error::DuplicateId(format!("sequence {seq_id}")));
        }
        let block_size = self.arena.config().block_size_tokens;
        state.sequences.insert(seq_id, Sequence::new(seq_id, block_size));
        Ok(())
    }

    /// Delete a sequence, releasing every resident block reference.
    pub fn delete_sequence(&self, seq_id: SequenceId) {
        let mut state = self.lock_state();
        if let Some(seq) = state.sequences.remove(&seq_id) {
            debug!(seq_id, blocks = seq.page_table.len(), "deleting sequence");
            for block_id in seq.page_table {
                if block_id != TOMBSTONE_BLOCK {
                    self.arena.unref_block(block_id);
                }
            }
        }
    }

    /// Grow a sequence's page table to cover `target_tokens` positions.
    ///
    /// Block allocation is all-or-nothing; on NoCapacity the page table
    /// is unchanged. Shrinking is not supported; a target at or below the
    /// current token count is a no-op.
    pub fn grow_to(&self, seq_id: SequenceId, target_tokens: usize) -> Result<()> {
        let mut state = self.lock_state();
        let seq = state
            .sequences
            .get_mut(&seq_id)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))?;

        if target_tokens <= seq.num_tokens {
            return Ok(());
        }

        let blocks_required = (target_tokens + seq.block_size - 1) / seq.block_size;
        let needed = blocks_required.saturating_sub(seq.page_table.len());
        if needed > 0 {
            let new_blocks = self.arena.allocate_blocks(needed)?;
            seq.page_table.extend(new_blocks);
        }
        seq.num_tokens = target_tokens;
        Ok(())
    }

    /// Fork `parent` into `child`: the child shares the parent's blocks
    /// by reference count. No content is copied; new tail blocks appended
    /// after the fork are never shared.
    pub fn fork(&self, parent: SequenceId, child: SequenceId) -> Result<()> {
        let mut state = self.lock_state();
        if state.sequences.contains_key(&child) {
            return Err(Error::DuplicateId(format!("sequence {child}")));
        }
        let parent_seq = state
            .sequences
            .get(&parent)
            .ok_or_else(|| Error::NotFound(format!("sequence {parent}")))?
            .clone();

        for &block_id in &parent_seq.page_table {
            if block_id != TOMBSTONE_BLOCK {
                self.arena.ref_block(block_id);
            }
        }

        let mut child_seq = parent_seq;
        child_seq.seq_id = child;
        child_seq.parent_id = Some(parent);
        state.sequences.insert(child, child_seq);
        state.num_forks += 1;
        debug!(parent, child, "forked sequence");
        Ok(())
    }

    /// Release every block of a sequence but keep the (empty) sequence
    /// record. Used when a request is preempted: its KV is reclaimed and
    /// will be recomputed on resume.
    pub fn release_blocks(&self, seq_id: SequenceId) {
        let mut state = self.lock_state();
        if let Some(seq) = state.sequences.get_mut(&seq_id) {
            for block_id in seq.page_table.drain(..) {
                if block_id != TOMBSTONE_BLOCK {
                    self.arena.unref_block(block_id);
                }
            }
            seq.num_tokens = 0;
        }
    }

    pub fn block_id_for_token(&self, seq_id: SequenceId, pos: usize) -> Result<BlockId> {
        let state = self.lock_state();
        let seq = state
            .sequences
            .get(&seq_id)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))?;
        seq.block_id_for_token(pos)
            .ok_or_else(|| Error::NotFound(format!("token {pos} of sequence {seq_id}")))
    }

    pub fn page_table(&self, seq_id: SequenceId) -> Result<Vec<BlockId>> {
        let state = self.lock_state();
        let seq = state
            .sequences
            .get(&seq_id)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))?;
        Ok(seq.page_table.clone())
    }

    pub fn num_tokens(&self, seq_id: SequenceId) -> Result<usize> {
        let state = self.lock_state();
        state
            .sequences
            .get(&seq_id)
            .map(|s| s.num_tokens)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))
    }

    /// Touch every resident block of a sequence for LRU purposes.
    pub fn touch_sequence(&self, seq_id: SequenceId) {
        let state = self.lock_state();
        if let Some(seq) = state.sequences.get(&seq_id) {
            for &block_id in &seq.page_table {
                if block_id != TOMBSTONE_BLOCK {
                    self.arena.touch(block_id);
                }
            }
        }
    }

    pub fn mark_finished(&self, seq_id: SequenceId) {
        let mut state = self.lock_state();
        if let Some(seq) = state.sequences.get_mut(&seq_id) {
            seq.active = false;
        }
    }

    pub fn num_sequences(&self) -> usize {
        self.lock_state().sequences.len()
    }

    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        self.lock_state().sequences.keys().copied().collect()
    }

    /// Snapshot of one sequence's bookkeeping (for eviction and tests).
    pub fn sequence(&self, seq_id: SequenceId) -> Option<Sequence> {
        self.lock_state().sequences.get(&seq_id).cloned()
    }

    /// Resident (non-tombstone) blocks held by a sequence.
    pub fn resident_block_count(&self, seq_id: SequenceId) -> usize {
        self.lock_state()
            .sequences
            .get(&seq_id)
            .map(|s| {
                s.page_table
                    .iter()
                    .filter(|&&id| id != TOMBSTONE_BLOCK)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Replace a page-table entry with the tombstone sentinel, returning
    /// the physical block that was resident there.
    pub fn tombstone_entry(&self, seq_id: SequenceId, block_idx: usize) -> Result<BlockId> {
        let mut state = self.lock_state();
        let seq = state
            .sequences
            .get_mut(&seq_id)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))?;
        let entry = seq
            .page_table
            .get_mut(block_idx)
            .ok_or_else(|| Error::NotFound(format!("block index {block_idx}")))?;
        if *entry == TOMBSTONE_BLOCK {
            return Err(Error::NotFound(format!(
                "block index {block_idx} already evicted"
            )));
        }
        Ok(std::mem::replace(entry, TOMBSTONE_BLOCK))
    }

    /// Install a restored physical block over a tombstone entry.
    pub fn install_entry(
        &self,
        seq_id: SequenceId,
        block_idx: usize,
        block_id: BlockId,
    ) -> Result<()> {
        let mut state = self.lock_state();
        let seq = state
            .sequences
            .get_mut(&seq_id)
            .ok_or_else(|| Error::NotFound(format!("sequence {seq_id}")))?;
        let entry = seq
            .page_table
            .get_mut(block_idx)
            .ok_or_else(|| Error::NotFound(format!("block index {block_idx}")))?;
        if *entry != TOMBSTONE_BLOCK {
            return Err(Error::DuplicateId(format!(
                "block index {block_idx} is resident"
            )));
        }
        *entry = block_id;
        Ok(())
    }

    /// Remove every sequence and release all blocks.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        for (_, seq) in state.sequences.drain() {
            for block_id in seq.page_table {
                if block_id != TOMBSTONE_BLOCK {
                    self.arena.unref_block(block_id);
                }
            }
        }
    }

    pub fn stats(&self) -> PagerStats {
        let state = self.lock_state();
        let mut total_tokens = 0;
        let mut total_blocks = 0;
        let mut active = 0;
        for seq in state.sequences.values() {
            total_tokens += seq.num_tokens;
            total_blocks += seq
                .page_table
                .iter()
                .filter(|&&id| id != TOMBSTONE_BLOCK)
                .count();
            if seq.active {
                active += 1;
            }
        }
        PagerStats {
            num_sequences: state.sequences.len(),
            num_active_sequences: active,
            total_tokens,
            total_blocks_allocated: total_blocks,
            num_forks: state.num_forks,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PagerState> {
        self.state.lock().expect("pager lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::arena::{ArenaConfig, KvDtype};

    fn small_pager(num_blocks: usize) -> Pager {
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
        Pager::new(Arc::new(Arena::new(config)))
    }

    #[test]
    fn create_grow_delete_restores_accounting() {
        let pager = small_pager(8);
        let before = pager.arena().stats().free_device_blocks;

        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 6).unwrap();
        assert_eq!(pager.page_table(1).unwrap().len(), 2);
        assert_eq!(pager.num_tokens(1).unwrap(), 6);
        assert_eq!(pager.arena().stats().free_device_blocks, before - 2);

        pager.delete_sequence(1);
        assert_eq!(pager.arena().stats().free_device_blocks, before);
    }

    #[test]
    fn duplicate_sequence_rejected() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        assert!(matches!(
            pager.create_sequence(1),
            Err(Error::DuplicateId(_))
        ));
    }

    #[test]
    fn grow_is_all_or_nothing() {
        let pager = small_pager(2);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 4).unwrap();

        // Needs 2 more blocks but only 1 is free.
        let err = pager.grow_to(1, 12);
        assert!(matches!(err, Err(Error::NoCapacity(_))));
        assert_eq!(pager.page_table(1).unwrap().len(), 1);
        assert_eq!(pager.num_tokens(1).unwrap(), 4);
        assert_eq!(pager.arena().free_device_blocks(), 1);
    }

    #[test]
    fn token_to_block_mapping() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 10).unwrap();
        let table = pager.page_table(1).unwrap();

        assert_eq!(pager.block_id_for_token(1, 0).unwrap(), table[0]);
        assert_eq!(pager.block_id_for_token(1, 3).unwrap(), table[0]);
        assert_eq!(pager.block_id_for_token(1, 4).unwrap(), table[1]);
        assert_eq!(pager.block_id_for_token(1, 9).unwrap(), table[2]);

        let seq = pager.sequence(1).unwrap();
        assert_eq!(seq.block_index_for_token(5), (1, 1));
        assert_eq!(seq.num_blocks_required(), 3);
        assert_eq!(seq.tail_block_index(), Some(2));
    }

    #[test]
    fn clear_releases_every_sequence() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.create_sequence(2).unwrap();
        pager.grow_to(1, 8).unwrap();
        pager.grow_to(2, 4).unwrap();
        assert_eq!(pager.num_sequences(), 2);

        pager.clear();
        assert_eq!(pager.num_sequences(), 0);
        assert_eq!(pager.arena().free_device_blocks(), 8);
    }

    #[test]
    fn fork_shares_blocks_by_refcount() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 6).unwrap();
        let table = pager.page_table(1).unwrap();

        pager.fork(1, 2).unwrap();
        assert_eq!(pager.page_table(2).unwrap(), table);
        for &id in &table {
            assert_eq!(pager.arena().ref_count(id), 2);
        }

        pager.delete_sequence(1);
        for &id in &table {
            assert_eq!(pager.arena().ref_count(id), 1);
        }
        pager.delete_sequence(2);
        assert_eq!(pager.arena().free_device_blocks(), 8);
    }

    #[test]
    fn fork_requires_live_parent_and_fresh_child() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        assert!(matches!(pager.fork(7, 2), Err(Error::NotFound(_))));
        assert!(matches!(pager.fork(1, 1), Err(Error::DuplicateId(_))));
    }

    #[test]
    fn release_blocks_keeps_sequence_record() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 8).unwrap();

        pager.release_blocks(1);
        assert_eq!(pager.page_table(1).unwrap().len(), 0);
        assert_eq!(pager.num_tokens(1).unwrap(), 0);
        assert_eq!(pager.arena().free_device_blocks(), 8);

        // Sequence can grow again afterwards.
        pager.grow_to(1, 4).unwrap();
        assert_eq!(pager.page_table(1).unwrap().len(), 1);
    }

    #[test]
    fn finished_sequences_leave_the_active_count() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.create_sequence(2).unwrap();
        pager.grow_to(1, 4).unwrap();
        pager.grow_to(2, 4).unwrap();

        pager.mark_finished(1);
        let stats = pager.stats();
        assert_eq!(stats.num_sequences, 2);
        assert_eq!(stats.num_active_sequences, 1);
        assert!(!pager.sequence(1).unwrap().is_active());
        assert_eq!(stats.total_tokens, 8);
        assert_eq!(stats.total_blocks_allocated, 2);
    }

    #[test]
    fn tombstone_and_install_roundtrip() {
        let pager = small_pager(8);
        pager.create_sequence(1).unwrap();
        pager.grow_to(1, 8).unwrap();

        let victim = pager.tombstone_entry(1, 0).unwrap();
        assert!(!pager.sequence(1).unwrap().is_resident(0));
        assert_eq!(pager.resident_block_count(1), 1);
        pager.arena().unref_block(victim);

        let fresh = pager.arena().allocate_block().unwrap();
        pager.install_entry(1, 0, fresh).unwrap();
        assert!(pager.sequence(1).unwrap().is_resident(0));
        assert_eq!(pager.page_table(1).unwrap()[0], fresh);
    }
}
