//! Model interface consumed by the worker loop.
//!
//! The transformer kernels live behind this trait; the engine core only
//! schedules forward passes and owns the KV storage they write into. A
//! forward call receives a transient [`KvView`] over the request's page
//! table and must write K and V for every position it processes at the
//! offsets implied by the position and block size. It must not retain
//! references past the call's return; the view's lifetime enforces this.

use super::arena::KvView;
use super::types::TokenId;
use crate::config::ModelSpec;
use crate::error::{Error, Result};

pub trait Model: Send {
    /// Model dimensions; the engine sizes the arena from these.
    fn spec(&self) -> &ModelSpec;

    /// Process `tokens` starting at `position_offset`, writing their KV
    /// entries into `kv`. Returns logits for the last position only.
    fn prefill(
        &mut self,
        tokens: &[TokenId],
        kv: &mut KvView<'_>,
        position_offset: usize,
    ) -> Result<Vec<f32>>;

    /// Process one token at `position` against the cached context.
    /// Returns logits for the next position.
    fn decode(
        &mut self,
        last_token: TokenId,
        kv: &mut KvView<'_>,
        position: usize,
    ) -> Result<Vec<f32>>;
}

/// Deterministic in-process model used as a correctness oracle.
///
/// Writes real KV entries through the paged view and derives its logits
/// from the context it reads *back out of the cache*, so any fault in
/// the page-table mapping, chunked prefill, preemption recompute, or
/// block restore shows up as a changed output token.
///
/// Encoding: position `p` stores K = p and V = token id, broadcast over
/// the entry. The logits peak at `weighted_sum(context) % vocab`.
pub struct ReferenceModel {
    spec: ModelSpec,
}

impl ReferenceModel {
    pub fn new(spec: ModelSpec) -> Self {
        Self { spec }
    }

    /// A small geometry suitable for unit tests.
    pub fn tiny(vocab_size: usize) -> Self {
        Self::new(ModelSpec {
            num_layers: 2,
            num_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            hidden_size: 8,
            vocab_size,
            max_seq_len: 4096,
            rope_base: 10000.0,
            norm_eps: 1e-6,
        })
    }

    fn write_position(&self, kv: &mut KvView<'_>, position: usize, token: TokenId) -> Result<()> {
        let block_size = kv.block_size();
        let (page_idx, slot) = (position / block_size, position % block_size);
        if page_idx >= kv.num_blocks() {
            return Err(Error::ModelFailure(format!(
                "position {position} beyond page table ({} blocks)",
                kv.num_blocks()
            )));
        }
        let width = kv.entry_width();
        let k = vec![position as f32; width];
        let v = vec![token as f32; width];
        for layer in 0..self.spec.num_layers {
            kv.write_token(layer, page_idx, slot, &k, &v);
        }
        Ok(())
    }

    /// Read the cached token ids for positions `0..len` back out of KV.
    fn read_context(&self, kv: &KvView<'_>, len: usize) -> Result<Vec<TokenId>> {
        let block_size = kv.block_size();
        let mut context = Vec::with_capacity(len);
        for pos in 0..len {
            let (page_idx, slot) = (pos / block_size, pos % block_size);
            if page_idx >= kv.num_blocks() {
                return Err(Error::ModelFailure(format!(
                    "position {pos} beyond page table ({} blocks)",
                    kv.num_blocks()
                )));
            }
            context.push(kv.v_entry(0, page_idx, slot)[0] as TokenId);
        }
        Ok(context)
    }

    fn logits_for(&self, context: &[TokenId]) -> Vec<f32> {
        let vocab = self.spec.vocab_size as u64;
        let mut acc: u64 = 0;
        for (pos, &token) in context.iter().enumerate() {
            acc = acc
                .wrapping_mul(31)
                .wrapping_add(token as u64 + pos as u64 + 1);
        }
        let peak = (acc % vocab) as i64;
        (0..self.spec.vocab_size as i64)
            .map(|i| -((i - peak).abs() as f32))
            .collect()
    }
}

impl Model for ReferenceModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prefill(
        &mut self,
        tokens: &[TokenId],
        kv: &mut KvView<'_>,
        position_offset: usize,
    ) -> Result<Vec<f32>> {
        for (i, &token) in tokens.iter().enumerate() {
            self.write_position(kv, position_offset + i, token)?;
        }
        let context = self.read_context(kv, position_offset + tokens.len())?;
        Ok(self.logits_for(&context))
    }

    fn decode(
        &mut self,
        last_token: TokenId,
        kv: &mut KvView<'_>,
        position: usize,
    ) -> Result<Vec<f32>> {
        self.write_position(kv, position, last_token)?;
        let context = self.read_context(kv, position + 1)?;
        Ok(self.logits_for(&context))
    }
}

/// A model that fails every forward call; exercises the batch failure path.
#[cfg(test)]
pub struct FailingModel {
    spec: ModelSpec,
}

#[cfg(test)]
impl FailingModel {
    pub fn new() -> Self {
        Self {
            spec: ReferenceModel::tiny(16).spec.clone(),
        }
    }
}

#[cfg(test)]
impl Model for FailingModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn prefill(&mut self, _: &[TokenId], _: &mut KvView<'_>, _: usize) -> Result<Vec<f32>> {
        Err(Error::ModelFailure("kernel dispatch failed".to_string()))
    }

    fn decode(&mut self, _: TokenId, _: &mut KvView<'_>, _: usize) -> Result<Vec<f32>> {
        Err(Error::ModelFailure("kernel dispatch failed".to_string()))
    }
}
