//! Token sampling strategies.
//!
//! The worker passes raw logits through a `Sampler` to pick each next
//! token. The default implementation applies repetition penalty,
//! temperature, top-k, and top-p (nucleus) filtering in that order;
//! temperature 0 is greedy argmax.

use rand::prelude::*;

use super::request::SamplingParams;
use super::types::TokenId;

/// Sampling policy over model logits. `context` is prompt + generated
/// tokens, used for the repetition penalty.
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32], context: &[TokenId], params: &SamplingParams) -> TokenId;
}

/// Default sampler: repetition penalty + temperature + top-k + top-p.
pub struct TopSampler {
    rng: StdRng,
}

impl TopSampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl Sampler for TopSampler {
    fn sample(&mut self, logits: &[f32], context: &[TokenId], params: &SamplingParams) -> TokenId {
        if logits.is_empty() {
            return 0;
        }

        let mut adjusted: Vec<f32> = logits.to_vec();
        if params.repetition_penalty != 1.0 {
            apply_repetition_penalty(&mut adjusted, context, params.repetition_penalty);
        }

        if params.temperature == 0.0 {
            return argmax(&adjusted) as TokenId;
        }

        let temp = params.temperature.max(1e-4);
        let mut pairs: Vec<(usize, f32)> = adjusted
            .iter()
            .enumerate()
            .map(|(i, &l)| (i, l / temp))
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut cutoff = pairs.len();
        if params.top_k > 0 {
            cutoff = cutoff.min(params.top_k);
        }
        pairs.truncate(cutoff);

        // Softmax over the surviving candidates, shifted for stability.
        let max_logit = pairs[0].1;
        let mut probs: Vec<(usize, f32)> = pairs
            .iter()
            .map(|&(i, l)| (i, (l - max_logit).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|p| p.1).sum();
        for p in &mut probs {
            p.1 /= sum.max(1e-9);
        }

        if params.top_p < 1.0 {
            let mut acc = 0.0_f32;
            let mut keep = 0;
            for &(_, p) in &probs {
                acc += p;
                keep += 1;
                if acc >= params.top_p {
                    break;
                }
            }
            probs.truncate(keep.max(1));
            let z: f32 = probs.iter().map(|p| p.1).sum();
            for p in &mut probs {
                p.1 /= z.max(1e-9);
            }
        }

        let r: f32 = self.rng.gen();
        let mut acc = 0.0_f32;
        for &(i, p) in &probs {
            acc += p;
            if r <= acc {
                return i as TokenId;
            }
        }
        probs[0].0 as TokenId
    }
}

/// Discourage tokens already present in the context: positive logits are
/// divided by the penalty, negative ones multiplied.
fn apply_repetition_penalty(logits: &mut [f32], context: &[TokenId], penalty: f32) {
    for &token in context {
        let idx = token as usize;
        if let Some(logit) = logits.get_mut(idx) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
