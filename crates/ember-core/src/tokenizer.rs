//! Text tokenization behind a narrow interface.
//!
//! The engine core is token-id based; text enters and leaves through
//! this trait at the API surface. The production implementation wraps a
//! HuggingFace `tokenizer.json` (or vocab + merges pair); a byte-level
//! tokenizer exists for tests and smoke runs without model assets.

use std::path::Path;

use tokenizers::models::bpe::BPE;
use tokenizers::Tokenizer as InnerTokenizer;
use tracing::{debug, info};

use crate::engine::types::TokenId;
use crate::error::{Error, Result};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;
    fn decode(&self, ids: &[TokenId]) -> Result<String>;
    fn eos_id(&self) -> Option<TokenId>;
    fn bos_id(&self) -> Option<TokenId>;
}

#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    pub bos_id: Option<TokenId>,
    pub eos_id: Option<TokenId>,
    pub pad_id: Option<TokenId>,
}

/// Tokenizer backed by the `tokenizers` crate.
pub struct HfTokenizer {
    inner: InnerTokenizer,
    special_tokens: SpecialTokens,
}

impl HfTokenizer {
    pub fn from_path(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        if tokenizer_path.exists() {
            return Self::from_tokenizer_json(&tokenizer_path);
        }

        let vocab_path = model_dir.join("vocab.json");
        let merges_path = model_dir.join("merges.txt");
        if vocab_path.exists() && merges_path.exists() {
            return Self::from_vocab_merges(&vocab_path, &merges_path);
        }

        Err(Error::Tokenization(format!(
            "no tokenizer found in {model_dir:?}"
        )))
    }

    fn from_tokenizer_json(path: &Path) -> Result<Self> {
        let inner =
            InnerTokenizer::from_file(path).map_err(|e| Error::Tokenization(e.to_string()))?;
        debug!("loaded tokenizer from {:?}", path);
        Ok(Self::with_inner(inner))
    }

    fn from_vocab_merges(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        info!("loading BPE tokenizer from vocab.json + merges.txt");
        let vocab_str = vocab_path
            .to_str()
            .ok_or_else(|| Error::Tokenization("invalid vocab path".to_string()))?;
        let merges_str = merges_path
            .to_str()
            .ok_or_else(|| Error::Tokenization("invalid merges path".to_string()))?;

        let bpe = BPE::from_file(vocab_str, merges_str)
            .build()
            .map_err(|e| Error::Tokenization(format!("BPE build failed: {e}")))?;
        Ok(Self::with_inner(InnerTokenizer::new(bpe)))
    }

    fn with_inner(inner: InnerTokenizer) -> Self {
        let special_tokens = SpecialTokens {
            bos_id: inner.token_to_id("<|begin_of_text|>").or_else(|| inner.token_to_id("<s>")),
            eos_id: inner.token_to_id("<|end_of_text|>").or_else(|| inner.token_to_id("</s>")),
            pad_id: inner.token_to_id("<pad>"),
        };
        Self {
            inner,
            special_tokens,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_id(&self) -> Option<TokenId> {
        self.special_tokens.eos_id
    }

    fn bos_id(&self) -> Option<TokenId> {
        self.special_tokens.bos_id
    }
}

/// Byte-level tokenizer: each UTF-8 byte is one token id. Used by tests
/// and asset-free smoke runs.
#[derive(Debug, Clone, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_id(&self) -> Option<TokenId> {
        None
    }

    fn bos_id(&self) -> Option<TokenId> {
        None
    }
}
