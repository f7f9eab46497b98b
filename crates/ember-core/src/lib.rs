//! Ember Core - on-device LLM serving runtime
//!
//! This crate provides the inference control plane for serving a single
//! resident language model across concurrent sessions: a paged KV-cache
//! arena with per-sequence page tables, a continuous-batching scheduler
//! with chunked prefill and preemption, and a worker loop that drives
//! model forward passes and streams sampled tokens back per request.
//!
//! # Architecture
//!
//! The engine follows vLLM's architecture patterns with:
//! - Paged KV-cache memory management with block-level refcounts
//! - Continuous batching over prefill and decode phases
//! - Priority-aware preemption and optional block eviction to disk
//! - Streaming output through per-request sinks
//!
//! # Example
//!
//! ```ignore
//! use ember_core::{Engine, EngineConfig, SamplingParams};
//!
//! let engine = Engine::new(model, EngineConfig::default())?;
//! let output = engine
//!     .generate("req-1".into(), prompt_tokens, SamplingParams::default(), 0)
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod tokenizer;

pub use config::{EngineConfig, ModelSpec, ServerConfig};
pub use engine::arena::{Arena, ArenaConfig, ArenaStats, BlockLocation, KvDtype, KvView};
pub use engine::eviction::{
    Candidate, EvictionConfig, EvictionManager, EvictionPolicy, EvictionStats, LruPolicy,
    WorkingSetPolicy,
};
pub use engine::model::{Model, ReferenceModel};
pub use engine::pager::{Pager, PagerStats, Sequence};
pub use engine::request::{
    FinishReason, RequestState, SamplingParams, TokenSink, TokenUpdate,
};
pub use engine::sampler::{Sampler, TopSampler};
pub use engine::scheduler::{
    Batch, CancelOutcome, RequestSnapshot, Scheduler, SchedulerConfig, SchedulerStats,
};
pub use engine::types::{BlockId, Priority, RequestId, SequenceId, TokenId, TOMBSTONE_BLOCK};
pub use engine::worker::{Worker, WorkerHandle};
pub use engine::{Engine, EngineStats, GenerationOutput};
pub use error::{Error, Result};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
