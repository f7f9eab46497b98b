//! Configuration types for the Ember inference engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of KV cache blocks to pre-allocate
    #[serde(default = "default_kv_num_blocks")]
    pub kv_num_blocks: usize,

    /// Tokens per KV cache block
    #[serde(default = "default_kv_block_size")]
    pub kv_block_size: usize,

    /// Data type for KV cache storage accounting
    #[serde(default = "default_kv_dtype")]
    pub kv_dtype: String,

    /// Allow blocks to overflow to host memory
    #[serde(default = "default_allow_host_overflow")]
    pub allow_host_overflow: bool,

    /// Maximum blocks resident on host before eviction is required
    #[serde(default = "default_max_host_blocks")]
    pub max_host_blocks: usize,

    /// Maximum tokens (prefill + decode) per scheduler step
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    /// Maximum requests per scheduler step
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum prefill tokens per scheduler step
    #[serde(default = "default_max_prefill_tokens")]
    pub max_prefill_tokens: usize,

    /// Chunk size for splitting long prompts across steps
    #[serde(default = "default_max_prefill_chunk")]
    pub max_prefill_chunk: usize,

    /// Enable chunked prefill
    #[serde(default = "default_true")]
    pub chunked_prefill_enabled: bool,

    /// Weight biasing batch assembly toward decode over prefill
    #[serde(default = "default_decode_preference")]
    pub decode_preference: f32,

    /// Enable preemption of running decoders under memory pressure
    #[serde(default = "default_true")]
    pub preemption_enabled: bool,

    /// Tokens a decoder must have produced before it may be preempted
    #[serde(default = "default_min_decode_steps")]
    pub min_decode_steps_before_preempt: usize,

    /// Use request priority to break scheduling ties
    #[serde(default = "default_true")]
    pub priority_enabled: bool,

    /// Enable the eviction manager
    #[serde(default)]
    pub eviction_enabled: bool,

    /// Eviction policy: "lru" or "working-set"
    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: String,

    /// Fraction of used device blocks that triggers eviction
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: f32,

    /// Target usage fraction after eviction
    #[serde(default = "default_target_usage")]
    pub target_usage: f32,

    /// Persist evicted blocks to disk
    #[serde(default)]
    pub persistence_enabled: bool,

    /// Directory for persisted blocks
    #[serde(default = "default_persistence_dir")]
    pub persistence_dir: PathBuf,

    /// Minimum resident blocks to keep per sequence during eviction
    #[serde(default = "default_min_blocks_per_sequence")]
    pub min_blocks_per_sequence: usize,

    /// Worker idle back-off when the scheduler has no work, in milliseconds
    #[serde(default = "default_worker_idle_ms")]
    pub worker_idle_ms: u64,

    /// Seed for the sampler RNG (None draws from entropy)
    #[serde(default)]
    pub sampler_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kv_num_blocks: default_kv_num_blocks(),
            kv_block_size: default_kv_block_size(),
            kv_dtype: default_kv_dtype(),
            allow_host_overflow: default_allow_host_overflow(),
            max_host_blocks: default_max_host_blocks(),
            max_batch_tokens: default_max_batch_tokens(),
            max_batch_size: default_max_batch_size(),
            max_prefill_tokens: default_max_prefill_tokens(),
            max_prefill_chunk: default_max_prefill_chunk(),
            chunked_prefill_enabled: default_true(),
            decode_preference: default_decode_preference(),
            preemption_enabled: default_true(),
            min_decode_steps_before_preempt: default_min_decode_steps(),
            priority_enabled: default_true(),
            eviction_enabled: false,
            eviction_policy: default_eviction_policy(),
            eviction_threshold: default_eviction_threshold(),
            target_usage: default_target_usage(),
            persistence_enabled: false,
            persistence_dir: default_persistence_dir(),
            min_blocks_per_sequence: default_min_blocks_per_sequence(),
            worker_idle_ms: default_worker_idle_ms(),
            sampler_seed: None,
        }
    }
}

fn default_kv_num_blocks() -> usize {
    1024
}

fn default_kv_block_size() -> usize {
    32
}

fn default_kv_dtype() -> String {
    "float16".to_string()
}

fn default_allow_host_overflow() -> bool {
    true
}

fn default_max_host_blocks() -> usize {
    256
}

fn default_max_batch_tokens() -> usize {
    8192
}

fn default_max_batch_size() -> usize {
    128
}

fn default_max_prefill_tokens() -> usize {
    4096
}

fn default_max_prefill_chunk() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

fn default_decode_preference() -> f32 {
    2.0
}

fn default_min_decode_steps() -> usize {
    10
}

fn default_eviction_policy() -> String {
    "lru".to_string()
}

fn default_eviction_threshold() -> f32 {
    0.9
}

fn default_target_usage() -> f32 {
    0.7
}

fn default_persistence_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ember")
        .join("kv-cache")
}

fn default_min_blocks_per_sequence() -> usize {
    1
}

fn default_worker_idle_ms() -> u64 {
    1
}

/// Model dimensions reported by a loaded model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_base: f64,
    pub norm_eps: f64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            num_layers: 28,
            num_heads: 12,
            num_kv_heads: 2,
            head_dim: 128,
            hidden_size: 1536,
            vocab_size: 152064,
            max_seq_len: 32768,
            rope_base: 1000000.0,
            norm_eps: 1e-6,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_true(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}
