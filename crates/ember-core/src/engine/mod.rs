//! The inference control plane.
//!
//! Component wiring, leaves first: [`arena::Arena`] owns the paged KV
//! block pool, [`pager::Pager`] maps sequences onto it,
//! [`eviction::EvictionManager`] reclaims blocks under pressure,
//! [`scheduler::Scheduler`] admits requests and assembles continuous
//! batches, and [`worker::Worker`] drives the model. [`Engine`] ties the
//! pieces together behind the submit/cancel/stats surface.

pub mod arena;
pub mod eviction;
pub mod model;
pub mod pager;
pub mod request;
pub mod sampler;
pub mod scheduler;
pub mod types;
pub mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{Error, Result};

use arena::{Arena, ArenaConfig, ArenaStats};
use eviction::{EvictionConfig, EvictionManager, EvictionStats, LruPolicy, WorkingSetPolicy};
use model::Model;
use pager::Pager;
use request::{FinishReason, SamplingParams, TokenSink, TokenUpdate};
use sampler::TopSampler;
use scheduler::{CancelOutcome, RequestSnapshot, Scheduler, SchedulerConfig, SchedulerStats};
use types::{Priority, RequestId, TokenId};
use worker::{Worker, WorkerHandle};

/// Combined engine statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub scheduler: SchedulerStats,
    pub arena: ArenaStats,
    pub eviction: Option<EvictionStats>,
}

/// Result of a collected (non-streaming) generation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub token_ids: Vec<TokenId>,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

/// The serving engine: one resident model shared across concurrent
/// sessions, with tokens streamed back through per-request sinks.
pub struct Engine {
    scheduler: Arc<Scheduler>,
    eviction: Option<Arc<EvictionManager>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Engine {
    /// Build the control plane around a loaded model and start the
    /// worker thread.
    pub fn new(model: Box<dyn Model>, config: EngineConfig) -> Result<Self> {
        let spec = model.spec().clone();
        let arena_config = ArenaConfig::from_engine(&config, &spec)?;
        let arena = Arc::new(Arena::new(arena_config));
        let pager = Arc::new(Pager::new(arena));

        let eviction = if config.eviction_enabled {
            let policy: Box<dyn eviction::EvictionPolicy> = match config.eviction_policy.as_str() {
                "lru" => Box::new(LruPolicy),
                "working-set" => Box::new(WorkingSetPolicy::new()),
                other => {
                    return Err(Error::Config(format!("unknown eviction policy: {other}")));
                }
            };
            Some(Arc::new(EvictionManager::new(
                pager.clone(),
                EvictionConfig {
                    eviction_threshold: config.eviction_threshold,
                    target_usage: config.target_usage,
                    enable_persistence: config.persistence_enabled,
                    persistence_dir: config.persistence_dir.clone(),
                    min_blocks_per_sequence: config.min_blocks_per_sequence,
                },
                policy,
            )))
        } else {
            None
        };

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from(&config),
            pager,
            eviction.clone(),
        ));

        let worker = Worker::new(
            scheduler.clone(),
            eviction.clone(),
            model,
            Box::new(TopSampler::new(config.sampler_seed)),
            Duration::from_millis(config.worker_idle_ms),
        );
        let handle = worker.spawn();
        info!(
            vocab_size = spec.vocab_size,
            num_layers = spec.num_layers,
            "engine started"
        );

        Ok(Self {
            scheduler,
            eviction,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Submit a request with a caller-provided token sink.
    pub fn submit(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling: SamplingParams,
        priority: Priority,
        sink: TokenSink,
    ) -> Result<()> {
        self.scheduler
            .submit(request_id, prompt_tokens, sampling, priority, sink)
    }

    /// Submit a request and receive its token updates on a channel.
    pub fn submit_streaming(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling: SamplingParams,
        priority: Priority,
    ) -> Result<mpsc::UnboundedReceiver<TokenUpdate>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: TokenSink = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        self.submit(request_id, prompt_tokens, sampling, priority, sink)?;
        Ok(rx)
    }

    /// Submit and collect the full generation.
    pub async fn generate(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling: SamplingParams,
        priority: Priority,
    ) -> Result<GenerationOutput> {
        let mut rx =
            self.submit_streaming(request_id.clone(), prompt_tokens, sampling, priority)?;
        let mut token_ids = Vec::new();
        let mut error = None;
        while let Some(update) = rx.recv().await {
            match update {
                TokenUpdate::Token { token_id, finished } => {
                    token_ids.push(token_id);
                    if finished {
                        break;
                    }
                }
                TokenUpdate::Failed { message } => {
                    error = Some(message);
                    break;
                }
            }
        }
        let finish_reason = self
            .scheduler
            .snapshot(&request_id)
            .and_then(|s| s.finish_reason);
        Ok(GenerationOutput {
            token_ids,
            finish_reason,
            error,
        })
    }

    pub fn cancel(&self, request_id: &str) -> Result<CancelOutcome> {
        self.scheduler.cancel(request_id)
    }

    pub fn snapshot(&self, request_id: &str) -> Option<RequestSnapshot> {
        self.scheduler.snapshot(request_id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            scheduler: self.scheduler.stats(),
            arena: self.scheduler.pager().arena().stats(),
            eviction: self.eviction.as_ref().map(|e| e.stats()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stop accepting requests, cancel live ones, and join the worker.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(mut handle) = self.worker.lock().expect("worker lock poisoned").take() {
            handle.stop();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
