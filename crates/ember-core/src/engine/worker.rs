//! Worker loop: drives model forward passes for scheduled batches.
//!
//! A single driver thread owns the model (and with it the accelerator
//! stream). It repeatedly pulls a batch from the scheduler, runs decode
//! entries then prefill entries, passes logits through the sampler, and
//! feeds produced tokens back through the scheduler to each request's
//! sink. Per-request KV bookkeeping (sequence id + cached token count)
//! lives here, keyed by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::eviction::EvictionManager;
use super::model::Model;
use super::pager::Pager;
use super::sampler::Sampler;
use super::scheduler::{Batch, DecodeEntry, PrefillEntry, Scheduler};
use super::types::{RequestId, SequenceId};
use crate::error::{Error, Result};

/// Per-request KV bookkeeping.
struct KvState {
    seq_id: SequenceId,
    /// Token positions whose KV entries have been written
    cached_tokens: usize,
}

/// Handle to a running worker thread; stopping joins the thread.
pub struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The batch execution engine.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    pager: Arc<Pager>,
    eviction: Option<Arc<EvictionManager>>,
    model: Box<dyn Model>,
    sampler: Box<dyn Sampler>,
    idle_backoff: Duration,
    kv_states: HashMap<RequestId, KvState>,
}

impl Worker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        eviction: Option<Arc<EvictionManager>>,
        model: Box<dyn Model>,
        sampler: Box<dyn Sampler>,
        idle_backoff: Duration,
    ) -> Self {
        let pager = scheduler.pager().clone();
        Self {
            scheduler,
            pager,
            eviction,
            model,
            sampler,
            idle_backoff,
            kv_states: HashMap::new(),
        }
    }

    /// Start the worker on its own thread.
    pub fn spawn(self) -> WorkerHandle {
        let should_stop = Arc::new(AtomicBool::new(false));
        let flag = should_stop.clone();
        let thread = thread::Builder::new()
            .name("ember-worker".to_string())
            .spawn(move || self.run(flag))
            .expect("failed to spawn worker thread");
        WorkerHandle {
            thread: Some(thread),
            should_stop,
        }
    }

    fn run(mut self, should_stop: Arc<AtomicBool>) {
        info!("worker loop started");
        while !should_stop.load(Ordering::Acquire) {
            if !self.step() {
                thread::sleep(self.idle_backoff);
            }
        }
        info!("worker loop stopped");
    }

    /// Execute one scheduler step. Returns false when there was no work.
    pub fn step(&mut self) -> bool {
        let batch = self.scheduler.next_batch();
        if batch.is_empty() {
            return false;
        }
        debug!(
            step = batch.step,
            decodes = batch.decode.len(),
            prefills = batch.prefill.len(),
            tokens = batch.total_tokens(),
            "executing batch"
        );
        self.execute_batch(&batch);
        self.scheduler.complete_batch(&batch);
        self.prune_states();
        true
    }

    /// Decode entries run before prefill entries; within each group the
    /// scheduler's emitted order is preserved.
    fn execute_batch(&mut self, batch: &Batch) {
        for entry in &batch.decode {
            match self.execute_decode(entry) {
                Ok(()) => {}
                Err(Error::NoCapacity(_)) => {
                    self.scheduler.pause_for_capacity(&entry.request_id);
                    self.kv_states.remove(&entry.request_id);
                }
                Err(e) => {
                    self.fail_batch(batch, &e);
                    return;
                }
            }
        }
        for entry in &batch.prefill {
            match self.execute_prefill(entry) {
                Ok(()) => {}
                Err(Error::NoCapacity(_)) => {
                    self.scheduler.pause_for_capacity(&entry.request_id);
                    self.kv_states.remove(&entry.request_id);
                }
                Err(e) => {
                    self.fail_batch(batch, &e);
                    return;
                }
            }
        }
    }

    fn execute_prefill(&mut self, entry: &PrefillEntry) -> Result<()> {
        // Cancellation may race batch execution; skip and drop state.
        if !self.scheduler.is_live(&entry.request_id) {
            self.kv_states.remove(&entry.request_id);
            return Ok(());
        }

        let target = entry.position_offset + entry.tokens.len();
        if let Some(eviction) = &self.eviction {
            eviction.ensure_resident(entry.seq_id, target)?;
        }
        self.pager.grow_to(entry.seq_id, target)?;

        let logits = {
            let table = self.pager.page_table(entry.seq_id)?;
            let arena = self.pager.arena();
            let mut kv = arena.block_views(&table)?;
            self.model
                .prefill(&entry.tokens, &mut kv, entry.position_offset)?
        };

        let state = self
            .kv_states
            .entry(entry.request_id.clone())
            .or_insert(KvState {
                seq_id: entry.seq_id,
                cached_tokens: entry.position_offset,
            });
        state.cached_tokens = target;

        if entry.completes_prompt {
            // A resumed request already has output; its last generated
            // token replays through the decode path instead.
            let fresh = self
                .scheduler
                .snapshot(&entry.request_id)
                .map(|s| s.generated.is_empty())
                .unwrap_or(false);
            if fresh {
                if let Some((context, params)) = self.scheduler.sampling_inputs(&entry.request_id) {
                    let token = self.sampler.sample(&logits, &context, &params);
                    if let Some((sink, update)) =
                        self.scheduler.append_token(&entry.request_id, token)
                    {
                        sink(update);
                    }
                }
            }
        }
        self.scheduler.finish_prefill_chunk(
            &entry.request_id,
            entry.tokens.len(),
            entry.completes_prompt,
        );
        self.pager.touch_sequence(entry.seq_id);
        Ok(())
    }

    fn execute_decode(&mut self, entry: &DecodeEntry) -> Result<()> {
        if !self.scheduler.is_live(&entry.request_id) {
            self.kv_states.remove(&entry.request_id);
            return Ok(());
        }
        let position = match self.kv_states.get(&entry.request_id) {
            Some(state) => state.cached_tokens,
            None => {
                return Err(Error::ModelFailure(format!(
                    "no KV state for decoding request {}",
                    entry.request_id
                )));
            }
        };

        if let Some(eviction) = &self.eviction {
            eviction.ensure_resident(entry.seq_id, position + 1)?;
        }
        self.pager.grow_to(entry.seq_id, position + 1)?;

        let logits = {
            let table = self.pager.page_table(entry.seq_id)?;
            let arena = self.pager.arena();
            let mut kv = arena.block_views(&table)?;
            self.model.decode(entry.last_token, &mut kv, position)?
        };

        if let Some(state) = self.kv_states.get_mut(&entry.request_id) {
            state.cached_tokens = position + 1;
        }

        if let Some((context, params)) = self.scheduler.sampling_inputs(&entry.request_id) {
            let token = self.sampler.sample(&logits, &context, &params);
            if let Some((sink, update)) = self.scheduler.append_token(&entry.request_id, token) {
                sink(update);
            }
        }
        self.pager.touch_sequence(entry.seq_id);
        Ok(())
    }

    /// A model error is attributed to every request in the batch.
    fn fail_batch(&mut self, batch: &Batch, error: &Error) {
        warn!(error = %error, "model call failed; failing batch");
        let deliveries = self.scheduler.fail_batch(batch, &error.to_string());
        for (sink, update) in deliveries {
            sink(update);
        }
        for id in batch.request_ids() {
            self.kv_states.remove(&id);
        }
    }

    fn prune_states(&mut self) {
        let scheduler = &self.scheduler;
        self.kv_states.retain(|id, _| scheduler.is_live(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use crate::engine::arena::{Arena, ArenaConfig, KvDtype};
    use crate::engine::model::{FailingModel, ReferenceModel};
    use crate::engine::request::{
        FinishReason, RequestState, SamplingParams, TokenSink, TokenUpdate,
    };
    use crate::engine::sampler::TopSampler;
    use crate::engine::scheduler::SchedulerConfig;
    use std::sync::mpsc;

    fn test_setup(
        num_blocks: usize,
        scheduler_config: SchedulerConfig,
        model: Box<dyn Model>,
    ) -> (Arc<Scheduler>, Worker) {
        let spec = model.spec().clone();
        let arena_config = ArenaConfig {
            num_blocks,
            block_size_tokens: 4,
            num_layers: spec.num_layers,
            num_kv_heads: spec.num_kv_heads,
            head_dim: spec.head_dim,
            dtype: KvDtype::Float32,
            allow_host_overflow: false,
            max_host_blocks: 0,
        };
        let pager = Arc::new(Pager::new(Arc::new(Arena::new(arena_config))));
        let scheduler = Arc::new(Scheduler::new(scheduler_config, pager, None));
        let worker = Worker::new(
            scheduler.clone(),
            None,
            model,
            Box::new(TopSampler::new(Some(0))),
            Duration::from_millis(1),
        );
        (scheduler, worker)
    }

    fn channel_sink() -> (TokenSink, mpsc::Receiver<TokenUpdate>) {
        let (tx, rx) = mpsc::channel();
        let sink: TokenSink = Arc::new(move |update| {
            let _ = tx.send(update);
        });
        (sink, rx)
    }

    fn greedy(max_tokens: usize) -> SamplingParams {
        SamplingParams {
            temperature: 0.0,
            repetition_penalty: 1.0,
            max_tokens,
            ..Default::default()
        }
    }

    #[test]
    fn single_request_runs_to_completion() {
        let model = Box::new(ReferenceModel::tiny(64));
        let config = SchedulerConfig {
            max_batch_tokens: 8,
            ..SchedulerConfig::default()
        };
        let (scheduler, mut worker) = test_setup(4, config, model);
        let (sink, rx) = channel_sink();

        scheduler
            .submit("r1".into(), vec![10, 11, 12], greedy(2), 0, sink)
            .unwrap();

        assert!(worker.step()); // prefill + first token
        assert_eq!(scheduler.pager().arena().stats().allocated_blocks, 1);
        assert!(worker.step()); // decode + second token (finished)
        assert!(!worker.step()); // reap only; no work left

        let updates: Vec<TokenUpdate> = rx.try_iter().collect();
        assert_eq!(updates.len(), 2);
        assert!(matches!(
            updates[0],
            TokenUpdate::Token {
                finished: false,
                ..
            }
        ));
        assert!(matches!(updates[1], TokenUpdate::Token { finished: true, .. }));

        let snapshot = scheduler.snapshot("r1").unwrap();
        assert_eq!(snapshot.state, RequestState::Completed);
        assert_eq!(snapshot.finish_reason, Some(FinishReason::Length));
        assert_eq!(scheduler.pager().arena().stats().allocated_blocks, 0);
    }

    #[test]
    fn greedy_generation_is_deterministic() {
        let run = || {
            let model = Box::new(ReferenceModel::tiny(64));
            let (scheduler, mut worker) = test_setup(8, SchedulerConfig::default(), model);
            let (sink, rx) = channel_sink();
            scheduler
                .submit("r1".into(), vec![3, 1, 4, 1, 5], greedy(6), 0, sink)
                .unwrap();
            while worker.step() {}
            rx.try_iter()
                .filter_map(|u| match u {
                    TokenUpdate::Token { token_id, .. } => Some(token_id),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        assert_eq!(first.len(), 6);
        assert_eq!(first, second);
    }

    #[test]
    fn chunked_prefill_matches_unchunked_output() {
        let generate = |chunk: usize| {
            let model = Box::new(ReferenceModel::tiny(64));
            let config = SchedulerConfig {
                max_prefill_chunk: chunk,
                chunked_prefill_enabled: true,
                ..SchedulerConfig::default()
            };
            let (scheduler, mut worker) = test_setup(8, config, model);
            let (sink, rx) = channel_sink();
            scheduler
                .submit("r1".into(), (1..=10).collect(), greedy(4), 0, sink)
                .unwrap();
            while worker.step() {}
            rx.try_iter()
                .filter_map(|u| match u {
                    TokenUpdate::Token { token_id, .. } => Some(token_id),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(generate(3), generate(2048));
    }

    #[test]
    fn stop_token_on_first_sample_completes_with_stop() {
        // The reference model's first token for this prompt is
        // deterministic; make exactly that token the stop token.
        let probe = {
            let model = Box::new(ReferenceModel::tiny(64));
            let (scheduler, mut worker) = test_setup(4, SchedulerConfig::default(), model);
            let (sink, rx) = channel_sink();
            scheduler
                .submit("probe".into(), vec![7, 8, 9], greedy(1), 0, sink)
                .unwrap();
            while worker.step() {}
            match rx.try_iter().next().unwrap() {
                TokenUpdate::Token { token_id, .. } => token_id,
                other => panic!("unexpected update: {other:?}"),
            }
        };

        let model = Box::new(ReferenceModel::tiny(64));
        let (scheduler, mut worker) = test_setup(4, SchedulerConfig::default(), model);
        let (sink, rx) = channel_sink();
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: 1.0,
            max_tokens: 1,
            stop_token_ids: vec![probe],
            ..Default::default()
        };
        scheduler
            .submit("r1".into(), vec![7, 8, 9], params, 0, sink)
            .unwrap();
        while worker.step() {}

        let updates: Vec<TokenUpdate> = rx.try_iter().collect();
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], TokenUpdate::Token { finished: true, .. }));
        let snapshot = scheduler.snapshot("r1").unwrap();
        assert_eq!(snapshot.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn model_failure_fails_every_request_in_batch() {
        let model = Box::new(FailingModel::new());
        let (scheduler, mut worker) = test_setup(8, SchedulerConfig::default(), model);
        let (sink1, rx1) = channel_sink();
        let (sink2, rx2) = channel_sink();
        scheduler
            .submit("r1".into(), vec![1, 2], greedy(4), 0, sink1)
            .unwrap();
        scheduler
            .submit("r2".into(), vec![3, 4], greedy(4), 0, sink2)
            .unwrap();

        assert!(worker.step());
        for (id, rx) in [("r1", rx1), ("r2", rx2)] {
            let snapshot = scheduler.snapshot(id).unwrap();
            assert_eq!(snapshot.state, RequestState::Failed);
            assert_eq!(snapshot.finish_reason, Some(FinishReason::Error));
            let updates: Vec<TokenUpdate> = rx.try_iter().collect();
            assert_eq!(updates.len(), 1);
            assert!(matches!(updates[0], TokenUpdate::Failed { .. }));
        }
        assert_eq!(scheduler.pager().arena().stats().allocated_blocks, 0);
    }

    #[test]
    fn cancelled_request_is_skipped_without_deliveries() {
        let model = Box::new(ReferenceModel::tiny(64));
        let (scheduler, mut worker) = test_setup(4, SchedulerConfig::default(), model);
        let (sink, rx) = channel_sink();
        scheduler
            .submit("r1".into(), vec![1, 2, 3], greedy(8), 0, sink)
            .unwrap();
        assert!(worker.step()); // prefill + first token

        scheduler.cancel("r1").unwrap();
        let produced_before: usize = rx.try_iter().count();
        assert_eq!(produced_before, 1);

        // Nothing further fires after cancel returns.
        while worker.step() {}
        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(
            scheduler.request_state("r1"),
            Some(RequestState::Cancelled)
        );
        assert_eq!(scheduler.pager().arena().stats().allocated_blocks, 0);
    }

    #[test]
    fn spawned_worker_drives_requests_and_stops() {
        let model = Box::new(ReferenceModel::tiny(64));
        let spec: ModelSpec = model.spec().clone();
        assert_eq!(spec.num_layers, 2);
        let (scheduler, worker) = test_setup(8, SchedulerConfig::default(), model);
        let mut handle = worker.spawn();

        let (sink, rx) = channel_sink();
        scheduler
            .submit("r1".into(), vec![5, 6], greedy(3), 0, sink)
            .unwrap();

        let mut tokens = 0;
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("token timed out") {
                TokenUpdate::Token { finished, .. } => {
                    tokens += 1;
                    if finished {
                        break;
                    }
                }
                TokenUpdate::Failed { message } => panic!("failed: {message}"),
            }
        }
        assert_eq!(tokens, 3);
        handle.stop();
        assert!(!handle.is_running());
    }
}
