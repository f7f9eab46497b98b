//! Continuous-batching request scheduler.
//!
//! Owns every live request and decides, step by step, which of them make
//! progress. Each call to [`Scheduler::next_batch`] assembles a batch
//! under the token and request budgets:
//! 1. finished decoders are reaped and their KV freed,
//! 2. running decoders are admitted (latency first),
//! 3. in-flight chunked prefills continue,
//! 4. new requests are admitted from the waiting queue, preempting
//!    low-priority decoders if the arena is out of blocks.
//!
//! Lock order across the engine is Scheduler -> Pager -> Arena.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::eviction::EvictionManager;
use super::pager::Pager;
use super::request::{
    FinishReason, Request, RequestState, SamplingParams, TokenSink, TokenUpdate,
};
use super::types::{Priority, RequestId, SequenceId, TokenId};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on total tokens (prefill + decode) per step
    pub max_batch_tokens: usize,
    /// Hard cap on requests per step
    pub max_batch_size: usize,
    /// Hard cap on prefill tokens per step
    pub max_prefill_tokens: usize,
    /// Chunk size for prompts split across steps
    pub max_prefill_chunk: usize,
    /// Split long prompts across steps
    pub chunked_prefill_enabled: bool,
    /// Budget weight (>= 1) reserved per admitted decoder when admitting
    /// prefill work; biases the batch toward decode latency
    pub decode_preference: f32,
    /// Preempt running decoders when the arena is out of blocks
    pub preemption_enabled: bool,
    /// Tokens a decoder must have produced before it may be preempted
    pub min_decode_steps_before_preempt: usize,
    /// Use request priority to break scheduling ties
    pub priority_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: 8192,
            max_batch_size: 128,
            max_prefill_tokens: 4096,
            max_prefill_chunk: 2048,
            chunked_prefill_enabled: true,
            decode_preference: 2.0,
            preemption_enabled: true,
            min_decode_steps_before_preempt: 10,
            priority_enabled: true,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_batch_tokens: config.max_batch_tokens,
            max_batch_size: config.max_batch_size,
            max_prefill_tokens: config.max_prefill_tokens,
            max_prefill_chunk: config.max_prefill_chunk,
            chunked_prefill_enabled: config.chunked_prefill_enabled,
            decode_preference: config.decode_preference.max(1.0),
            preemption_enabled: config.preemption_enabled,
            min_decode_steps_before_preempt: config.min_decode_steps_before_preempt,
            priority_enabled: config.priority_enabled,
        }
    }
}

/// Prefill work for one request in one step.
#[derive(Debug, Clone)]
pub struct PrefillEntry {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    /// The token chunk to process this step
    pub tokens: Vec<TokenId>,
    /// Positions already computed before this chunk
    pub position_offset: usize,
    /// Whether this chunk reaches the end of the prompt
    pub completes_prompt: bool,
}

/// Decode work for one request in one step (one token).
#[derive(Debug, Clone)]
pub struct DecodeEntry {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    pub last_token: TokenId,
}

/// One step's work. Ephemeral; the worker executes it without holding
/// the scheduler lock. Decode entries run before prefill entries.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub step: u64,
    pub decode: Vec<DecodeEntry>,
    pub prefill: Vec<PrefillEntry>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.decode.is_empty() && self.prefill.is_empty()
    }

    pub fn len(&self) -> usize {
        self.decode.len() + self.prefill.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.decode.len() + self.prefill.iter().map(|p| p.tokens.len()).sum::<usize>()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.decode
            .iter()
            .map(|d| d.request_id.clone())
            .chain(self.prefill.iter().map(|p| p.request_id.clone()))
            .collect()
    }
}

/// Outcome of a cancel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished,
}

/// Read-only snapshot of a request, for stats endpoints and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestSnapshot {
    pub request_id: RequestId,
    pub seq_id: SequenceId,
    pub state: RequestState,
    pub finish_reason: Option<FinishReason>,
    pub error_message: Option<String>,
    pub generated: Vec<TokenId>,
    pub priority: Priority,
    pub queue_time_ms: f64,
    pub tokens_per_second: f64,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub waiting_requests: usize,
    pub prefilling_requests: usize,
    pub decoding_requests: usize,
    pub paused_requests: usize,
    pub used_kv_blocks: usize,
    pub available_kv_blocks: usize,
    pub kv_utilization: f32,
    pub tokens_per_second: f64,
    pub total_requests_completed: u64,
    pub total_tokens_generated: u64,
    pub num_preemptions: u64,
}

struct SchedState {
    requests: HashMap<RequestId, Request>,
    waiting: VecDeque<RequestId>,
    prefilling: Vec<RequestId>,
    decoding: Vec<RequestId>,
    paused: VecDeque<RequestId>,
    total_tokens_generated: u64,
    total_requests_completed: u64,
    num_preemptions: u64,
}

/// Request admission and continuous-batching engine.
pub struct Scheduler {
    config: SchedulerConfig,
    pager: Arc<Pager>,
    eviction: Option<Arc<EvictionManager>>,
    state: Mutex<SchedState>,
    running: AtomicBool,
    next_seq_id: AtomicU64,
    step_counter: AtomicU64,
    started_at: Instant,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pager: Arc<Pager>,
        eviction: Option<Arc<EvictionManager>>,
    ) -> Self {
        Self {
            config,
            pager,
            eviction,
            state: Mutex::new(SchedState {
                requests: HashMap::new(),
                waiting: VecDeque::new(),
                prefilling: Vec::new(),
                decoding: Vec::new(),
                paused: VecDeque::new(),
                total_tokens_generated: 0,
                total_requests_completed: 0,
                num_preemptions: 0,
            }),
            running: AtomicBool::new(true),
            next_seq_id: AtomicU64::new(1),
            step_counter: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Submit a new request. Rejections (duplicate id, shutdown, prompts
    /// that can never fit a batch) are synchronous; capacity pressure is
    /// not a rejection.
    pub fn submit(
        &self,
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling: SamplingParams,
        priority: Priority,
        sink: TokenSink,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        if prompt_tokens.is_empty() {
            return Err(Error::Config("empty prompt".to_string()));
        }
        if !self.config.chunked_prefill_enabled
            && prompt_tokens.len() > self.config.max_prefill_tokens
        {
            return Err(Error::Config(format!(
                "prompt of {} tokens exceeds the prefill budget ({}) and chunked prefill is disabled",
                prompt_tokens.len(),
                self.config.max_prefill_tokens
            )));
        }

        let mut state = self.lock_state();
        if state.requests.contains_key(&request_id) {
            return Err(Error::DuplicateId(request_id));
        }

        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        self.pager.create_sequence(seq_id)?;

        let request = Request::new(
            request_id.clone(),
            prompt_tokens,
            sampling,
            priority,
            seq_id,
            sink,
        );
        debug!(
            request_id = %request_id,
            seq_id,
            prompt_tokens = request.num_prompt_tokens(),
            "admitted request"
        );
        state.waiting.push_back(request_id.clone());
        state.requests.insert(request_id, request);
        Ok(())
    }

    /// Cancel a request. Synchronous and metadata-only: state flips to
    /// Cancelled, KV is freed, queues are purged. No further token
    /// updates are delivered once this returns.
    pub fn cancel(&self, request_id: &str) -> Result<CancelOutcome> {
        let mut state = self.lock_state();
        let request = state
            .requests
            .get_mut(request_id)
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;
        if request.is_finished() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        let seq_id = request.seq_id;
        request.mark_cancelled();
        self.pager.delete_sequence(seq_id);
        Self::purge_from_queues(&mut state, request_id);
        debug!(request_id = %request_id, "cancelled request");
        Ok(CancelOutcome::Cancelled)
    }

    /// Assemble the next batch. The phase ordering below is the contract.
    pub fn next_batch(&self) -> Batch {
        if !self.is_running() {
            return Batch::default();
        }
        let step = self.step_counter.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state();

        self.resume_paused(&mut state);
        self.run_eviction(&state);
        self.reap_finished(&mut state);

        let mut batch = Batch {
            step,
            ..Batch::default()
        };
        let mut batch_size = 0usize;
        let mut prefill_tokens = 0usize;

        self.admit_decodes(&mut state, &mut batch, &mut batch_size);
        self.admit_prefill_continuations(&mut state, &mut batch, &mut batch_size, &mut prefill_tokens);
        self.admit_waiting(&mut state, &mut batch, &mut batch_size, &mut prefill_tokens);

        batch
    }

    /// Paused requests re-enter the waiting queue once device blocks are
    /// available again (restart semantics; their KV is recomputed).
    fn resume_paused(&self, state: &mut SchedState) {
        if state.paused.is_empty() || self.pager.arena().free_device_blocks() == 0 {
            return;
        }
        while let Some(id) = state.paused.pop_front() {
            if let Some(request) = state.requests.get_mut(&id) {
                if request.state == RequestState::Paused {
                    request.state = RequestState::Waiting;
                    state.waiting.push_back(id);
                }
            }
        }
    }

    fn run_eviction(&self, state: &SchedState) {
        let Some(eviction) = &self.eviction else {
            return;
        };
        let active: HashSet<SequenceId> = state
            .decoding
            .iter()
            .chain(state.prefilling.iter())
            .filter_map(|id| state.requests.get(id))
            .map(|r| r.seq_id)
            .collect();
        eviction.maybe_evict(&active);
    }

    /// Transition decoders whose last token hit a stop condition and
    /// free their KV.
    fn reap_finished(&self, state: &mut SchedState) {
        let ids: Vec<RequestId> = state.decoding.clone();
        for id in ids {
            let Some(request) = state.requests.get_mut(&id) else {
                state.decoding.retain(|d| d != &id);
                continue;
            };
            if request.is_finished() {
                state.decoding.retain(|d| d != &id);
                continue;
            }
            if request.state == RequestState::Decoding && request.should_stop() {
                let reason = request.stop_reason();
                let seq_id = request.seq_id;
                request.mark_completed(reason);
                self.pager.delete_sequence(seq_id);
                state.decoding.retain(|d| d != &id);
                state.total_requests_completed += 1;
                debug!(request_id = %id, ?reason, "request completed");
            }
        }
    }

    /// Admit decoders in priority-then-FIFO order; one budget token each.
    fn admit_decodes(&self, state: &mut SchedState, batch: &mut Batch, batch_size: &mut usize) {
        let mut order: Vec<usize> = (0..state.decoding.len()).collect();
        if self.config.priority_enabled {
            order.sort_by_key(|&i| {
                let id = &state.decoding[i];
                let priority = state.requests.get(id).map(|r| r.priority).unwrap_or(0);
                (std::cmp::Reverse(priority), i)
            });
        }

        for i in order {
            if *batch_size >= self.config.max_batch_size
                || batch.total_tokens() + 1 > self.config.max_batch_tokens
            {
                break;
            }
            let id = state.decoding[i].clone();
            let Some(request) = state.requests.get(&id) else {
                continue;
            };
            if request.state != RequestState::Decoding {
                continue;
            }
            let Some(&last_token) = request.generated.last() else {
                continue;
            };
            batch.decode.push(DecodeEntry {
                request_id: id,
                seq_id: request.seq_id,
                last_token,
            });
            *batch_size += 1;
        }
    }

    /// Budget consumed by already-admitted decoders when weighing prefill
    /// admission; each decoder reserves `decode_preference` tokens.
    fn decode_reserved_tokens(&self, batch: &Batch) -> usize {
        (batch.decode.len() as f32 * self.config.decode_preference).ceil() as usize
    }

    fn admit_prefill_continuations(
        &self,
        state: &mut SchedState,
        batch: &mut Batch,
        batch_size: &mut usize,
        prefill_tokens: &mut usize,
    ) {
        let ids: Vec<RequestId> = state.prefilling.clone();
        for id in ids {
            if *batch_size >= self.config.max_batch_size {
                break;
            }
            let reserved = self.decode_reserved_tokens(batch);
            let Some(request) = state.requests.get(&id) else {
                state.prefilling.retain(|p| p != &id);
                continue;
            };
            if request.state != RequestState::Prefilling {
                if request.is_finished() {
                    state.prefilling.retain(|p| p != &id);
                }
                continue;
            }

            let effective = Self::effective_prompt_len(request);
            let remaining = effective.saturating_sub(request.computed_tokens);
            let budget = self
                .config
                .max_prefill_chunk
                .min(self.config.max_prefill_tokens.saturating_sub(*prefill_tokens))
                .min(
                    self.config
                        .max_batch_tokens
                        .saturating_sub(reserved + *prefill_tokens),
                );
            let chunk = remaining.min(budget);
            if chunk == 0 {
                continue;
            }

            let completes = request.computed_tokens + chunk >= effective;
            let tokens = Self::recompute_stream(request)
                [request.computed_tokens..request.computed_tokens + chunk]
                .to_vec();
            batch.prefill.push(PrefillEntry {
                request_id: id.clone(),
                seq_id: request.seq_id,
                tokens,
                position_offset: request.computed_tokens,
                completes_prompt: completes,
            });
            *batch_size += 1;
            *prefill_tokens += chunk;

            if completes {
                state.prefilling.retain(|p| p != &id);
                state.decoding.push(id);
            }
        }
    }

    /// Admit new requests from the head of the waiting queue.
    fn admit_waiting(
        &self,
        state: &mut SchedState,
        batch: &mut Batch,
        batch_size: &mut usize,
        prefill_tokens: &mut usize,
    ) {
        loop {
            let Some(id) = state.waiting.front().cloned() else {
                break;
            };
            let Some(request) = state.requests.get(&id) else {
                state.waiting.pop_front();
                continue;
            };
            if request.is_finished() {
                state.waiting.pop_front();
                continue;
            }
            if *batch_size >= self.config.max_batch_size {
                break;
            }

            let effective = Self::effective_prompt_len(request);
            let first_chunk = if self.config.chunked_prefill_enabled {
                effective.min(self.config.max_prefill_chunk)
            } else {
                effective
            };
            let reserved = self.decode_reserved_tokens(batch);
            if *prefill_tokens + first_chunk > self.config.max_prefill_tokens
                || reserved + *prefill_tokens + first_chunk > self.config.max_batch_tokens
            {
                break;
            }

            let seq_id = request.seq_id;
            let max_tokens = request.sampling.max_tokens;
            let prompt_len = request.num_prompt_tokens();

            if let Err(e) = self.pager.grow_to(seq_id, effective) {
                match e {
                    Error::NoCapacity(_) if self.config.preemption_enabled => {
                        let blocks_needed = self
                            .pager
                            .arena()
                            .config()
                            .blocks_for_tokens(prompt_len + max_tokens);
                        let shortfall = blocks_needed
                            .saturating_sub(self.pager.arena().free_device_blocks());
                        if !self.preempt(state, batch, shortfall) {
                            break;
                        }
                        if self.pager.grow_to(seq_id, effective).is_err() {
                            break;
                        }
                    }
                    Error::NoCapacity(_) => break,
                    other => {
                        warn!(request_id = %id, error = %other, "admission failed");
                        break;
                    }
                }
            }

            let request = state.requests.get_mut(&id).expect("request exists");
            request.mark_prefilling();
            let completes = first_chunk >= effective;
            let tokens = Self::recompute_stream(request)[..first_chunk].to_vec();
            batch.prefill.push(PrefillEntry {
                request_id: id.clone(),
                seq_id,
                tokens,
                position_offset: 0,
                completes_prompt: completes,
            });
            state.waiting.pop_front();
            if completes {
                state.decoding.push(id);
            } else {
                state.prefilling.push(id);
            }
            *batch_size += 1;
            *prefill_tokens += first_chunk;
        }
    }

    /// Free at least `blocks_needed` device blocks by pausing decoders.
    ///
    /// Victims are the cheapest to preempt: lowest priority first, most
    /// progress first within a priority class. A decoder is eligible only
    /// after `min_decode_steps_before_preempt` generated tokens. Victims
    /// already placed in the in-flight batch are pulled back out.
    fn preempt(&self, state: &mut SchedState, batch: &mut Batch, blocks_needed: usize) -> bool {
        if blocks_needed == 0 {
            return true;
        }
        let mut eligible: Vec<(Priority, usize, RequestId, SequenceId)> = state
            .decoding
            .iter()
            .filter_map(|id| state.requests.get(id).map(|r| (id, r)))
            .filter(|(_, r)| {
                r.state == RequestState::Decoding
                    && r.generated.len() >= self.config.min_decode_steps_before_preempt
            })
            .map(|(id, r)| (r.priority, r.generated.len(), id.clone(), r.seq_id))
            .collect();
        // Lowest priority first; most progress first within a class.
        eligible.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut freed = 0usize;
        for (_, _, id, seq_id) in eligible {
            if freed >= blocks_needed {
                break;
            }
            freed += self.pager.resident_block_count(seq_id);
            self.pager.release_blocks(seq_id);
            if let Some(request) = state.requests.get_mut(&id) {
                request.mark_paused();
            }
            state.decoding.retain(|d| d != &id);
            batch.decode.retain(|d| d.request_id != id);
            state.paused.push_back(id.clone());
            state.num_preemptions += 1;
            info!(request_id = %id, "preempted decoder to reclaim KV blocks");
        }
        freed >= blocks_needed
    }

    /// Prompt-side token stream for (re)prefill: the prompt, plus all but
    /// the last generated token when resuming a preempted request. The
    /// last generated token replays through the decode path.
    fn recompute_stream(request: &Request) -> Vec<TokenId> {
        let mut stream = request.prompt_tokens.clone();
        if !request.generated.is_empty() {
            stream.extend_from_slice(&request.generated[..request.generated.len() - 1]);
        }
        stream
    }

    fn effective_prompt_len(request: &Request) -> usize {
        request.num_prompt_tokens() + request.generated.len().saturating_sub(1)
    }

    /// Sync point after the worker executes a batch.
    pub fn complete_batch(&self, _batch: &Batch) {}

    // ---- Worker-facing progress hooks ----------------------------------

    /// Append a sampled token. Returns the sink delivery to fire outside
    /// the lock, or None when the token is discarded (request cancelled
    /// or otherwise terminal while the batch was in flight).
    pub fn append_token(
        &self,
        request_id: &str,
        token: TokenId,
    ) -> Option<(TokenSink, TokenUpdate)> {
        let mut state = self.lock_state();
        let request = state.requests.get_mut(request_id)?;
        if request.is_finished() {
            return None;
        }
        let update = request.push_token(token);
        let sink = request.sink.clone();
        state.total_tokens_generated += 1;
        Some((sink, update))
    }

    /// Record prefill progress after the worker processed a chunk. On the
    /// completing chunk the request moves to the decode phase.
    pub fn finish_prefill_chunk(&self, request_id: &str, chunk_len: usize, completes: bool) {
        let mut state = self.lock_state();
        if let Some(request) = state.requests.get_mut(request_id) {
            if request.is_finished() {
                return;
            }
            request.computed_tokens += chunk_len;
            if completes {
                request.mark_decoding();
            }
        }
    }

    /// Context (prompt + generated) and sampling parameters for the
    /// sampler, cloned so the worker samples outside the lock.
    pub fn sampling_inputs(&self, request_id: &str) -> Option<(Vec<TokenId>, SamplingParams)> {
        let state = self.lock_state();
        let request = state.requests.get(request_id)?;
        let mut context = request.prompt_tokens.clone();
        context.extend_from_slice(&request.generated);
        Some((context, request.sampling.clone()))
    }

    /// Pause a request whose decode-time block allocation failed; it will
    /// re-enter the waiting queue when capacity returns.
    pub fn pause_for_capacity(&self, request_id: &str) {
        let mut state = self.lock_state();
        let Some(request) = state.requests.get_mut(request_id) else {
            return;
        };
        if request.is_finished() {
            return;
        }
        let seq_id = request.seq_id;
        request.mark_paused();
        self.pager.release_blocks(seq_id);
        Self::purge_from_queues(&mut state, request_id);
        state.paused.push_back(request_id.to_string());
        state.num_preemptions += 1;
        warn!(request_id = %request_id, "paused request: no KV capacity for decode growth");
    }

    /// Fail every request in a batch after a model error. Returns the
    /// sink deliveries to fire outside the lock.
    pub fn fail_batch(&self, batch: &Batch, message: &str) -> Vec<(TokenSink, TokenUpdate)> {
        let mut state = self.lock_state();
        let mut deliveries = Vec::new();
        for id in batch.request_ids() {
            let Some(request) = state.requests.get_mut(&id) else {
                continue;
            };
            if request.is_finished() {
                continue;
            }
            let seq_id = request.seq_id;
            let sink = request.sink.clone();
            request.mark_failed(message.to_string());
            self.pager.delete_sequence(seq_id);
            deliveries.push((
                sink,
                TokenUpdate::Failed {
                    message: message.to_string(),
                },
            ));
            Self::purge_from_queues(&mut state, &id);
        }
        warn!(error = message, requests = deliveries.len(), "batch failed");
        deliveries
    }

    // ---- Introspection -------------------------------------------------

    pub fn request_state(&self, request_id: &str) -> Option<RequestState> {
        self.lock_state()
            .requests
            .get(request_id)
            .map(|r| r.state)
    }

    pub fn snapshot(&self, request_id: &str) -> Option<RequestSnapshot> {
        let state = self.lock_state();
        state.requests.get(request_id).map(|r| RequestSnapshot {
            request_id: r.request_id.clone(),
            seq_id: r.seq_id,
            state: r.state,
            finish_reason: r.finish_reason,
            error_message: r.error_message.clone(),
            generated: r.generated.clone(),
            priority: r.priority,
            queue_time_ms: r.queue_time_ms(),
            tokens_per_second: r.tokens_per_second(),
        })
    }

    /// Whether the worker should keep per-request KV state for this id.
    pub fn is_live(&self, request_id: &str) -> bool {
        self.lock_state()
            .requests
            .get(request_id)
            .map(|r| !r.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock_state();
        let arena = self.pager.arena().stats();
        let used = arena.allocated_blocks;
        let elapsed = self.started_at.elapsed().as_secs_f64();
        SchedulerStats {
            waiting_requests: state.waiting.len(),
            prefilling_requests: state.prefilling.len(),
            decoding_requests: state.decoding.len(),
            paused_requests: state.paused.len(),
            used_kv_blocks: used,
            available_kv_blocks: arena.free_device_blocks,
            kv_utilization: if arena.total_blocks > 0 {
                used as f32 / arena.total_blocks as f32
            } else {
                0.0
            },
            tokens_per_second: if elapsed > 0.0 {
                state.total_tokens_generated as f64 / elapsed
            } else {
                0.0
            },
            total_requests_completed: state.total_requests_completed,
            total_tokens_generated: state.total_tokens_generated,
            num_preemptions: state.num_preemptions,
        }
    }

    /// Stop accepting work and cancel every live request.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.lock_state();
        let ids: Vec<RequestId> = state.requests.keys().cloned().collect();
        for id in ids {
            if let Some(request) = state.requests.get_mut(&id) {
                if !request.is_finished() {
                    let seq_id = request.seq_id;
                    request.mark_cancelled();
                    self.pager.delete_sequence(seq_id);
                }
            }
        }
        state.waiting.clear();
        state.prefilling.clear();
        state.decoding.clear();
        state.paused.clear();
        info!("scheduler shut down");
    }

    fn purge_from_queues(state: &mut SchedState, request_id: &str) {
        state.waiting.retain(|id| id != request_id);
        state.prefilling.retain(|id| id != request_id);
        state.decoding.retain(|id| id != request_id);
        state.paused.retain(|id| id != request_id);
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }
}
