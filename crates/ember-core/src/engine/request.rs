//! Generation requests and their state machine.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::types::{Priority, RequestId, SequenceId, TokenId};

/// Request state through the system.
///
/// Transitions are monotonic along
/// Waiting -> Prefilling -> Decoding -> (Completed | Cancelled | Failed),
/// with the optional Decoding <-> Paused detour under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Waiting,
    Prefilling,
    Decoding,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RequestState {
    /// Terminal states never mutate further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Why a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Hit a stop token
    Stop,
    /// Reached max_tokens
    Length,
    Cancelled,
    Error,
}

/// Sampling parameters, immutable once a request is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub stop_token_ids: Vec<TokenId>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            max_tokens: default_max_tokens(),
            stop_token_ids: Vec::new(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> usize {
    40
}

fn default_repetition_penalty() -> f32 {
    1.1
}

fn default_max_tokens() -> usize {
    512
}

impl SamplingParams {
    /// Clamp every field to its semantic range. Malformed input never
    /// panics the engine; it is coerced at submission.
    pub fn clamped(mut self) -> Self {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            self.temperature = 0.0;
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            self.top_p = 1.0;
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            self.repetition_penalty = 1.0;
        }
        self.max_tokens = self.max_tokens.max(1);
        self
    }
}

/// One delivery on a request's token sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenUpdate {
    /// A generated token. `finished == true` means no further updates
    /// will be delivered for this request.
    Token { token_id: TokenId, finished: bool },
    /// Terminal failure; always the last delivery.
    Failed { message: String },
}

/// Sink the submitter hands the scheduler; the worker pushes token
/// updates through it as they are produced.
pub type TokenSink = Arc<dyn Fn(TokenUpdate) + Send + Sync>;

/// A generation request owned by the scheduler.
pub struct Request {
    pub request_id: RequestId,
    pub prompt_tokens: Vec<TokenId>,
    pub sampling: SamplingParams,
    pub priority: Priority,

    pub state: RequestState,
    pub finish_reason: Option<FinishReason>,
    pub error_message: Option<String>,

    pub generated: Vec<TokenId>,
    /// Prompt-side positions whose KV has been computed (chunked prefill
    /// progress; reset to 0 when the request is preempted).
    pub computed_tokens: usize,

    /// Sequence backing this request's KV in the pager.
    pub seq_id: SequenceId,

    pub arrival_time: Instant,
    pub start_time: Option<Instant>,
    pub last_token_time: Option<Instant>,
    pub finish_time: Option<Instant>,

    pub sink: TokenSink,
}

impl Request {
    pub fn new(
        request_id: RequestId,
        prompt_tokens: Vec<TokenId>,
        sampling: SamplingParams,
        priority: Priority,
        seq_id: SequenceId,
        sink: TokenSink,
    ) -> Self {
        Self {
            request_id,
            prompt_tokens,
            sampling: sampling.clamped(),
            priority,
            state: RequestState::Waiting,
            finish_reason: None,
            error_message: None,
            generated: Vec::new(),
            computed_tokens: 0,
            seq_id,
            arrival_time: Instant::now(),
            start_time: None,
            last_token_time: None,
            finish_time: None,
            sink,
        }
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_tokens.len()
    }

    pub fn num_generated_tokens(&self) -> usize {
        self.generated.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens.len() + self.generated.len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether generation should stop after the latest token.
    pub fn should_stop(&self) -> bool {
        if self.generated.len() >= self.sampling.max_tokens {
            return true;
        }
        match self.generated.last() {
            Some(last) => self.sampling.stop_token_ids.contains(last),
            None => false,
        }
    }

    /// The finish reason implied by the current generated tokens.
    pub fn stop_reason(&self) -> FinishReason {
        if self
            .generated
            .last()
            .is_some_and(|t| self.sampling.stop_token_ids.contains(t))
        {
            FinishReason::Stop
        } else {
            FinishReason::Length
        }
    }

    pub fn mark_prefilling(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state = RequestState::Prefilling;
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn mark_decoding(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state = RequestState::Decoding;
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn mark_paused(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state = RequestState::Paused;
        self.computed_tokens = 0;
    }

    pub fn mark_completed(&mut self, reason: FinishReason) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::Completed;
        self.finish_reason = Some(reason);
        self.finish_time = Some(Instant::now());
        self.drop_sink();
    }

    pub fn mark_cancelled(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::Cancelled;
        self.finish_reason = Some(FinishReason::Cancelled);
        self.finish_time = Some(Instant::now());
        self.drop_sink();
    }

    pub fn mark_failed(&mut self, message: String) {
        if self.state.is_terminal() {
            return;
        }
        self.state = RequestState::Failed;
        self.finish_reason = Some(FinishReason::Error);
        self.error_message = Some(message);
        self.finish_time = Some(Instant::now());
        self.drop_sink();
    }

    /// Terminal states release the sink so channel-backed sinks close;
    /// the caller that needs a final delivery clones the sink first.
    fn drop_sink(&mut self) {
        self.sink = Arc::new(|_| {});
    }

    /// Append a generated token, returning the update to deliver on the
    /// sink. Delivery happens outside the scheduler lock.
    pub fn push_token(&mut self, token_id: TokenId) -> TokenUpdate {
        self.generated.push(token_id);
        self.last_token_time = Some(Instant::now());
        TokenUpdate::Token {
            token_id,
            finished: self.should_stop(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.finish_time.unwrap_or_else(Instant::now);
        end.duration_since(start).as_secs_f64() * 1000.0
    }

    pub fn queue_time_ms(&self) -> f64 {
        let end = self.start_time.unwrap_or_else(Instant::now);
        end.duration_since(self.arrival_time).as_secs_f64() * 1000.0
    }

    pub fn tokens_per_second(&self) -> f64 {
        let elapsed = self.elapsed_ms();
        if elapsed < 1.0 {
            return 0.0;
        }
        self.generated.len() as f64 * 1000.0 / elapsed
    }
}
