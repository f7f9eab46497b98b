//! Application state management

use ember_core::{Engine, Tokenizer};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl AppState {
    pub fn new(engine: Engine, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            engine: Arc::new(engine),
            tokenizer,
        }
    }
}
