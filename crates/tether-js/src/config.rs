//! Engine Configuration

use serde::{Deserialize, Serialize};

/// When queued promise jobs run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrotaskPolicy {
    /// Drain the job queue after every outermost engine operation
    #[default]
    Auto,
    /// Only drain on `Engine::perform_microtask_checkpoint`
    Explicit,
}

/// Engine configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Heap ceiling in bytes
    pub heap_limit: Option<usize>,

    /// Maximum native stack used by the interpreter (bytes)
    pub max_stack_size: Option<usize>,

    /// Allocation volume that triggers a collection (bytes)
    pub gc_threshold: Option<usize>,

    /// Promise job scheduling
    pub microtasks: MicrotaskPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heap_limit: None,
            max_stack_size: Some(1024 * 1024), // 1MB
            gc_threshold: None,
            microtasks: MicrotaskPolicy::Auto,
        }
    }
}

impl EngineConfig {
    pub fn with_heap_limit(mut self, bytes: usize) -> Self {
        self.heap_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_microtasks(mut self, policy: MicrotaskPolicy) -> Self {
        self.microtasks = policy;
        self
    }
}
