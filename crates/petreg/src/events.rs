//! Run events and the sinks that receive them.
//!
//! Every run owns one [`EventSink`]. Nothing in the engine writes to a
//! process-wide logger directly except through [`TracingSink`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::FailureClass;

/// Why a session refresh happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    /// Periodic refresh every K dispatched keys.
    Scheduled,
    /// The retry controller saw an auth failure.
    AuthFailure,
}

/// Every event a harvest run emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HarvestEvent {
    // ── Run ───────────────────────────────
    RunStarted {
        run_id: String,
        source_url: String,
        total_keys: usize,
    },
    RunFinished {
        run_id: String,
        records: usize,
        synthetic: bool,
        error: Option<String>,
        elapsed_ms: u64,
    },

    // ── Session ───────────────────────────
    SessionAcquired { form_fields: usize, cookies: usize },
    SessionRefreshed { reason: RefreshReason, ok: bool },

    // ── Keys ──────────────────────────────
    KeyStarted { key: String, index: usize },
    AttemptFailed {
        key: String,
        attempt: u32,
        class: FailureClass,
        delay_ms: u64,
        error: String,
    },
    KeyCompleted {
        key: String,
        records: usize,
        attempts: u32,
    },
    /// Retries exhausted; the key contributes no records.
    KeyAbandoned { key: String, attempts: u32 },
    DecoyFetched { url: String, ok: bool },

    // ── Fallback ──────────────────────────
    SynthesisUsed { records: usize, reason: String },
}

/// Receives events for one run.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &HarvestEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &HarvestEvent) {
        match event {
            HarvestEvent::AttemptFailed {
                key,
                attempt,
                class,
                delay_ms,
                error,
            } => tracing::warn!(
                %key, attempt, ?class, delay_ms, "attempt failed: {error}"
            ),
            HarvestEvent::KeyAbandoned { key, attempts } => {
                tracing::warn!(%key, attempts, "retries exhausted, key skipped")
            }
            HarvestEvent::SessionRefreshed { ok: false, reason } => {
                tracing::warn!(?reason, "session refresh failed")
            }
            HarvestEvent::SynthesisUsed { records, reason } => {
                tracing::warn!(records, "serving synthetic dataset: {reason}")
            }
            HarvestEvent::RunStarted { .. } | HarvestEvent::RunFinished { .. } => {
                tracing::info!(event = ?event)
            }
            other => tracing::debug!(event = ?other),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<HarvestEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HarvestEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&HarvestEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &HarvestEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
    }
}

/// Broadcasts to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &HarvestEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
