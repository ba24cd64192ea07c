//! Bounded retries for a single query key.
//!
//! Failure handling is a lookup in a [`RetryPolicy`] table keyed by
//! [`FailureClass`]. The controller only evaluates the table; it holds no
//! per-class logic of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RetrySettings, SourceConfig};
use crate::decoder::{RawResponse, ResponseDecoder};
use crate::error::{AcquireError, AcquireResult, FailureClass};
use crate::events::{EventSink, HarvestEvent, RefreshReason};
use crate::normalizer::normalize;
use crate::pacing::Sleeper;
use crate::query;
use crate::session::SessionManager;
use crate::transport::SourceTransport;
use crate::types::{CanonicalRecord, QueryKey};

/// Delay formula applied after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base`
    Fixed,
    /// `base × attempt`
    Linear,
    /// `base × 2 × attempt`
    Steep,
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Steep => base.saturating_mul(attempt.saturating_mul(2)),
        }
    }
}

/// What to do about one failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyAction {
    pub backoff: Backoff,
    pub invalidate_session: bool,
    pub refresh_session: bool,
    /// False stops retrying the key immediately.
    pub retry: bool,
}

impl PolicyAction {
    pub const fn backoff(backoff: Backoff) -> Self {
        Self {
            backoff,
            invalidate_session: false,
            refresh_session: false,
            retry: true,
        }
    }

    pub const fn rebuild_session(mut self) -> Self {
        self.invalidate_session = true;
        self.refresh_session = true;
        self
    }
}

/// Failure class → action table, plus the attempt bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    rules: HashMap<FailureClass, PolicyAction>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        let rules = HashMap::from([
            (FailureClass::EmptyPayload, PolicyAction::backoff(Backoff::Fixed)),
            (
                FailureClass::AuthFailure,
                PolicyAction::backoff(Backoff::Linear).rebuild_session(),
            ),
            (FailureClass::RateLimited, PolicyAction::backoff(Backoff::Steep)),
            (FailureClass::Transport, PolicyAction::backoff(Backoff::Fixed)),
            (FailureClass::Undecodable, PolicyAction::backoff(Backoff::Fixed)),
        ]);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            rules,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
        )
    }

    /// Replace the action for one class.
    pub fn with_rule(mut self, class: FailureClass, action: PolicyAction) -> Self {
        self.rules.insert(class, action);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn action(&self, class: FailureClass) -> PolicyAction {
        self.rules
            .get(&class)
            .copied()
            .unwrap_or(PolicyAction::backoff(Backoff::Fixed))
    }

    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Duration {
        self.action(class).backoff.delay(self.base_delay, attempt)
    }
}

/// Executes one query key with bounded retries.
pub struct RetryController {
    source: SourceConfig,
    decoder: ResponseDecoder,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl RetryController {
    pub fn new(
        source: SourceConfig,
        decoder: ResponseDecoder,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            decoder,
            policy,
            sleeper,
            sink,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `key` to completion.
    ///
    /// Returns the decoded records, or an empty list once attempts are
    /// exhausted. Never fails.
    pub async fn execute<T: SourceTransport + ?Sized>(
        &self,
        key: &QueryKey,
        sessions: &mut SessionManager<T>,
    ) -> Vec<CanonicalRecord> {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            let err = match self.attempt(key, sessions).await {
                Ok(records) => {
                    self.sink.emit(&HarvestEvent::KeyCompleted {
                        key: key.to_string(),
                        records: records.len(),
                        attempts,
                    });
                    return records;
                }
                Err(err) => err,
            };

            let class = err.classify();
            let action = self.policy.action(class);
            let last = attempts == max_attempts || !action.retry;
            let delay = if last {
                Duration::ZERO
            } else {
                action.backoff.delay(self.policy.base_delay(), attempts)
            };

            self.sink.emit(&HarvestEvent::AttemptFailed {
                key: key.to_string(),
                attempt: attempts,
                class,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });

            if action.invalidate_session {
                sessions.invalidate();
            }
            if last {
                break;
            }

            self.sleeper.sleep(delay).await;

            if action.refresh_session {
                let ok = sessions.refresh().await;
                self.sink.emit(&HarvestEvent::SessionRefreshed {
                    reason: RefreshReason::AuthFailure,
                    ok,
                });
            }
        }

        let exhausted = AcquireError::ExhaustedRetries {
            key: key.to_string(),
            attempts,
        };
        tracing::debug!("{exhausted}");
        self.sink.emit(&HarvestEvent::KeyAbandoned {
            key: key.to_string(),
            attempts,
        });
        Vec::new()
    }

    /// One request/decode round trip.
    async fn attempt<T: SourceTransport + ?Sized>(
        &self,
        key: &QueryKey,
        sessions: &mut SessionManager<T>,
    ) -> AcquireResult<Vec<CanonicalRecord>> {
        let transport = Arc::clone(sessions.transport());
        let resp = {
            let session = sessions.ensure().await?;
            query::send_query(transport.as_ref(), &self.source, session, key).await?
        };
        sessions.absorb(&resp);

        let raw = RawResponse::sniff(&resp.body)?;
        let records = self.decoder.decode(&raw)?;
        tracing::debug!(%key, records = records.len(), "decoded response");
        Ok(records.into_iter().map(|r| normalize(r, key)).collect())
    }
}
