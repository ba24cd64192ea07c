//! Query key enumeration and paced, sequential dispatch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DecoySettings, DelayBounds, HarvestConfig};
use crate::events::{EventSink, HarvestEvent, RefreshReason};
use crate::pacing::{Pacer, Sleeper};
use crate::retry::RetryController;
use crate::session::SessionManager;
use crate::transport::SourceTransport;
use crate::types::{Aggregator, Category, QueryKey};

/// Year ordering of the key sequence.
///
/// Descending tends to fare better against the rate limiter; either order
/// yields the same key set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YearOrder {
    Ascending,
    #[default]
    Descending,
}

/// The (year × category) cross product, produced lazily.
///
/// Categories keep their declared order within each year and are
/// de-duplicated, so every key is unique. Iterating twice yields the same
/// sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeys {
    start_year: i32,
    end_year: i32,
    categories: Vec<Category>,
    order: YearOrder,
}

impl QueryKeys {
    pub fn new(start_year: i32, end_year: i32, categories: &[Category], order: YearOrder) -> Self {
        let categories = Category::ALL
            .into_iter()
            .filter(|c| categories.contains(c))
            .collect();
        Self {
            start_year,
            end_year,
            categories,
            order,
        }
    }

    pub fn years(&self) -> usize {
        if self.start_year > self.end_year {
            0
        } else {
            (i64::from(self.end_year) - i64::from(self.start_year)) as usize + 1
        }
    }

    pub fn len(&self) -> usize {
        self.years().saturating_mul(self.categories.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Key at position `index` of the sequence.
    pub fn get(&self, index: usize) -> Option<QueryKey> {
        if index >= self.len() {
            return None;
        }
        let per_year = self.categories.len();
        let year_offset = (index / per_year) as i64;
        let year = match self.order {
            YearOrder::Ascending => i64::from(self.start_year) + year_offset,
            YearOrder::Descending => i64::from(self.end_year) - year_offset,
        };
        let year = i32::try_from(year).ok()?;
        Some(QueryKey::for_year(year, self.categories[index % per_year]))
    }

    pub fn iter(&self) -> impl Iterator<Item = QueryKey> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// Enumerate one key per (year, category) pair.
pub fn enumerate(
    start_year: i32,
    end_year: i32,
    categories: &[Category],
    order: YearOrder,
) -> QueryKeys {
    QueryKeys::new(start_year, end_year, categories, order)
}

/// Drives keys through the retry controller one at a time.
pub struct Dispatcher {
    pacing: DelayBounds,
    refresh_every: u32,
    decoy: DecoySettings,
    decoy_pages: Vec<String>,
    pacer: Pacer,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        config: &HarvestConfig,
        pacer: Pacer,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            pacing: config.pacing,
            refresh_every: config.session_refresh_every,
            decoy: config.decoy.clone(),
            decoy_pages: config.source.decoy_pages.clone(),
            pacer,
            sleeper,
            sink,
        }
    }

    /// Dispatch every key in order, appending results to `aggregator`.
    pub async fn dispatch<T: SourceTransport + ?Sized>(
        &mut self,
        keys: &QueryKeys,
        controller: &RetryController,
        sessions: &mut SessionManager<T>,
        aggregator: &mut Aggregator,
    ) {
        for (index, key) in keys.iter().enumerate() {
            if index > 0 {
                let delay = self.pacer.next_delay(&self.pacing);
                self.sleeper.sleep(delay).await;

                if self.refresh_every > 0 && index % self.refresh_every as usize == 0 {
                    let ok = sessions.refresh().await;
                    self.sink.emit(&HarvestEvent::SessionRefreshed {
                        reason: RefreshReason::Scheduled,
                        ok,
                    });
                }
            }

            if self.decoy.enabled {
                self.send_decoys(sessions).await;
            }

            self.sink.emit(&HarvestEvent::KeyStarted {
                key: key.to_string(),
                index,
            });
            let records = controller.execute(&key, sessions).await;
            aggregator.append(records);
        }
    }

    /// Best-effort fetches of unrelated pages. Failures are dropped.
    async fn send_decoys<T: SourceTransport + ?Sized>(&mut self, sessions: &SessionManager<T>) {
        let headers = sessions
            .context()
            .map(|ctx| ctx.request_headers(sessions.entry_page()))
            .unwrap_or_default();

        for _ in 0..self.decoy.per_key {
            let Some(idx) = self.pacer.pick(self.decoy_pages.len()) else {
                return;
            };
            let url = self.decoy_pages[idx].clone();
            let ok = match sessions.transport().get(&url, &headers).await {
                Ok(resp) => resp.is_success(),
                Err(e) => {
                    tracing::debug!("decoy fetch {url} failed: {e}");
                    false
                }
            };
            self.sink.emit(&HarvestEvent::DecoyFetched { url, ok });

            let delay = self.pacer.next_delay(&self.decoy.delay);
            self.sleeper.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::decoder::ResponseDecoder;
    use crate::events::MemorySink;
    use crate::pacing::RecordingSleeper;
    use crate::retry::RetryPolicy;
    use crate::transport::{HttpResponse, ReplayTransport, Scripted};

    const TABLE: &str = r#"<table class="table">
        <tr><th>縣市</th><th>登記數</th></tr>
        <tr><td>合計</td><td>10</td></tr>
        <tr><td>基隆市</td><td>4</td></tr>
    </table>"#;

    #[test]
    fn test_enumerate_count_and_uniqueness() {
        let keys = enumerate(2015, 2020, &[Category::Dog, Category::Cat], YearOrder::Ascending);
        assert_eq!(keys.len(), 12);
        let unique: HashSet<QueryKey> = keys.iter().collect();
        assert_eq!(unique.len(), 12);
        assert_eq!(keys.iter().count(), 12);
    }

    #[test]
    fn test_enumerate_order() {
        let keys = enumerate(2019, 2020, &[Category::Cat, Category::Dog], YearOrder::Descending);
        let seq: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(
            seq,
            vec![
                "2020/01/01-2020/12/31/dog",
                "2020/01/01-2020/12/31/cat",
                "2019/01/01-2019/12/31/dog",
                "2019/01/01-2019/12/31/cat",
            ]
        );

        let asc = enumerate(2019, 2020, &[Category::Cat], YearOrder::Ascending);
        assert_eq!(asc.get(0).unwrap().period_label(), "2019");
        assert_eq!(asc.get(2), None);
    }

    #[test]
    fn test_enumerate_is_restartable_and_deduplicated() {
        let keys = enumerate(2000, 2002, &[Category::Dog, Category::Dog], YearOrder::Descending);
        assert_eq!(keys.len(), 3);
        let first: Vec<_> = keys.iter().collect();
        let second: Vec<_> = keys.iter().collect();
        assert_eq!(first, second);
        assert!(enumerate(2021, 2020, &[Category::Dog], YearOrder::Ascending).is_empty());
    }

    #[test]
    fn test_enumerate_extreme_year_range() {
        let keys = enumerate(i32::MIN, i32::MAX, &[Category::Dog], YearOrder::Descending);
        assert_eq!(keys.years() as u64, u64::from(u32::MAX) + 1);
        assert!(keys.get(keys.len() - 1).is_some());
        assert_eq!(keys.get(keys.len()), None);
    }

    fn config(refresh_every: u32, decoys: bool) -> HarvestConfig {
        let mut config = HarvestConfig {
            start_year: 2018,
            end_year: Some(2020),
            session_refresh_every: refresh_every,
            pacing: DelayBounds {
                min_ms: 100,
                max_ms: 100,
            },
            ..HarvestConfig::default()
        };
        config.decoy.enabled = decoys;
        config.decoy.delay = DelayBounds {
            min_ms: 7,
            max_ms: 7,
        };
        config
    }

    async fn run(config: &HarvestConfig) -> (Arc<ReplayTransport>, Arc<RecordingSleeper>, Arc<MemorySink>, usize, u32) {
        let transport = Arc::new(
            ReplayTransport::new("<form></form>")
                .with_fallback(Scripted::Respond(HttpResponse::ok(TABLE))),
        );
        let sleeper = Arc::new(RecordingSleeper::new());
        let sink = Arc::new(MemorySink::new());
        let controller = RetryController::new(
            config.source.clone(),
            ResponseDecoder::default(),
            RetryPolicy::from_settings(&config.retry),
            sleeper.clone(),
            sink.clone(),
        );
        let mut dispatcher = Dispatcher::new(config, Pacer::new(Some(1)), sleeper.clone(), sink.clone());
        let mut sessions = SessionManager::new(transport.clone(), config.source.entry_page.clone());
        let mut aggregator = Aggregator::new(config.source.handler_endpoint.clone(), Uuid::nil());
        let keys = enumerate(
            config.start_year,
            config.resolved_end_year(),
            &config.categories,
            config.order,
        );

        dispatcher
            .dispatch(&keys, &controller, &mut sessions, &mut aggregator)
            .await;
        (transport, sleeper, sink, aggregator.len(), sessions.refresh_count())
    }

    #[tokio::test]
    async fn test_dispatch_paces_and_refreshes() {
        let (transport, sleeper, sink, records, refreshes) = run(&config(2, false)).await;

        assert_eq!(records, 12);
        // Keys at index 2 and 4 force a refresh.
        assert_eq!(refreshes, 2);
        assert_eq!(transport.count("GET"), 3);
        assert_eq!(sleeper.slept(), vec![Duration::from_millis(100); 5]);
        assert_eq!(
            sink.count(|e| matches!(
                e,
                HarvestEvent::SessionRefreshed {
                    reason: RefreshReason::Scheduled,
                    ok: true
                }
            )),
            2
        );
        assert_eq!(sink.count(|e| matches!(e, HarvestEvent::KeyStarted { .. })), 6);
    }

    #[tokio::test]
    async fn test_zero_cadence_disables_refresh() {
        let (_, _, _, _, refreshes) = run(&config(0, false)).await;
        assert_eq!(refreshes, 0);
    }

    #[tokio::test]
    async fn test_decoys_precede_each_query() {
        let (transport, sleeper, sink, records, _) = run(&config(0, true)).await;

        assert_eq!(records, 12);
        // One bootstrap GET plus one decoy per key.
        assert_eq!(transport.count("GET"), 7);
        assert_eq!(sink.count(|e| matches!(e, HarvestEvent::DecoyFetched { .. })), 6);
        let decoy_sleeps = sleeper
            .slept()
            .into_iter()
            .filter(|d| *d == Duration::from_millis(7))
            .count();
        assert_eq!(decoy_sleeps, 6);
    }
}
