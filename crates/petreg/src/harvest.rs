//! Run orchestration: bootstrap, dispatch, fallback.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::decoder::{FieldCodeTable, ResponseDecoder};
use crate::dispatcher::{enumerate, Dispatcher, QueryKeys};
use crate::error::AcquireResult;
use crate::events::{EventSink, HarvestEvent, TracingSink};
use crate::pacing::{Pacer, Sleeper, TokioSleeper};
use crate::query::QueryShape;
use crate::retry::{RetryController, RetryPolicy};
use crate::session::SessionManager;
use crate::synth::FallbackSynthesizer;
use crate::transport::{HttpTransport, SourceTransport};
use crate::types::{Aggregator, Dataset};

/// One configured acquisition engine. Each `run()` is independent.
pub struct Harvester<T: SourceTransport + ?Sized> {
    config: HarvestConfig,
    transport: Arc<T>,
    decoder: ResponseDecoder,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
    seed: Option<u64>,
}

impl Harvester<HttpTransport> {
    /// Harvester over real HTTP.
    pub fn from_config(config: HarvestConfig) -> AcquireResult<Self> {
        let transport = HttpTransport::from_config(&config.source)?;
        Ok(Self::new(config, Arc::new(transport)))
    }
}

impl<T: SourceTransport + ?Sized> Harvester<T> {
    pub fn new(config: HarvestConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            decoder: ResponseDecoder::default(),
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(TracingSink),
            seed: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Seed pacing jitter and synthesis for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_field_table(mut self, table: FieldCodeTable) -> Self {
        self.decoder = ResponseDecoder::new(table);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Endpoint queries are sent to under the configured shape.
    pub fn source_url(&self) -> &str {
        match self.config.source.query_shape {
            QueryShape::Form => &self.config.source.handler_endpoint,
            QueryShape::Service => &self.config.source.service_endpoint,
        }
    }

    pub fn keys(&self) -> QueryKeys {
        enumerate(
            self.config.start_year,
            self.config.resolved_end_year(),
            &self.config.categories,
            self.config.order,
        )
    }

    /// Execute one full run.
    ///
    /// Always returns a well-formed dataset. Run-level failures land in
    /// `Dataset::error`. When live acquisition was attempted and came back
    /// empty, a synthetic dataset replaces it if synthesis is enabled; a
    /// rejected config returns empty.
    pub async fn run(&self) -> Dataset {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("harvest", %run_id);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Dataset {
        let started = Instant::now();
        let mut aggregator = Aggregator::new(self.source_url(), run_id);

        // Synthesis only stands in for a live attempt; a rejected config
        // never reaches the source.
        let attempted = match self.config.validate() {
            Ok(()) => {
                let keys = self.keys();
                self.emit_started(run_id, keys.len());
                self.acquire_live(&keys, &mut aggregator).await;
                true
            }
            Err(e) => {
                self.emit_started(run_id, 0);
                tracing::error!("{e}");
                aggregator.record_error(e.to_string());
                false
            }
        };

        let mut dataset = aggregator.finish();
        if attempted && dataset.is_empty() && self.config.synthesis.enabled {
            dataset = self.synthesize(run_id, dataset.error().map(str::to_string));
        }

        self.sink.emit(&HarvestEvent::RunFinished {
            run_id: run_id.to_string(),
            records: dataset.len(),
            synthetic: dataset.is_synthetic(),
            error: dataset.error().map(str::to_string),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        dataset
    }

    fn emit_started(&self, run_id: Uuid, total_keys: usize) {
        self.sink.emit(&HarvestEvent::RunStarted {
            run_id: run_id.to_string(),
            source_url: self.source_url().to_string(),
            total_keys,
        });
    }

    async fn acquire_live(&self, keys: &QueryKeys, aggregator: &mut Aggregator) {
        let mut sessions =
            SessionManager::new(Arc::clone(&self.transport), self.config.source.entry_page.clone());

        match sessions.acquire().await {
            Ok(ctx) => self.sink.emit(&HarvestEvent::SessionAcquired {
                form_fields: ctx.form_state().len(),
                cookies: ctx.cookies().len(),
            }),
            Err(e) => {
                tracing::error!("session bootstrap failed: {e}");
                aggregator.record_error(format!("session bootstrap failed: {e}"));
                return;
            }
        }

        let controller = RetryController::new(
            self.config.source.clone(),
            self.decoder.clone(),
            RetryPolicy::from_settings(&self.config.retry),
            Arc::clone(&self.sleeper),
            Arc::clone(&self.sink),
        );
        let mut dispatcher = Dispatcher::new(
            &self.config,
            Pacer::new(self.seed),
            Arc::clone(&self.sleeper),
            Arc::clone(&self.sink),
        );
        dispatcher
            .dispatch(keys, &controller, &mut sessions, aggregator)
            .await;

        if aggregator.is_empty() {
            aggregator.record_error(format!(
                "no records acquired for {} query keys",
                keys.len()
            ));
        }
    }

    fn synthesize(&self, run_id: Uuid, error: Option<String>) -> Dataset {
        let seed = self.seed.or(self.config.synthesis.seed);
        let dataset = FallbackSynthesizer::new(seed)
            .with_run_id(run_id)
            .generate(
                self.config.start_year,
                self.config.resolved_end_year(),
                &self.config.synthesis.regions,
                &self.config.categories,
            )
            .with_error(error.clone());

        self.sink.emit(&HarvestEvent::SynthesisUsed {
            records: dataset.len(),
            reason: error.unwrap_or_else(|| "live acquisition returned no records".to_string()),
        });
        dataset
    }
}
