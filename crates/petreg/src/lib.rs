//! petreg: acquisition engine for pet registration statistics.
//!
//! Queries a session-gated statistics source across a year × category cross
//! product, decodes its HTML-table and JSON-envelope responses into canonical
//! records, and falls back to a provenance-marked synthetic dataset when the
//! source yields nothing.

pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod harvest;
pub mod normalizer;
pub mod pacing;
pub mod query;
pub mod regions;
pub mod retry;
pub mod session;
pub mod synth;
pub mod transport;
pub mod types;

pub use config::{HarvestConfig, SourceConfig};
pub use decoder::{FieldCodeTable, RawResponse, ResponseDecoder};
pub use dispatcher::{enumerate, QueryKeys, YearOrder};
pub use error::{AcquireError, AcquireResult, FailureClass};
pub use events::{EventSink, FanoutSink, HarvestEvent, MemorySink, TracingSink};
pub use harvest::Harvester;
pub use normalizer::normalize;
pub use pacing::{RecordingSleeper, Sleeper, TokioSleeper};
pub use query::QueryShape;
pub use retry::{RetryController, RetryPolicy};
pub use session::{SessionContext, SessionManager};
pub use synth::FallbackSynthesizer;
pub use transport::{HttpTransport, ReplayTransport, SourceTransport};
pub use types::*;
