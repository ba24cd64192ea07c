//! petreg CLI: output writers and the run journal used by the `petreg` binary.

pub mod journal;
pub mod output;

pub use journal::RunJournal;
pub use output::{format_as_js, format_as_json, format_report, write_all, OutputPaths};
