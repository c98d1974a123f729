//! Sequential analysis of queued submissions.

pub mod analysis;
pub mod engine;

pub use analysis::{Analyzer, NarrativeAnalyzer, ProgressSink};
pub use engine::{ProcessOutcome, ProcessingEngine};
