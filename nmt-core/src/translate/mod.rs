//! Beam-search translation over a [`StepModel`](crate::model::StepModel).

pub mod beam;
pub mod config;
pub mod output;
pub mod scorer;
pub mod session;
pub mod trace;

pub use beam::{Beam, BeamStep, FinishedHypothesis, Hypothesis};
pub use config::TranslatorConfig;
pub use output::{CopyOutput, OutputAdapter, PlainOutput};
pub use scorer::{GlobalScorer, GlobalState, GnmtGlobalScorer};
pub use session::{BeamSearchSession, Translation};
pub use trace::{BeamObserver, BeamTrace, SearchPosition, TraceRound};
