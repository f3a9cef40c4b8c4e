pub mod error;
pub mod model;
pub mod translate;

pub use error::TranslateError;
pub use model::{DecoderState, ModelError, SourceBatch, StepModel, StepOutput};
pub use translate::{BeamSearchSession, Translation, TranslatorConfig};
