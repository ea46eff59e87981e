pub mod error;
pub mod events;
pub mod gtfs;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod store;

pub use error::{InsightError, Result};
pub use events::{DiagnosticEvent, EventBus};
pub use llm::{BackendRegistry, CompletionBackend, CompletionOptions};
pub use pipeline::{AnswerRequest, PipelineConfig, PipelineOutcome, QueryOrchestrator};
pub use store::{DatasetStore, IngestReport, RowSet, SchemaSnapshot};
