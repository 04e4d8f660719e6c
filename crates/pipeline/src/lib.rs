//! Core pipeline engine for Reflect.
//!
//! This crate contains every domain concept of the draft → critique → refine
//! pipeline: schema contracts, the accumulating state, the stage contract, the
//! schema-enforced invocation adapter, and the sequential runner. Infrastructure
//! crates implement the [`LlmBackend`] port defined here; they never add
//! pipeline rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no network I/O.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`StageName`, `RunId`, etc.) |
//! | [`types`] | Validated value types (`Temperature`, `Timestamp`) |
//! | [`errors`] | Failure taxonomy and retry policy |
//! | [`schema`] | Schema contracts and validated results |
//! | [`state`] | Pipeline state and partial updates |
//! | [`backend`] | The `LlmBackend` port |
//! | [`invocation`] | Schema-enforced model invocation |
//! | [`stage`] | Stage contract and model-backed stage definitions |
//! | [`runner`] | Sequential runner, progress, cancellation, retries |

pub mod backend;
pub mod errors;
pub mod identifiers;
pub mod invocation;
pub mod runner;
pub mod schema;
pub mod stage;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use backend::{GenerationRequest, LlmBackend};
pub use errors::{BackendError, ConfigurationError, PipelineError, RetryPolicy, RunFailure};
pub use identifiers::{ModelId, RunId, SchemaName, StageName};
pub use invocation::{ModelInvoker, DEFAULT_CALL_TIMEOUT};
pub use runner::{
    PipelineRunner, ProgressObserver, RetryConfig, RunOutcome, RunPhase, RunStream, StageSnapshot,
};
pub use schema::{
    FieldSpec, FieldType, SchemaContract, SchemaContractBuilder, SchemaDescriptor, SchemaError,
    StructuredResult, TypeMismatch,
};
pub use stage::{LlmStage, PromptFn, Stage, StageDefinition, StageInputs};
pub use state::{PartialUpdate, PipelineState, StageOutput};
pub use types::{Temperature, Timestamp};

pub use tokio_util::sync::CancellationToken;
