//! Core domain types shared by every Flux crate: the event log's wire
//! types, workflow/execution identity, serialization codecs and content
//! fingerprinting, layered configuration, and the error taxonomy.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod workflow;

pub mod prelude {
    pub use crate::codec::{Codec, Fingerprint, GeneralCodec, JsonCodec};
    pub use crate::config::FluxConfig;
    pub use crate::error::{DecodeError, EncodeError, ErrorKind};
    pub use crate::event::{Event, EventKind};
    pub use crate::execution::{Execution, ExecutionState};
    pub use crate::ids::{ExecutionId, SourceId, WorkerName};
    pub use crate::workflow::{ResourceRequirements, WorkflowDefinition, WorkflowError};
}
