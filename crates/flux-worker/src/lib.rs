//! Flux worker library: the HTTP control-plane client, the SSE
//! reconnect loop, the type-erased workflow registry, and the
//! execution pool that ties them together (spec.md §4.7). The
//! `flux-worker` binary (`src/main.rs`) is a thin wrapper over this
//! library; downstream binaries embed it directly to ship their own
//! compiled-in workflows.

pub mod client;
pub mod connect;
pub mod pool;
pub mod registry;

pub mod prelude {
    pub use crate::client::{ClientError, ControlEvent, ExecutionSnapshot, ServerClient};
    pub use crate::pool::{WorkerPool, WorkerPoolConfig};
    pub use crate::registry::{AnyWorkflow, WorkflowRegistry};
}
