// 服务端模块

pub mod backlog;
pub mod capacity;
pub mod context;
pub mod control;
pub mod dispatcher;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod sink;

pub use backlog::Backlog;
pub use capacity::{SlotPermit, WorkerCapacity};
pub use context::{CycleOutcome, ServerContext};
pub use control::{ControlDirective, ControlPlane, LimitChange};
pub use dispatcher::{WorkerDispatcher, WorkerReport};
pub use registry::{UploadRegistry, UploadSession};
pub use request::ChunkRequest;
pub use scheduler::AdmissionScheduler;
pub use sink::ChunkSink;
