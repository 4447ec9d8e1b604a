//! Sessions, their pipelines, and the thread-affinity discipline that keeps
//! each aligned session on exactly one worker thread at a time.

pub mod affinity;
pub mod event;
pub mod pipeline;
pub mod session;
pub mod stage;

pub use affinity::AffinityController;
pub use event::{SessionEvent, SessionHandler};
pub use pipeline::{Pipeline, PipelineBuilder, StageFactory};
pub use session::{MigrationOutcome, Session, SessionId, SessionInit};
pub use stage::{Stage, StageContext, WriteBufferStage};
