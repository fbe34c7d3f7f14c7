//! Domain types for the autonom job agent.
//!
//! Everything in this crate is pure data: AWS IoT Jobs topic names,
//! the JSON request/response payloads exchanged on them, the job
//! execution model, and the processor status snapshot. No I/O lives
//! here; the `autonom-agent` crate owns the runtime.

pub mod error;
pub mod job;
pub mod messages;
pub mod status;
pub mod topics;

pub use error::CoreError;
pub use job::{JobDocument, JobExecution, JobExecutionStatus};
pub use status::ProcessorStatus;
pub use topics::{Channel, ThingTopics};
