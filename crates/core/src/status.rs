//! Processor status snapshot.

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the job processor's counters.
///
/// Counters only grow for the lifetime of the process and approximate
/// queue activity; they are not authoritative job state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    /// start-next replies that carried an execution.
    pub jobs_started: u64,
    /// Accepted status updates, whichever status they reported.
    pub jobs_succeeded: u64,
    /// Rejected start-next requests plus rejected updates.
    pub jobs_rejected: u64,
}
