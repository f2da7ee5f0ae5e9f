use thiserror::Error;

/// Failure of a batch readback. The whole batch is discarded; agents keep the
/// influences they had before the dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadbackError {
    #[error("compute device reported an error: {0}")]
    Device(String),
    #[error("compute device dropped the batch without delivering a result")]
    Disconnected,
    #[error("readback buffer holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("agent set changed since dispatch ({dispatched} agents then, {current} now)")]
    AgentSetChanged { dispatched: usize, current: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolverError {
    /// A new batch was requested while the previous one is still outstanding.
    #[error("a batch dispatch is already in flight")]
    DispatchInFlight,
}
