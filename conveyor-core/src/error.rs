use std::fmt::{Display, Formatter};

/// Why a pipeline stopped before its source was exhausted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// `Pipeline::cancel` was called.
    Requested,
    /// The configured wall-clock budget elapsed.
    Deadline,
    /// A stage failed while running with the fatal error policy.
    FatalStage {
        stage: String,
        item_id: u64,
        message: String,
    },
    /// `await_done` gave up waiting and aborted the remaining tasks.
    ForceTimeout,
    /// The parent cancellation scope was cancelled (e.g. process shutdown).
    Shutdown,
    /// Every task returned but some admitted items never produced a result.
    Unaccounted { in_flight: usize },
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancel requested"),
            CancelReason::Deadline => write!(f, "deadline exceeded"),
            CancelReason::FatalStage {
                stage,
                item_id,
                message,
            } => write!(f, "fatal error in stage {} on item {}: {}", stage, item_id, message),
            CancelReason::ForceTimeout => write!(f, "force timeout"),
            CancelReason::Shutdown => write!(f, "shutdown"),
            CancelReason::Unaccounted { in_flight } => {
                write!(f, "{} items left without a result", in_flight)
            }
        }
    }
}

/// Control-flow errors returned by suspension points.
///
/// These never describe a single item; see [`ItemError`] for that.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("channel closed")]
    Closed,
}

/// Per-item failure carried inside an `ItemResult`.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("stage {stage} failed: {source:#}")]
    Process {
        stage: String,
        source: anyhow::Error,
    },
    #[error("stage {stage} panicked: {message}")]
    Panicked { stage: String, message: String },
    #[error("stage {stage} worker aborted")]
    Aborted { stage: String },
}

impl ItemError {
    /// Name of the stage that produced the error.
    pub fn stage(&self) -> &str {
        match self {
            ItemError::Process { stage, .. } => stage,
            ItemError::Panicked { stage, .. } => stage,
            ItemError::Aborted { stage } => stage,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, ItemError::Panicked { .. })
    }
}
