//! Typed kernel error taxonomy.
//!
//! Every error the kernel itself raises (as opposed to errors returned by a
//! stage's `Prepare`/`Run`) is one of the variants below. Stage errors are
//! wrapped with the stage's index and name before leaving the kernel so
//! callers always see `[stage-index] stage-name: ...`.

use thiserror::Error;

/// Errors raised by the bus/assembler/coordinator/stage-runtime kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no registered stage command '{0}'")]
    StageCmd(String),

    #[error("stage at index {index} was specified twice with different commands ('{first}' vs '{second}')")]
    StageDiff {
        index: usize,
        first: String,
        second: String,
    },

    /// Cooperative termination. Non-fatal; callers should treat this as a
    /// normal stop rather than an error to report.
    #[error("stage stopped")]
    StageStopped,

    /// The whole pipe completed successfully and was asked to stop.
    #[error("pipe finished")]
    PipeFinished,

    #[error("consumer stage must be first or last in the pipeline")]
    FirstOrLast,

    #[error("--new value does not resolve to an existing callback id")]
    Inject,

    #[error("--left --right used on a stage that does not support bidirectional attachment")]
    LR,

    #[error("stage declared as a filter-in but registered no callbacks")]
    NoCallbacks,

    #[error("stage declared as a producer or filter-out but registered no inputs")]
    NoInputs,

    #[error("pipeline has no user stages")]
    EmptyPipeline,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KernelError {
    /// Whether this error is the distinguished cooperative-stop sentinel.
    /// Fatal-error propagation policy hinges on this distinction.
    pub fn is_stage_stopped(&self) -> bool {
        matches!(self, KernelError::StageStopped)
    }
}

/// Wraps a [`KernelError`] (or any stage-returned error) with `[index] name: `
/// context identifying which stage raised it.
#[derive(Debug, Error)]
#[error("[{index}] {name}: {source}")]
pub struct StageError {
    pub index: usize,
    pub name: String,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn new(index: usize, name: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            index,
            name: name.into(),
            source,
        }
    }

    /// True if the wrapped error is `ErrStageStopped` — does not cascade a
    /// coordinator-wide cancellation.
    pub fn is_stage_stopped(&self) -> bool {
        self.source
            .downcast_ref::<KernelError>()
            .is_some_and(KernelError::is_stage_stopped)
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
