pub mod handle;
pub mod options;
pub mod registry;
pub mod runtime;

pub use handle::{AttachHandle, RunHandle};
pub use options::StageOptions;
pub use registry::{FactoryFn, StageRegistry};
pub use runtime::{StageCancel, StageRuntime, StageState};

use async_trait::async_trait;

/// The contract every concrete stage implements. The kernel drives these
/// four methods through the state machine in `runtime.rs`; stages
/// themselves never see bus internals except through the handles passed
/// in.
///
/// `attach` runs with exclusive ownership before the pipeline starts, so
/// it alone takes `&mut self`. From `prepare` onward the runtime holds the
/// stage behind an `Arc`, because `stop` must be callable concurrently
/// with an in-flight `run` (that's how the kernel asks a running stage to
/// wind down); any state a stage needs to share across that boundary goes
/// behind its own interior mutability (`AtomicBool`, `Mutex`, `Notify`,
/// ...), the same way the rest of this codebase does it.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Human name, used in event names and error prefixes.
    fn name(&self) -> &str;

    /// Called once before the pipeline starts. Registers callbacks,
    /// handlers, inputs; validates configuration. Must not perform
    /// blocking I/O.
    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()>;

    /// Called when the start event fires. May perform blocking I/O. A
    /// non-nil return is fatal.
    async fn prepare(&self) -> anyhow::Result<()>;

    /// Runs until its work is done or its context is cancelled.
    /// `Ok(())` or `Err(stage stopped)` (see [`crate::error::KernelError::StageStopped`])
    /// are non-fatal; any other error is fatal.
    async fn run(&self, run: RunHandle) -> anyhow::Result<()>;

    /// Called by the kernel when stop is requested, while `run` may still
    /// be executing concurrently. Must make `run` return quickly.
    /// Idempotent.
    async fn stop(&self) -> anyhow::Result<()>;
}
