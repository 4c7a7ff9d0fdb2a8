//! Drives one stage through its lifecycle: waiting for a start trigger,
//! preparing, running, and stopping, all synchronized with its siblings
//! through the bus and the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Barrier, Notify};

use crate::bus::Bus;
use crate::coordinator::Coordinator;
use crate::error::KernelError;
use crate::message::Direction;

use super::handle::RunHandle;
use super::options::StageOptions;
use super::Stage;

/// Coordinator-wide cancellation-with-cause, merged with a per-stage
/// local force flag.
///
/// The coordinator holds one `watch::Sender<Option<Arc<anyhow::Error>>>`
/// for the whole pipeline; any stage's fatal error propagates through it
/// to every other stage. `--stop` events and stop-timeout escalation
/// instead set only the local flag, so they never look like a pipeline
/// wide failure to the stages that didn't ask for it.
pub struct StageCancel {
    coordinator: watch::Receiver<Option<Arc<anyhow::Error>>>,
    local: Arc<AtomicBool>,
    local_notify: Arc<Notify>,
}

impl Clone for StageCancel {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            local: self.local.clone(),
            local_notify: self.local_notify.clone(),
        }
    }
}

impl StageCancel {
    pub fn new(coordinator: watch::Receiver<Option<Arc<anyhow::Error>>>) -> Self {
        Self {
            coordinator,
            local: Arc::new(AtomicBool::new(false)),
            local_notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.coordinator.borrow().is_some() || self.local.load(Ordering::SeqCst)
    }

    /// The pipeline-wide cause, if the coordinator cancelled. `None` when
    /// only the local flag is set (a `--stop` event or escalation, not a
    /// fatal error elsewhere).
    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.coordinator.borrow().clone()
    }

    /// Resolves once either the coordinator-wide cause is set or this
    /// stage's local flag is forced. Safe to call repeatedly.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let notify = self.local_notify.clone();
        let notified = notify.notified();
        tokio::select! {
            _ = self.coordinator.changed() => {}
            _ = notified => {}
        }
    }

    /// Forces this stage's own context to cancel without touching the
    /// coordinator-wide cause. Used for `--stop` events and for the
    /// stop-timeout escalation, both of which must stay local to the
    /// stage that triggered them.
    pub fn force_cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
        self.local_notify.notify_waiters();
    }
}

/// Coarse lifecycle position, queryable for diagnostics; the actual
/// synchronization lives in the atomics and channels below, not in this
/// enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Init,
    Attached,
    Preparing,
    Ready,
    Running,
    Stopping,
    Stopped,
    Fatal,
}

/// One stage's slice of the running pipeline: its resolved direction and
/// options, the handle the kernel drives it through, and the
/// synchronization state (start trigger, cohort barrier, stop plumbing)
/// that makes its four lifecycle methods run in the right order relative
/// to the rest of the pipeline.
pub struct StageRuntime {
    pub index: usize,
    pub name: String,
    pub options: StageOptions,
    pub direction: Direction,
    pub is_first: bool,
    pub is_last: bool,
    stage: Arc<dyn Stage>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<StageState>,
    /// Canonicalized `--wait` events (or `["START"]` by default).
    wait_patterns: Vec<String>,
    /// Canonicalized `--stop` events, if any.
    stop_patterns: Vec<String>,
    stop_timeout: Duration,
    inputs: Vec<Arc<crate::bus::Input>>,
    /// Shared with every other stage that resolved to the same trigger
    /// patterns; `Run` across the cohort only begins once every member
    /// has finished `Prepare`.
    cohort: Arc<Barrier>,
}

impl StageRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        name: String,
        options: StageOptions,
        direction: Direction,
        is_first: bool,
        is_last: bool,
        stage: Arc<dyn Stage>,
        running: Arc<AtomicBool>,
        wait_patterns: Vec<String>,
        stop_patterns: Vec<String>,
        stop_timeout: Duration,
        inputs: Vec<Arc<crate::bus::Input>>,
        cohort: Arc<Barrier>,
    ) -> Self {
        Self {
            index,
            name,
            options,
            direction,
            is_first,
            is_last,
            stage,
            running,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            state: Mutex::new(StageState::Attached),
            wait_patterns,
            stop_patterns,
            stop_timeout,
            inputs,
            cohort,
        }
    }

    pub fn state(&self) -> StageState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: StageState) {
        *self.state.lock().unwrap() = s;
    }

    /// Drives this stage through its whole lifecycle. Returns once the
    /// stage has fully stopped (inputs closed, in-flight messages
    /// drained, coordinator waitgroups released, `STOP` published).
    pub async fn drive(self: Arc<Self>, bus: Arc<Bus>, coordinator: Arc<Coordinator>) {
        let mut events_rx = bus.subscribe_events();
        let mut gate_cancel = StageCancel::new(coordinator.cancel_receiver());

        if !self.wait_for_trigger(&mut events_rx, &mut gate_cancel).await {
            // Cancelled before the trigger ever fired: neither prepare
            // nor run are called, matching the "both or neither" rule.
            self.finalize(&bus, &coordinator).await;
            return;
        }

        self.set_state(StageState::Preparing);
        if let Err(e) = self.stage.prepare().await {
            self.set_state(StageState::Fatal);
            coordinator.fail(self.index, &self.name, e);
            self.finalize(&bus, &coordinator).await;
            return;
        }
        self.set_state(StageState::Ready);
        bus.publish_ready(&self.name);

        // Hold Run until every stage that shares this trigger has
        // finished Prepare.
        self.cohort.wait().await;

        self.set_state(StageState::Running);
        self.running.store(true, Ordering::SeqCst);
        bus.event(&format!("{}/START", self.name), vec![]);

        let stage_cancel = StageCancel::new(coordinator.cancel_receiver());

        let stop_watch = if self.stop_patterns.is_empty() {
            None
        } else {
            Some(tokio::spawn(
                self.clone().watch_stop_events(bus.clone(), stage_cancel.clone()),
            ))
        };

        let run_handle = RunHandle::new(
            self.index,
            self.name.clone(),
            self.direction,
            bus.clone(),
            self.inputs.clone(),
            stage_cancel.clone(),
        );
        // Cloned rather than borrowed: the select below and the handle
        // passed into the stage share the same local force flag, so a
        // --stop event or escalation wakes both.
        let mut run_cancel = run_handle.cancel.clone();

        let stage_for_run = self.stage.clone();
        let mut run_task = tokio::spawn(async move { stage_for_run.run(run_handle).await });

        let outcome = tokio::select! {
            res = &mut run_task => RunOutcome::Returned(res),
            _ = run_cancel.cancelled() => RunOutcome::StopRequested,
        };

        match outcome {
            RunOutcome::Returned(res) => {
                let res = res.unwrap_or_else(|e| Err(anyhow::anyhow!("stage task panicked: {e}")));
                self.finish_from_run(res, &bus, &coordinator).await;
            }
            RunOutcome::StopRequested => {
                self.set_state(StageState::Stopping);
                let _ = self.stage.stop().await;
                match tokio::time::timeout(self.stop_timeout, &mut run_task).await {
                    Ok(res) => {
                        let res =
                            res.unwrap_or_else(|e| Err(anyhow::anyhow!("stage task panicked: {e}")));
                        self.finish_from_run(res, &bus, &coordinator).await;
                    }
                    Err(_) => {
                        tracing::warn!(
                            stage = self.name.as_str(),
                            "stop timeout exceeded, forcing cancellation"
                        );
                        run_cancel.force_cancel();
                        run_task.abort();
                        self.finalize(&bus, &coordinator).await;
                    }
                }
            }
        }

        if let Some(h) = stop_watch {
            h.abort();
        }
    }

    /// Waits for the first matching trigger event. Returns `false` if the
    /// pipeline was cancelled first (broadcast channel closed, or the
    /// coordinator cause fired) without ever seeing a match.
    async fn wait_for_trigger(
        &self,
        events_rx: &mut broadcast::Receiver<crate::bus::Event>,
        cancel: &mut StageCancel,
    ) -> bool {
        loop {
            tokio::select! {
                ev = events_rx.recv() => {
                    match ev {
                        Ok(e) if self.wait_patterns.iter().any(|p| e.matches(p)) => {
                            if self.started.swap(true, Ordering::SeqCst) {
                                continue;
                            }
                            return true;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return false,
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn watch_stop_events(self: Arc<Self>, bus: Arc<Bus>, cancel: StageCancel) {
        let mut rx = bus.subscribe_events();
        loop {
            match rx.recv().await {
                Ok(ev) if self.stop_patterns.iter().any(|p| ev.matches(p)) => {
                    cancel.force_cancel();
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn finish_from_run(&self, res: anyhow::Result<()>, bus: &Bus, coordinator: &Coordinator) {
        match res {
            Ok(()) => {}
            Err(e) => {
                let stopped = e
                    .downcast_ref::<KernelError>()
                    .map(|ke| ke.is_stage_stopped())
                    .unwrap_or(false);
                if !stopped {
                    self.set_state(StageState::Fatal);
                    coordinator.fail(self.index, &self.name, e);
                }
            }
        }
        self.finalize(bus, coordinator).await;
    }

    /// Steps 4-7 of the stop sequence: close this stage's inputs, wait
    /// for their in-flight counters to drain, release the coordinator's
    /// waitgroups, and publish `STOP`. Idempotent.
    async fn finalize(&self, bus: &Bus, coordinator: &Coordinator) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        for input in &self.inputs {
            input.close();
        }
        for input in &self.inputs {
            while input.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        coordinator.release(self.options.is_producer, self.options.is_consumer, self.direction);
        if self.state() != StageState::Fatal {
            self.set_state(StageState::Stopped);
        }
        bus.event(&format!("{}/STOP", self.name), vec![]);
    }
}

enum RunOutcome {
    Returned(Result<anyhow::Result<()>, tokio::task::JoinError>),
    StopRequested,
}
