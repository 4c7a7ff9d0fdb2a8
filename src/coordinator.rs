//! Ties the bus's four open/closed sides to stage lifecycles and carries
//! cancellation-with-cause to every running stage.
//!
//! The bus only knows how to close a half-pipe side; it has no notion of
//! "all the stages that were supposed to keep this side busy have
//! stopped." That bookkeeping lives here, as four simple counters (one
//! per directional side) seeded at assembly time and decremented as each
//! stage finalizes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::bus::Bus;
use crate::error::StageError;
use crate::message::Direction;

/// Seed counts for the four waitgroups, computed by the assembler from
/// the resolved stage list's `is_producer`/`is_consumer`/direction triple.
///
/// The read counters cross sides by design: a right-facing consumer
/// drains messages that arrived from the left (the left half-pipe's
/// output is "what flows toward the right peer"), so it contributes to
/// `l_read`, not `r_read`. Same for the left-facing consumer and
/// `r_read`. The write counters don't cross: a left-facing producer
/// writes into the left half-pipe's input.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorCounts {
    pub l_write: usize,
    pub r_write: usize,
    pub l_read: usize,
    pub r_read: usize,
}

/// Coordinates stage shutdown and pipeline-wide cancellation.
///
/// `fail` sets a shared cause exactly once; every [`super::stage::StageCancel`]
/// built from [`Coordinator::cancel_receiver`] observes it and unwinds.
/// `release` is called once per stage as it finalizes and closes bus
/// sides whose last contributing stage has just stopped.
pub struct Coordinator {
    bus: Arc<Bus>,
    cancel_tx: watch::Sender<Option<Arc<anyhow::Error>>>,
    l_write: AtomicUsize,
    r_write: AtomicUsize,
    l_read: AtomicUsize,
    r_read: AtomicUsize,
}

impl Coordinator {
    /// A counter seeded at zero means no stage will ever decrement it, so
    /// its side is closed right away rather than waiting for a `release`
    /// call that will never come (e.g. an all-producer pipeline with no
    /// consumer leaves both read counters at zero).
    pub fn new(bus: Arc<Bus>, counts: CoordinatorCounts) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(None);
        if counts.l_write == 0 {
            bus.left.close_input();
        }
        if counts.r_write == 0 {
            bus.right.close_input();
        }
        if counts.l_read == 0 {
            bus.left.close_output();
        }
        if counts.r_read == 0 {
            bus.right.close_output();
        }
        Arc::new(Self {
            bus,
            cancel_tx,
            l_write: AtomicUsize::new(counts.l_write),
            r_write: AtomicUsize::new(counts.r_write),
            l_read: AtomicUsize::new(counts.l_read),
            r_read: AtomicUsize::new(counts.r_read),
        })
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<Option<Arc<anyhow::Error>>> {
        self.cancel_tx.subscribe()
    }

    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.cancel_tx.borrow().clone()
    }

    /// Records a fatal stage error as the pipeline-wide cancellation
    /// cause. Only the first call has any effect; later ones are
    /// dropped, matching the "first fatal error wins" rule stages rely
    /// on when deciding whether their own failure is the reported one.
    pub fn fail(&self, index: usize, name: &str, err: anyhow::Error) {
        let wrapped = Arc::new(anyhow::Error::new(StageError::new(index, name.to_string(), err)));
        let _ = self.cancel_tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = Some(wrapped.clone());
                true
            } else {
                false
            }
        });
    }

    /// Explicit shutdown request with no stage at fault (SIGINT, a CLI
    /// `--stop` at the pipeline level). Uses the same cause slot as
    /// `fail`, so it also only takes effect once.
    pub fn shutdown(&self, reason: &str) {
        let _ = self.cancel_tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = Some(Arc::new(anyhow::anyhow!("{reason}")));
                true
            } else {
                false
            }
        });
        self.bus.stop_pipe();
    }

    /// Called once a stage has fully drained; decrements whichever of
    /// the four waitgroups its role and direction contributed to,
    /// closing the corresponding bus side when the last contributor
    /// drops out. See [`CoordinatorCounts`] for why the read side
    /// crosses direction.
    pub fn release(&self, is_producer: bool, is_consumer: bool, direction: Direction) {
        let (left, right) = match direction {
            Direction::L => (true, false),
            Direction::R => (false, true),
            Direction::LR => (true, true),
        };
        if is_producer && left {
            self.decrement(&self.l_write, || self.bus.left.close_input());
        }
        if is_producer && right {
            self.decrement(&self.r_write, || self.bus.right.close_input());
        }
        if is_consumer && right {
            self.decrement(&self.l_read, || self.bus.left.close_output());
        }
        if is_consumer && left {
            self.decrement(&self.r_read, || self.bus.right.close_output());
        }
    }

    fn decrement(&self, counter: &AtomicUsize, on_zero: impl FnOnce()) {
        let prev = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).unwrap_or(0);
        if prev <= 1 {
            on_zero();
        }
    }

    /// Blocks until both half-pipes have both sides closed, then
    /// publishes `STOP`.
    pub async fn wait(&self) {
        self.bus.wait().await;
        self.bus.publish_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_closes_side_only_after_last_contributor() {
        let bus = Arc::new(Bus::new());
        let coord = Coordinator::new(
            bus.clone(),
            CoordinatorCounts {
                l_write: 2,
                ..Default::default()
            },
        );
        assert!(bus.left.is_input_open());
        coord.release(true, false, Direction::L);
        assert!(bus.left.is_input_open());
        coord.release(true, false, Direction::L);
        assert!(!bus.left.is_input_open());
    }

    #[tokio::test]
    async fn fail_sets_cause_once() {
        let bus = Arc::new(Bus::new());
        let coord = Coordinator::new(bus, CoordinatorCounts::default());
        coord.fail(0, "a", anyhow::anyhow!("boom"));
        coord.fail(1, "b", anyhow::anyhow!("second"));
        let cause = coord.cause().unwrap();
        assert!(cause.to_string().contains("boom"));
    }
}
