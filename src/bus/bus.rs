//! The bus: two directional half-pipes plus the event mechanism that ties
//! stage lifecycle to message routing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, Notify};

use super::event::{Event, EventHandler, HandlerFn, HandlerPhase, READY, START, STOP};
use super::halfpipe::{Callback, CallbackPanic, HalfPipe, Input};
use crate::message::{Direction, Message, MessageType};

/// Events kept in the broadcast backlog for late-subscribing stages.
/// Lifecycle events are low-volume (one per stage transition, not per
/// message), so a generous capacity costs little and avoids spurious
/// `Lagged` gaps during a busy startup.
const EVENT_BROADCAST_CAPACITY: usize = 1024;

/// Two directional half-pipes (L, R) plus the shared event/handler
/// machinery stages use to publish and subscribe to lifecycle events.
pub struct Bus {
    pub left: HalfPipe,
    pub right: HalfPipe,
    handlers: RwLock<Vec<EventHandler>>,
    next_callback_seq: AtomicUsize,
    started: std::sync::atomic::AtomicBool,
    start_notify: Notify,
    event_tx: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            left: HalfPipe::new(Direction::L),
            right: HalfPipe::new(Direction::R),
            handlers: RwLock::new(Vec::new()),
            next_callback_seq: AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
            start_notify: Notify::new(),
            event_tx,
        }
    }

    /// Subscribes to every event published from here on. Used by stage
    /// runtimes to wait for `--wait`/`--stop` triggers without blocking a
    /// worker thread, the async-native counterpart to the synchronous
    /// pre/post handler chain below.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn half_pipe(&self, dir: Direction) -> &HalfPipe {
        match dir {
            Direction::L => &self.left,
            Direction::R => &self.right,
            Direction::LR => panic!("half_pipe() requires a concrete direction"),
        }
    }

    /// Registers a callback in the specified half-pipe(s). Returns the
    /// shared callback id, equal to the owning stage's index.
    #[allow(clippy::too_many_arguments)]
    pub fn add_callback(
        &self,
        dir: Direction,
        stage_id: usize,
        enabled: Arc<std::sync::atomic::AtomicBool>,
        order: i32,
        post: bool,
        type_filter: Vec<MessageType>,
        rate_limiter_hz: Option<f64>,
        func: super::halfpipe::CallbackFn,
    ) -> usize {
        let make_limiter = |hz: Option<f64>| hz.map(super::halfpipe::RateLimiter::new);
        match dir {
            Direction::L => {
                self.left.add_callback(Callback {
                    id: stage_id,
                    stage_id,
                    enabled,
                    order,
                    registration_index: 0,
                    post,
                    type_filter,
                    rate_limiter: make_limiter(rate_limiter_hz),
                    direction: dir,
                    func,
                });
            }
            Direction::R => {
                self.right.add_callback(Callback {
                    id: stage_id,
                    stage_id,
                    enabled,
                    order,
                    registration_index: 0,
                    post,
                    type_filter,
                    rate_limiter: make_limiter(rate_limiter_hz),
                    direction: dir,
                    func,
                });
            }
            Direction::LR => {
                self.left.add_callback(Callback {
                    id: stage_id,
                    stage_id,
                    enabled: enabled.clone(),
                    order,
                    registration_index: 0,
                    post,
                    type_filter: type_filter.clone(),
                    rate_limiter: make_limiter(rate_limiter_hz),
                    direction: dir,
                    func: func.clone(),
                });
                self.right.add_callback(Callback {
                    id: stage_id,
                    stage_id,
                    enabled,
                    order,
                    registration_index: 0,
                    post,
                    type_filter,
                    rate_limiter: make_limiter(rate_limiter_hz),
                    direction: dir,
                    func,
                });
            }
        }
        self.next_callback_seq.fetch_add(1, Ordering::SeqCst);
        stage_id
    }

    pub fn add_input(&self, input: Arc<Input>) {
        self.half_pipe(input.direction).add_input(input);
    }

    pub fn add_handler(&self, patterns: Vec<String>, phase: HandlerPhase, func: HandlerFn) {
        self.handlers.write().unwrap().push(EventHandler {
            patterns,
            phase,
            func,
        });
    }

    /// Publishes an event. Pre-phase handlers run before this function
    /// does anything else; post-phase handlers run last. Both phases run
    /// synchronously on the publisher's task, matching the bus's
    /// synchronous-callback concurrency model.
    pub fn event(&self, kind: &str, values: Vec<serde_json::Value>) -> Event {
        let event = Event::new(kind, values);
        let handlers = self.handlers.read().unwrap().clone();
        for h in handlers.iter().filter(|h| h.phase == HandlerPhase::Pre && h.matches(&event)) {
            (h.func)(&event);
        }
        if event.kind == START {
            self.started.store(true, Ordering::SeqCst);
            self.start_notify.notify_waiters();
        }
        let _ = self.event_tx.send(event.clone());
        for h in handlers.iter().filter(|h| h.phase == HandlerPhase::Post && h.matches(&event)) {
            (h.func)(&event);
        }
        event
    }

    /// Emits `START`; any handler that registered pre-phase interest in
    /// `START` (or a `--wait` event that canonicalizes to it) fires.
    pub fn start_pipe(&self) {
        self.event(START, vec![]);
    }

    pub async fn wait_for_start(&self) {
        if self.started.load(Ordering::SeqCst) {
            return;
        }
        self.start_notify.notified().await;
    }

    /// Marks both half-pipes' input sides closed. Callers (the
    /// coordinator) are responsible for waiting for the output sides to
    /// drain before the bus is considered fully stopped; this method only
    /// performs the input-side half of `stopPipe`, with `STOP` published
    /// once `wait()` observes full drain.
    pub fn stop_pipe(&self) {
        self.left.close_input();
        self.right.close_input();
    }

    pub fn publish_stop(&self) {
        self.event(STOP, vec![]);
    }

    pub fn publish_ready(&self, stage_name: &str) {
        self.event(&format!("{stage_name}/{READY}"), vec![]);
    }

    /// Blocks until both half-pipes have both sides closed.
    pub async fn wait(&self) {
        loop {
            let done = !self.left.is_input_open()
                && !self.left.is_output_open()
                && !self.right.is_input_open()
                && !self.right.is_output_open();
            if done {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Drains any queued callback-panic reports across both half-pipes.
    pub fn drain_panics(&self) -> Vec<CallbackPanic> {
        let mut out = vec![];
        while let Ok(p) = self.left.panic_receiver().try_recv() {
            out.push(p);
        }
        while let Ok(p) = self.right.panic_receiver().try_recv() {
            out.push(p);
        }
        out
    }
}

/// Writes a message into a half-pipe via `input`, running the effective
/// callback chain and, if it survives, enqueueing it on the output.
pub async fn inject(bus: &Bus, input: &Input, msg: Message) {
    bus.half_pipe(input.direction).deliver_via_input(input, msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::halfpipe::FilterMode;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn start_pipe_wakes_waiters() {
        let bus = Arc::new(Bus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for_start().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        bus.start_pipe();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn injection_filter_first_reaches_no_callbacks() {
        let bus = Bus::new();
        let hit = Arc::new(AtomicBool::new(false));
        {
            let hit = hit.clone();
            bus.add_callback(
                Direction::R,
                1,
                Arc::new(AtomicBool::new(true)),
                0,
                false,
                vec![],
                None,
                Arc::new(move |_m| {
                    hit.store(true, Ordering::SeqCst);
                    true
                }),
            );
        }
        let input = Arc::new(Input::new(1, 2, Direction::R, FilterMode::None, 0));
        bus.add_input(input.clone());

        let msg = Message::new(Direction::R, MessageType::Update, vec![]);
        inject(&bus, &input, msg).await;

        assert!(!hit.load(Ordering::SeqCst));
        assert!(bus.right.output_receiver().try_recv().is_ok());
    }
}
