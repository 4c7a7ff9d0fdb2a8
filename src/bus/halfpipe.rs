//! One directional half-pipe: ordered callbacks, injectable inputs, an
//! output queue.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::message::{Direction, Message, MessageType};

/// How an input's injected messages are filtered against the half-pipe's
/// ordered callback list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    None,
    All,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterMode {
    fn keeps(self, callback_id: usize, value: usize) -> bool {
        match self {
            FilterMode::None => false,
            FilterMode::All => true,
            FilterMode::Lt => callback_id < value,
            FilterMode::Le => callback_id <= value,
            FilterMode::Gt => callback_id > value,
            FilterMode::Ge => callback_id >= value,
        }
    }
}

/// A simple token-bucket rate limiter for `--limit-rate`.
pub struct RateLimiter {
    hz: f64,
    state: std::sync::Mutex<RateLimiterState>,
}

struct RateLimiterState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(hz: f64) -> Self {
        Self {
            hz,
            state: std::sync::Mutex::new(RateLimiterState {
                tokens: 1.0,
                last: Instant::now(),
            }),
        }
    }

    /// Returns true if a message may pass right now, consuming a token.
    pub fn permit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.last = now;
        state.tokens = (state.tokens + elapsed * self.hz).min(1.0);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub type CallbackFn = Arc<dyn Fn(&mut Message) -> bool + Send + Sync>;

/// A stage-registered function invoked on each message flowing through a
/// half-pipe.
pub struct Callback {
    pub id: usize,
    pub stage_id: usize,
    pub enabled: Arc<AtomicBool>,
    pub order: i32,
    pub registration_index: usize,
    pub post: bool,
    pub type_filter: Vec<MessageType>,
    pub rate_limiter: Option<RateLimiter>,
    pub direction: Direction,
    pub func: CallbackFn,
}

impl Callback {
    fn type_matches(&self, kind: MessageType) -> bool {
        self.type_filter.is_empty() || self.type_filter.contains(&kind)
    }
}

/// A stage-registered injection point.
pub struct Input {
    pub id: usize,
    pub stage_id: usize,
    pub direction: Direction,
    pub filter_mode: FilterMode,
    pub filter_value: usize,
    pub reverse: bool,
    in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl Input {
    pub fn new(id: usize, stage_id: usize, direction: Direction, filter_mode: FilterMode, filter_value: usize) -> Self {
        Self {
            id,
            stage_id,
            direction,
            filter_mode,
            filter_value,
            reverse: matches!(direction, Direction::L),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Raised when a callback panics; the bus recovers the panic at the
/// boundary and reports it here so the runtime can mark the owning stage
/// fatal.
#[derive(Debug)]
pub struct CallbackPanic {
    pub stage_id: usize,
    pub message: String,
}

/// One directional lane (L or R) of the message bus.
pub struct HalfPipe {
    pub direction: Direction,
    callbacks: RwLock<Vec<Callback>>,
    inputs: RwLock<Vec<Arc<Input>>>,
    next_registration_index: AtomicUsize,
    seq: AtomicU64,
    input_open: AtomicBool,
    output_open: AtomicBool,
    output_tx: flume::Sender<Message>,
    output_rx: flume::Receiver<Message>,
    panics: (flume::Sender<CallbackPanic>, flume::Receiver<CallbackPanic>),
}

impl HalfPipe {
    pub fn new(direction: Direction) -> Self {
        assert!(direction.is_concrete());
        let (output_tx, output_rx) = flume::unbounded();
        Self {
            direction,
            callbacks: RwLock::new(Vec::new()),
            inputs: RwLock::new(Vec::new()),
            next_registration_index: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            input_open: AtomicBool::new(true),
            output_open: AtomicBool::new(true),
            output_tx,
            output_rx,
            panics: flume::unbounded(),
        }
    }

    pub fn add_callback(&self, mut callback: Callback) -> usize {
        let idx = self.next_registration_index.fetch_add(1, Ordering::SeqCst);
        callback.registration_index = idx;
        let id = callback.id;
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.push(callback);
        callbacks.sort_by(|a, b| {
            a.post
                .cmp(&b.post)
                .then(a.order.cmp(&b.order))
                .then(a.registration_index.cmp(&b.registration_index))
        });
        id
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }

    pub fn add_input(&self, input: Arc<Input>) {
        self.inputs.write().unwrap().push(input);
    }

    pub fn input_count(&self) -> usize {
        self.inputs.read().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<Arc<Input>> {
        self.inputs.read().unwrap().clone()
    }

    pub fn output_receiver(&self) -> flume::Receiver<Message> {
        self.output_rx.clone()
    }

    pub fn panic_receiver(&self) -> flume::Receiver<CallbackPanic> {
        self.panics.1.clone()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_input_open(&self) -> bool {
        self.input_open.load(Ordering::SeqCst)
    }

    pub fn is_output_open(&self) -> bool {
        self.output_open.load(Ordering::SeqCst)
    }

    pub fn close_input(&self) {
        self.input_open.store(false, Ordering::SeqCst);
    }

    pub fn close_output(&self) {
        self.output_open.store(false, Ordering::SeqCst);
    }

    /// Delivers a message that entered through `input`. Blocks the caller's task for the duration of
    /// the synchronous callback chain, then enqueues on the output if the
    /// message survives and matches this half-pipe's direction.
    pub async fn deliver_via_input(&self, input: &Input, mut msg: Message) {
        input.enter();
        msg.seq = self.next_seq();
        msg.context.input_id = Some(input.id);
        self.run_callbacks(&mut msg, input.filter_mode, input.filter_value);
        self.enqueue(msg).await;
        input.leave();
    }

    /// Delivers a message that did not arrive through a registered input
    /// (e.g. raw bytes off a TCP peer connection): runs the full callback
    /// list, equivalent to filter `ALL`.
    pub async fn deliver_default(&self, mut msg: Message) {
        msg.seq = self.next_seq();
        self.run_callbacks(&mut msg, FilterMode::All, 0);
        self.enqueue(msg).await;
    }

    fn run_callbacks(&self, msg: &mut Message, mode: FilterMode, value: usize) {
        let callbacks = self.callbacks.read().unwrap();
        for cb in callbacks.iter() {
            let effective_mode = if matches!(mode, FilterMode::None | FilterMode::All) {
                mode
            } else if mode.keeps(cb.id, value) {
                FilterMode::All
            } else {
                FilterMode::None
            };
            if !matches!(effective_mode, FilterMode::All) {
                continue;
            }
            if !cb.enabled.load(Ordering::SeqCst) {
                continue;
            }
            if !cb.type_matches(msg.kind) {
                continue;
            }
            if let Some(rl) = &cb.rate_limiter {
                if !rl.permit() {
                    continue;
                }
            }
            let func = cb.func.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| func(msg)));
            match result {
                Ok(true) => {}
                Ok(false) => msg.context.drop_message(),
                Err(payload) => {
                    msg.context.drop_message();
                    let message = panic_message(payload);
                    let _ = self.panics.0.send(CallbackPanic {
                        stage_id: cb.stage_id,
                        message,
                    });
                }
            }
        }
    }

    async fn enqueue(&self, msg: Message) {
        if msg.context.is_dropped() {
            return;
        }
        if msg.direction != self.direction {
            return;
        }
        if !self.output_open.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.output_tx.send_async(msg).await;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::sync::atomic::AtomicBool;

    fn enabled() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    fn cb(id: usize, order: i32, post: bool, func: CallbackFn) -> Callback {
        Callback {
            id,
            stage_id: id,
            enabled: enabled(),
            order,
            registration_index: 0,
            post,
            type_filter: vec![],
            rate_limiter: None,
            direction: Direction::R,
            func,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_respects_ge_filter() {
        let pipe = HalfPipe::new(Direction::R);
        let log = Arc::new(std::sync::Mutex::new(Vec::<usize>::new()));

        for id in 1..=3usize {
            let log = log.clone();
            pipe.add_callback(cb(
                id,
                id as i32,
                false,
                Arc::new(move |_m| {
                    log.lock().unwrap().push(id);
                    true
                }),
            ));
        }

        let input = Arc::new(Input::new(1, 2, Direction::R, FilterMode::Ge, 2));
        pipe.add_input(input.clone());

        let msg = Message::new(Direction::R, MessageType::Update, vec![1, 2, 3]);
        pipe.deliver_via_input(&input, msg).await;

        assert_eq!(*log.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn post_callbacks_run_after_default_of_equal_order() {
        let pipe = HalfPipe::new(Direction::R);
        let log = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        {
            let log = log.clone();
            pipe.add_callback(cb(
                1,
                5,
                true,
                Arc::new(move |_m| {
                    log.lock().unwrap().push("post");
                    true
                }),
            ));
        }
        {
            let log = log.clone();
            pipe.add_callback(cb(
                2,
                5,
                false,
                Arc::new(move |_m| {
                    log.lock().unwrap().push("default");
                    true
                }),
            ));
        }

        let msg = Message::new(Direction::R, MessageType::Update, vec![]);
        pipe.deliver_default(msg).await;

        assert_eq!(*log.lock().unwrap(), vec!["default", "post"]);
    }

    #[tokio::test]
    async fn dropped_message_does_not_reach_output_but_later_callbacks_still_run() {
        let pipe = HalfPipe::new(Direction::R);
        let seen = Arc::new(std::sync::Mutex::new(false));
        pipe.add_callback(cb(1, 1, false, Arc::new(|_m| false)));
        {
            let seen = seen.clone();
            pipe.add_callback(cb(
                2,
                2,
                false,
                Arc::new(move |_m| {
                    *seen.lock().unwrap() = true;
                    true
                }),
            ));
        }

        let msg = Message::new(Direction::R, MessageType::Update, vec![]);
        pipe.deliver_default(msg).await;

        assert!(*seen.lock().unwrap(), "later matching callbacks still see a dropped message");
        assert!(pipe.output_receiver().try_recv().is_err());
    }

    #[tokio::test]
    async fn panic_in_callback_is_contained_and_reported() {
        let pipe = HalfPipe::new(Direction::R);
        pipe.add_callback(cb(1, 1, false, Arc::new(|_m| panic!("boom"))));

        let msg = Message::new(Direction::R, MessageType::Update, vec![]);
        pipe.deliver_default(msg).await;

        let panic = pipe.panic_receiver().try_recv().expect("panic reported");
        assert_eq!(panic.stage_id, 1);
        assert!(pipe.output_receiver().try_recv().is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase() {
        let pipe = HalfPipe::new(Direction::R);
        let mut seqs = vec![];
        for _ in 0..5 {
            let msg = Message::new(Direction::R, MessageType::Update, vec![]);
            pipe.deliver_default(msg).await;
            seqs.push(pipe.output_receiver().try_recv().unwrap().seq);
        }
        for w in seqs.windows(2) {
            assert!(w[1] > w[0]);
        }
    }
}
