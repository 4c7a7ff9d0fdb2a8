//! Handles passed to a [`super::Stage`] during `attach` and `run`, the only
//! way a stage ever touches the bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bus::{self, Bus, CallbackFn, FilterMode, HandlerFn, HandlerPhase, Input};
use crate::message::{Direction, Message, MessageType};

use super::runtime::StageCancel;

/// Passed to `Stage::attach`. Registers callbacks, inputs, and event
/// handlers on the bus for this stage's resolved direction.
pub struct AttachHandle {
    pub index: usize,
    pub direction: Direction,
    pub is_first: bool,
    pub is_last: bool,
    /// The `--new` injection point resolved by the assembler for this
    /// stage's primary input.
    pub new_filter: (FilterMode, usize),
    bus: Arc<Bus>,
    running: Arc<AtomicBool>,
    next_input_id: Arc<AtomicUsize>,
    callback_count: usize,
    input_count: usize,
    inputs: Vec<Arc<Input>>,
}

impl AttachHandle {
    pub fn new(
        index: usize,
        direction: Direction,
        is_first: bool,
        is_last: bool,
        new_filter: (FilterMode, usize),
        bus: Arc<Bus>,
        running: Arc<AtomicBool>,
        next_input_id: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            index,
            direction,
            is_first,
            is_last,
            new_filter,
            bus,
            running,
            next_input_id,
            callback_count: 0,
            input_count: 0,
            inputs: Vec::new(),
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn callback_count(&self) -> usize {
        self.callback_count
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn registered_inputs(&self) -> &[Arc<Input>] {
        &self.inputs
    }

    /// Registers a callback on this stage's resolved direction (both
    /// half-pipes if `LR`). `order` lower runs earlier; ties broken by
    /// registration order. `post` callbacks run after the default ones of
    /// equal order.
    #[allow(clippy::too_many_arguments)]
    pub fn add_callback(
        &mut self,
        order: i32,
        post: bool,
        type_filter: Vec<MessageType>,
        rate_limit_hz: Option<f64>,
        func: CallbackFn,
    ) -> usize {
        let id = self.bus.add_callback(
            self.direction,
            self.index,
            self.running.clone(),
            order,
            post,
            type_filter,
            rate_limit_hz,
            func,
        );
        self.callback_count += 1;
        id
    }

    /// Registers an injection point with an explicit filter (for stages
    /// that need more than their primary `--new`-resolved input).
    pub fn add_input_with(&mut self, dir: Direction, mode: FilterMode, value: usize) -> Arc<Input> {
        let id = self.next_input_id.fetch_add(1, Ordering::SeqCst);
        let input = Arc::new(Input::new(id, self.index, dir, mode, value));
        self.bus.add_input(input.clone());
        self.input_count += 1;
        self.inputs.push(input.clone());
        input
    }

    /// Registers the stage's primary input using the `--new`-resolved
    /// filter.
    pub fn add_primary_input(&mut self, dir: Direction) -> Arc<Input> {
        let (mode, value) = self.new_filter;
        self.add_input_with(dir, mode, value)
    }

    pub fn add_handler(&mut self, patterns: Vec<String>, phase: HandlerPhase, func: HandlerFn) {
        self.bus.add_handler(patterns, phase, func);
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

/// Passed to `Stage::run`. Gives a running stage access to the bus, its
/// own registered inputs, the half-pipe output(s) it should drain, and its
/// cancellation context.
#[derive(Clone)]
pub struct RunHandle {
    pub index: usize,
    pub name: String,
    pub direction: Direction,
    bus: Arc<Bus>,
    inputs: Vec<Arc<Input>>,
    pub cancel: StageCancel,
}

impl RunHandle {
    pub fn new(
        index: usize,
        name: String,
        direction: Direction,
        bus: Arc<Bus>,
        inputs: Vec<Arc<Input>>,
        cancel: StageCancel,
    ) -> Self {
        Self {
            index,
            name,
            direction,
            bus,
            inputs,
            cancel,
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn inputs(&self) -> &[Arc<Input>] {
        &self.inputs
    }

    /// The first registered input for the given concrete direction, if
    /// any — the common case for a producer stage with one primary input.
    pub fn input_for(&self, dir: Direction) -> Option<&Arc<Input>> {
        self.inputs.iter().find(|i| i.direction == dir)
    }

    /// The output queue of the half-pipe for `dir`, for consumer stages.
    pub fn output_receiver(&self, dir: Direction) -> flume::Receiver<Message> {
        self.bus.half_pipe(dir).output_receiver()
    }

    /// Injects `msg` through `input`, running its effective callback chain.
    pub async fn emit(&self, input: &Input, msg: Message) {
        bus::inject(&self.bus, input, msg).await;
    }
}
