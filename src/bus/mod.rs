pub mod bus;
pub mod event;
pub mod halfpipe;

pub use bus::{inject, Bus};
pub use event::{canonical, parse_type_list, Event, EventHandler, HandlerPhase, DEFAULT_SUFFIXES};
pub use halfpipe::{Callback, CallbackFn, CallbackPanic, FilterMode, HalfPipe, Input, RateLimiter};
