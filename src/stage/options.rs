//! Stage-declared option fields.

use std::time::Duration;

/// Declared once at construction time; the kernel consults these during
/// attach to resolve direction, validate the pipeline shape, and size the
/// coordinator's waitgroups.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub is_producer: bool,
    pub is_consumer: bool,
    pub is_stdin: bool,
    pub is_stdout: bool,
    /// Whether this stage may legally resolve to direction `LR`.
    pub bidir: bool,
    /// Whether this stage must register at least one callback (a pure
    /// filter stage with no callbacks is a configuration error).
    pub filter_in: bool,
    /// Whether this stage must register at least one input.
    pub filter_out: bool,
    /// Names of required leading positional arguments.
    pub args: Vec<&'static str>,
    /// Whether trailing words after `--` are captured into a list instead
    /// of rejoining the outer argument stream as the next stage spec.
    pub absorb_rest: bool,
    pub descr: &'static str,
    pub usage: &'static str,
    pub stop_timeout: Option<Duration>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            is_producer: false,
            is_consumer: false,
            is_stdin: false,
            is_stdout: false,
            bidir: false,
            filter_in: false,
            filter_out: false,
            args: Vec::new(),
            absorb_rest: false,
            descr: "",
            usage: "",
            stop_timeout: None,
        }
    }
}

impl StageOptions {
    pub fn producer() -> Self {
        Self {
            is_producer: true,
            ..Default::default()
        }
    }

    pub fn consumer() -> Self {
        Self {
            is_consumer: true,
            ..Default::default()
        }
    }

    pub fn with_descr(mut self, descr: &'static str) -> Self {
        self.descr = descr;
        self
    }

    pub fn with_usage(mut self, usage: &'static str) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_args(mut self, args: Vec<&'static str>) -> Self {
        self.args = args;
        self
    }

    pub fn bidir(mut self) -> Self {
        self.bidir = true;
        self
    }

    pub fn filter_in(mut self) -> Self {
        self.filter_in = true;
        self
    }

    pub fn filter_out(mut self) -> Self {
        self.filter_out = true;
        self
    }
}
