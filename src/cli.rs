//! Process entry-point glue: turns the assembled pipeline plus the global
//! options into a running coordinator, wires SIGINT, and picks the exit
//! code.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;

use crate::assembler::{self, GlobalOptions, PlannedStage};
use crate::bus::{Bus, FilterMode, HandlerPhase};
use crate::coordinator::{Coordinator, CoordinatorCounts};
use crate::error::{KernelError, Result};
use crate::message::Direction;
use crate::settings::Settings;
use crate::stage::{AttachHandle, StageRegistry, StageRuntime};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;

/// `--list-stages`/`--version` print directly to stdout and return
/// immediately, the only place this crate writes there.
pub fn print_version() {
    println!("bgpipe {}", env!("CARGO_PKG_VERSION"));
}

pub fn print_stage_words() {
    for word in StageRegistry::words() {
        println!("{word}");
    }
}

/// Builds the bus, coordinator, and every [`StageRuntime`] from `argv`,
/// then drives the whole pipeline to completion. Returns the process exit
/// code.
pub async fn run(argv: &[String], settings: &Settings) -> i32 {
    match run_inner(argv, settings).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            EXIT_FATAL
        }
    }
}

async fn run_inner(argv: &[String], settings: &Settings) -> Result<i32> {
    let (global, planned) = assembler::assemble(argv)?;
    run_parsed(global, planned, settings).await
}

async fn run_parsed(global: GlobalOptions, mut planned: Vec<PlannedStage>, settings: &Settings) -> Result<i32> {
    add_auto_stages(&global, &mut planned)?;

    let bus = Arc::new(Bus::new());
    wire_events_logger(&global, &bus);

    let counts = compute_counts(&planned);
    let coordinator = Coordinator::new(bus.clone(), counts);
    wire_kill_handler(&global, &bus, &coordinator);

    let cohorts = build_cohorts(&planned);
    let known_names: Vec<(String, usize)> = planned.iter().map(|p| (p.name.clone(), p.index)).collect();

    let mut runtimes = Vec::with_capacity(planned.len());
    let mut boxed = planned;
    for p in boxed.drain(..) {
        let running = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let next_input_id = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let new_filter = resolve_injection_point(&p, &known_names)?;

        let mut stage = p.stage;
        let mut attach = AttachHandle::new(
            p.index,
            p.direction,
            p.is_first,
            p.is_last,
            new_filter,
            bus.clone(),
            running.clone(),
            next_input_id,
        );
        stage.attach(&mut attach).map_err(crate::error::KernelError::Other)?;

        if p.options.filter_in && attach.callback_count() == 0 {
            return Err(crate::error::KernelError::NoCallbacks);
        }
        if (p.options.is_producer || p.options.filter_out) && attach.input_count() == 0 {
            return Err(crate::error::KernelError::NoInputs);
        }
        let stop_timeout = p.options.stop_timeout.unwrap_or(settings.stop_timeout);

        let cohort = cohorts
            .get(&p.wait_patterns)
            .cloned()
            .expect("every stage's pattern key was registered in build_cohorts");

        let runtime = Arc::new(StageRuntime::new(
            p.index,
            p.name,
            p.options,
            p.direction,
            p.is_first,
            p.is_last,
            Arc::from(stage),
            running,
            if p.wait_patterns.is_empty() {
                vec!["START".to_string()]
            } else {
                p.wait_patterns
            },
            p.stop_patterns,
            stop_timeout,
            attach.registered_inputs().to_vec(),
            cohort,
        ));
        runtimes.push(runtime);
    }

    let mut handles = Vec::with_capacity(runtimes.len());
    for rt in &runtimes {
        handles.push(tokio::spawn(rt.clone().drive(bus.clone(), coordinator.clone())));
    }

    bus.start_pipe();

    let sigint = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            coordinator.shutdown("interrupted");
        }
    });

    coordinator.wait().await;
    sigint.abort();
    for h in handles {
        let _ = h.await;
    }

    match coordinator.cause() {
        None => Ok(EXIT_OK),
        Some(cause) => {
            let stopped = cause
                .downcast_ref::<crate::error::StageError>()
                .map(|se| se.is_stage_stopped())
                .unwrap_or(false);
            if stopped {
                Ok(EXIT_OK)
            } else {
                tracing::error!("{cause}");
                Ok(EXIT_FATAL)
            }
        }
    }
}

/// Prepends the internal stdin/stdout stages the kernel attaches on the
/// user's behalf: explicitly via `--stdin`/`--stdout` (or their `-wait`
/// variants), or implicitly when the whole pipeline is a single stage
/// that neither produces nor consumes anything (otherwise such a
/// pipeline could never drain). Both land at index 0, `LR`, and outside
/// the first/last bookkeeping the real stages already resolved their
/// directions against.
fn add_auto_stages(global: &GlobalOptions, planned: &mut Vec<PlannedStage>) -> Result<()> {
    let single_stage_no_io = planned.len() == 1 && !planned[0].options.is_producer && !planned[0].options.is_consumer;

    if global.stdin {
        planned.insert(0, build_auto_stage("stdin", global.stdin_wait)?);
    }
    if global.stdout || single_stage_no_io {
        planned.insert(0, build_auto_stage("stdout", global.stdout_wait)?);
    }
    Ok(())
}

fn build_auto_stage(word: &str, wait: bool) -> Result<PlannedStage> {
    let factory = StageRegistry::lookup(word).ok_or_else(|| KernelError::StageCmd(word.to_string()))?;
    let (stage, options) = factory(&[]).map_err(KernelError::Other)?;
    let wait_patterns = if wait {
        crate::bus::canonical("ESTABLISHED", &[])
    } else {
        Vec::new()
    };
    Ok(PlannedStage {
        index: 0,
        name: word.to_string(),
        command: word.to_string(),
        options,
        stage,
        direction: Direction::LR,
        is_first: false,
        is_last: false,
        wait_patterns,
        stop_patterns: Vec::new(),
        new_spec: None,
        limit_rate_hz: None,
    })
}

/// `--events LIST`: logs every observed event matching the canonicalized
/// list, independent of any stage's own logging.
fn wire_events_logger(global: &GlobalOptions, bus: &Bus) {
    if global.events.is_empty() {
        return;
    }
    let patterns: Vec<String> = global
        .events
        .iter()
        .flat_map(|e| crate::bus::canonical(e, crate::bus::DEFAULT_SUFFIXES))
        .collect();
    bus.add_handler(
        patterns,
        HandlerPhase::Post,
        Arc::new(|ev| tracing::info!(event = ev.kind.as_str(), "event observed")),
    );
}

/// `--kill LIST`: shuts the whole pipeline down the moment any of the
/// listed events is observed, same as a SIGINT.
fn wire_kill_handler(global: &GlobalOptions, bus: &Bus, coordinator: &Arc<Coordinator>) {
    if global.kill.is_empty() {
        return;
    }
    let patterns: Vec<String> = global
        .kill
        .iter()
        .flat_map(|e| crate::bus::canonical(e, crate::bus::DEFAULT_SUFFIXES))
        .collect();
    let coordinator = coordinator.clone();
    bus.add_handler(
        patterns,
        HandlerPhase::Post,
        Arc::new(move |ev| {
            tracing::warn!(event = ev.kind.as_str(), "kill event observed, shutting down");
            coordinator.shutdown("kill event observed");
        }),
    );
}

fn compute_counts(planned: &[PlannedStage]) -> CoordinatorCounts {
    let mut counts = CoordinatorCounts::default();
    for p in planned {
        let (left, right) = match p.direction {
            Direction::L => (true, false),
            Direction::R => (false, true),
            Direction::LR => (true, true),
        };
        if p.options.is_producer && left {
            counts.l_write += 1;
        }
        if p.options.is_producer && right {
            counts.r_write += 1;
        }
        if p.options.is_consumer && right {
            counts.l_read += 1;
        }
        if p.options.is_consumer && left {
            counts.r_read += 1;
        }
    }
    counts
}

/// Groups stages sharing the same trigger-pattern key into barriers sized
/// to the group, so stages waiting on the same event release together.
fn build_cohorts(planned: &[PlannedStage]) -> std::collections::HashMap<Vec<String>, Arc<Barrier>> {
    let mut groups: std::collections::HashMap<Vec<String>, usize> = std::collections::HashMap::new();
    for p in planned {
        let key = if p.wait_patterns.is_empty() {
            vec!["START".to_string()]
        } else {
            p.wait_patterns.clone()
        };
        *groups.entry(key).or_insert(0) += 1;
    }
    groups
        .into_iter()
        .map(|(key, n)| (key, Arc::new(Barrier::new(n.max(1)))))
        .collect()
}

/// Resolves `--new` into a `(FilterMode, callback_id)` pair. `known_names`
/// maps every stage's name to its index, so `@name` references resolve to
/// the right callback id regardless of declaration order.
///
/// A stage attached to the L half-pipe sees callback ids running the
/// opposite way round (messages flow right-to-left through it), so its
/// injection point must use the reversed `Le`/`Lt` modes in place of the
/// forward `Ge`/`Gt` — the same `reverse` condition `Input::new` uses.
/// An unresolvable `@name` or non-numeric id is a hard error, not a
/// silent fallback to `next`.
fn resolve_injection_point(p: &PlannedStage, known_names: &[(String, usize)]) -> Result<(FilterMode, usize)> {
    let reverse = matches!(p.direction, Direction::L);
    match p.new_spec.as_deref() {
        None | Some("next") => Ok((if reverse { FilterMode::Le } else { FilterMode::Ge }, p.index)),
        Some("here") => Ok((if reverse { FilterMode::Lt } else { FilterMode::Gt }, p.index)),
        Some("first") => Ok((FilterMode::None, 0)),
        Some("last") => Ok((FilterMode::All, 0)),
        Some(other) => {
            let id = if let Some(named) = other.strip_prefix('@') {
                known_names
                    .iter()
                    .find(|(n, _)| n == named)
                    .map(|(_, i)| *i)
                    .ok_or(KernelError::Inject)?
            } else {
                other.parse::<usize>().map_err(|_| KernelError::Inject)?
            };
            Ok((if reverse { FilterMode::Le } else { FilterMode::Ge }, id))
        }
    }
}

/// Parses global options first so `--log LEVEL` can reach the logging
/// subscriber before it's initialized; only falls back to `Settings`/env
/// when the flag is absent (or argv fails to parse at all).
pub async fn init_and_run(argv: Vec<String>) -> i32 {
    let settings = Settings::from_env();
    match assembler::assemble(&argv) {
        Ok((global, planned)) => {
            let log_level = global.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
            crate::logging::init_logging(&log_level);
            match run_parsed(global, planned, &settings).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!("{e}");
                    EXIT_FATAL
                }
            }
        }
        Err(e) => {
            crate::logging::init_logging(&settings.log_level);
            tracing::error!("{e}");
            EXIT_FATAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(index: usize, direction: Direction, new_spec: Option<&str>) -> PlannedStage {
        PlannedStage {
            index,
            name: format!("s{index}"),
            command: "noop".to_string(),
            options: crate::stage::StageOptions::default(),
            stage: Box::new(NoopStage),
            direction,
            is_first: false,
            is_last: false,
            wait_patterns: Vec::new(),
            stop_patterns: Vec::new(),
            new_spec: new_spec.map(str::to_string),
            limit_rate_hz: None,
        }
    }

    struct NoopStage;

    #[async_trait::async_trait]
    impl crate::stage::Stage for NoopStage {
        fn name(&self) -> &str {
            "noop"
        }
        fn attach(&mut self, _attach: &mut AttachHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn prepare(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn run(&self, _run: crate::stage::RunHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_injection_uses_ge_on_r_but_le_on_l() {
        let r = stage(3, Direction::R, None);
        assert_eq!(resolve_injection_point(&r, &[]).unwrap(), (FilterMode::Ge, 3));

        let l = stage(3, Direction::L, None);
        assert_eq!(resolve_injection_point(&l, &[]).unwrap(), (FilterMode::Le, 3));
    }

    #[test]
    fn here_uses_gt_on_r_but_lt_on_l() {
        let r = stage(3, Direction::R, Some("here"));
        assert_eq!(resolve_injection_point(&r, &[]).unwrap(), (FilterMode::Gt, 3));

        let l = stage(3, Direction::L, Some("here"));
        assert_eq!(resolve_injection_point(&l, &[]).unwrap(), (FilterMode::Lt, 3));
    }

    #[test]
    fn named_reference_resolves_through_known_names() {
        let r = stage(3, Direction::R, Some("@upstream"));
        let known = vec![("upstream".to_string(), 1usize)];
        assert_eq!(resolve_injection_point(&r, &known).unwrap(), (FilterMode::Ge, 1));
    }

    #[test]
    fn unresolvable_name_is_an_error() {
        let r = stage(3, Direction::R, Some("@missing"));
        assert!(matches!(resolve_injection_point(&r, &[]), Err(KernelError::Inject)));
    }

    #[test]
    fn unparsable_numeric_id_is_an_error() {
        let r = stage(3, Direction::R, Some("garbage"));
        assert!(matches!(resolve_injection_point(&r, &[]), Err(KernelError::Inject)));
    }
}
