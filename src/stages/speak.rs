//! Minimal BGP-shaped keepalive stub: on a timer, injects an opaque
//! keepalive-tagged message on its own behalf, and otherwise passes
//! through whatever the half-pipe hands it. Stands in for a real BGP
//! speaker (full open/update/notification state machine is out of
//! scope here); it exists to exercise a bidir stage that is both a
//! producer and a pure passthrough consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub fn register() {
    StageRegistry::register(
        "speak",
        Arc::new(|_args| {
            let options = StageOptions::producer()
                .bidir()
                .with_descr("emits a periodic keepalive and passes every other message through unchanged")
                .with_usage("speak");
            Ok((Box::new(SpeakStage::new()) as Box<dyn Stage>, options))
        }),
    );
}

fn concrete_direction(dir: Direction) -> Direction {
    match dir {
        Direction::LR => Direction::R,
        d => d,
    }
}

pub struct SpeakStage {
    name: String,
}

impl SpeakStage {
    pub fn new() -> Self {
        Self {
            name: "speak".to_string(),
        }
    }
}

impl Default for SpeakStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for SpeakStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(concrete_direction(attach.direction));
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("speak: no input registered"))?;
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
                _ = ticker.tick() => {
                    let msg = Message::new(input.direction, MessageType::Keepalive, vec![]);
                    run.emit(&input, msg).await;
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
