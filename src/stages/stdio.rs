//! Mandatory stdin/stdout bridge. The simplest possible producer and
//! consumer: newline-delimited opaque bodies, no framing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "stdin",
        Arc::new(|_args| {
            let options = StageOptions {
                is_stdin: true,
                ..StageOptions::producer().bidir().with_descr("reads newline-delimited input from stdin")
            };
            Ok((Box::new(StdinStage::new()) as Box<dyn Stage>, options))
        }),
    );
    StageRegistry::register(
        "stdout",
        Arc::new(|_args| {
            let options = StageOptions {
                is_stdout: true,
                ..StageOptions::consumer().bidir().with_descr("writes one line per message to stdout")
            };
            Ok((Box::new(StdoutStage::new()) as Box<dyn Stage>, options))
        }),
    );
}

/// Resolves a stage's possibly-`LR` direction to the concrete sides it
/// should register inputs/outputs for.
fn concrete_sides(dir: Direction) -> Vec<Direction> {
    match dir {
        Direction::LR => vec![Direction::L, Direction::R],
        d => vec![d],
    }
}

pub struct StdinStage {
    name: String,
}

impl StdinStage {
    pub fn new() -> Self {
        Self {
            name: "stdin".to_string(),
        }
    }
}

impl Default for StdinStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for StdinStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        for dir in concrete_sides(attach.direction) {
            attach.add_primary_input(dir);
        }
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
            .ok_or_else(|| anyhow::anyhow!("stdin: no input registered"))?;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
                next = lines.next_line() => {
                    match next? {
                        Some(text) => {
                            let msg = Message::new(input.direction, MessageType::Unknown, text.into_bytes());
                            run.emit(&input, msg).await;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct StdoutStage {
    name: String,
}

impl StdoutStage {
    pub fn new() -> Self {
        Self {
            name: "stdout".to_string(),
        }
    }
}

impl Default for StdoutStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for StdoutStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, _attach: &mut AttachHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        let dirs = concrete_sides(run.direction);
        let rx_a = run.output_receiver(dirs[0]);
        let rx_b = dirs.get(1).map(|d| run.output_receiver(*d));
        let mut stdout = tokio::io::stdout();
        let mut a_done = false;
        let mut b_done = rx_b.is_none();
        loop {
            if a_done && b_done {
                return Ok(());
            }
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
                msg = rx_a.recv_async(), if !a_done => {
                    match msg {
                        Ok(m) => {
                            stdout.write_all(&m.body).await?;
                            stdout.write_all(b"\n").await?;
                        }
                        Err(_) => a_done = true,
                    }
                }
                msg = async { rx_b.as_ref().unwrap().recv_async().await }, if !b_done => {
                    match msg {
                        Ok(m) => {
                            stdout.write_all(&m.body).await?;
                            stdout.write_all(b"\n").await?;
                        }
                        Err(_) => b_done = true,
                    }
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_sides_expands_lr() {
        assert_eq!(concrete_sides(Direction::LR), vec![Direction::L, Direction::R]);
        assert_eq!(concrete_sides(Direction::L), vec![Direction::L]);
    }
}
