//! Raw file reader/writer, standing in for the out-of-scope MRT/JSON
//! readers. Same newline-delimited framing as `stdio.rs`, the only
//! difference being the source/sink is a path instead of a standard
//! stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

/// The assembler prepends a `--mrt`/`--json` format hint when a bare path
/// on the command line resolved to `read`; the body stays opaque either
/// way, so the hint is accepted and otherwise ignored.
fn strip_format_hint(args: &[String]) -> Option<&String> {
    args.iter().find(|a| !a.starts_with("--"))
}

pub fn register() {
    StageRegistry::register(
        "read",
        Arc::new(|args| {
            let path = strip_format_hint(args)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("read: requires a file path argument"))?;
            let options = StageOptions::producer()
                .with_args(vec!["path"])
                .with_descr("reads newline-delimited records from a file")
                .with_usage("read [--mrt|--json] PATH");
            Ok((Box::new(ReadStage::new(path)) as Box<dyn Stage>, options))
        }),
    );
    StageRegistry::register(
        "write",
        Arc::new(|args| {
            let path = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("write: requires a file path argument"))?;
            let options = StageOptions::consumer()
                .with_args(vec!["path"])
                .with_descr("writes one line per message to a file")
                .with_usage("write PATH");
            Ok((Box::new(WriteStage::new(path)) as Box<dyn Stage>, options))
        }),
    );
}

pub struct ReadStage {
    name: String,
    path: String,
    file: Mutex<Option<File>>,
}

impl ReadStage {
    pub fn new(path: String) -> Self {
        Self {
            name: "read".to_string(),
            path,
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stage for ReadStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(attach.direction);
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let file = File::open(&self.path).await?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("read: no input registered"))?;
        let file = self
            .file
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("read: run called before a successful prepare"))?;
        let mut lines = BufReader::new(file).lines();
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

pub struct WriteStage {
    name: String,
    path: String,
}

impl WriteStage {
    pub fn new(path: String) -> Self {
        Self {
            name: "write".to_string(),
            path,
        }
    }
}

#[async_trait]
impl Stage for WriteStage {
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
        let dir = match run.direction {
            Direction::LR => Direction::R,
            d => d,
        };
        let rx = run.output_receiver(dir);
        let mut file = File::create(&self.path).await?;
        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
                msg = rx.recv_async() => {
                    match msg {
                        Ok(m) => {
                            file.write_all(&m.body).await?;
                            file.write_all(b"\n").await?;
                        }
                        Err(_) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
