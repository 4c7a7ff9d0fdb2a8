//! Subprocess bridge: spawns a child process, feeds it one line per
//! message on stdin, and re-injects whatever it prints on stdout as new
//! messages. Grounded in the command/pipe management idiom of the
//! `subprocess` crate's pipeline builder, adapted to `tokio::process`
//! since everything else in this crate is async.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "exec",
        Arc::new(|args| {
            if args.is_empty() {
                return Err(anyhow::anyhow!("exec: requires a command and optional arguments"));
            }
            let options = StageOptions::producer()
                .bidir()
                .with_args(vec!["command"])
                .with_descr("pipes messages through a child process' stdin/stdout")
                .with_usage("exec COMMAND [ARGS...]");
            let options = StageOptions {
                is_consumer: true,
                ..options
            };
            Ok((
                Box::new(ExecStage::new(args.to_vec())) as Box<dyn Stage>,
                options,
            ))
        }),
    );
}

fn concrete_direction(dir: Direction) -> Direction {
    match dir {
        Direction::LR => Direction::R,
        d => d,
    }
}

pub struct ExecStage {
    name: String,
    argv: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ExecStage {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            name: "exec".to_string(),
            argv,
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stage for ExecStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(concrete_direction(attach.direction));
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let (cmd, rest) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("exec: empty command"))?;
        let child = Command::new(cmd)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(command = cmd.as_str(), "spawned child process");
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("exec: no input registered"))?;
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("exec: run called before a successful prepare"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("exec: child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("exec: child stdout not piped"))?;
        let mut lines = BufReader::new(stdout).lines();

        let dir = input.direction;
        let rx = run.output_receiver(dir);

        let outcome = loop {
            tokio::select! {
                _ = run.cancel.cancelled() => break Err(KernelError::StageStopped.into()),
                next = lines.next_line() => {
                    match next {
                        Ok(Some(text)) => {
                            let msg = Message::new(dir, MessageType::Unknown, text.into_bytes());
                            run.emit(&input, msg).await;
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e.into()),
                    }
                }
                out = rx.recv_async() => {
                    match out {
                        Ok(m) => {
                            if let Err(e) = stdin.write_all(&m.body).await {
                                break Err(e.into());
                            }
                            if let Err(e) = stdin.write_all(b"\n").await {
                                break Err(e.into());
                            }
                        }
                        Err(_) => break Ok(()),
                    }
                }
            }
        };

        let _ = child.start_kill();
        outcome
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
        Ok(())
    }
}
