//! TCP connector and listener, length-prefixed framing. A BGP TCP peer
//! is both a producer and a consumer, so both sides of the half-pipe
//! are driven from the same socket concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "connect",
        Arc::new(|args| {
            let addr = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("connect: requires an address argument"))?;
            let options = StageOptions::producer()
                .bidir()
                .with_args(vec!["addr"])
                .with_descr("connects to a TCP peer and exchanges length-prefixed messages")
                .with_usage("connect ADDR:PORT");
            let options = StageOptions {
                is_consumer: true,
                ..options
            };
            Ok((Box::new(ConnectStage::new(addr)) as Box<dyn Stage>, options))
        }),
    );
    StageRegistry::register(
        "listen",
        Arc::new(|args| {
            let bind = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("listen: requires a bind address argument"))?;
            let options = StageOptions::producer()
                .bidir()
                .with_args(vec!["bind"])
                .with_descr("accepts one TCP connection and exchanges length-prefixed messages")
                .with_usage("listen :PORT");
            let options = StageOptions {
                is_consumer: true,
                ..options
            };
            Ok((Box::new(ListenStage::new(bind)) as Box<dyn Stage>, options))
        }),
    );
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Drives one already-connected socket: reads frames into the bus via
/// `input`, and forwards whatever the half-pipe's output produces back
/// onto the wire, until cancelled or the peer closes.
async fn drive_socket(mut stream: TcpStream, mut run: RunHandle, input: Arc<crate::bus::Input>) -> anyhow::Result<()> {
    let dir = input.direction;
    let rx = run.output_receiver(dir);
    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
            frame = read_frame(&mut stream) => {
                match frame {
                    Ok(body) => {
                        let msg = Message::new(dir, MessageType::Unknown, body);
                        run.emit(&input, msg).await;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            out = rx.recv_async() => {
                match out {
                    Ok(m) => write_frame(&mut stream, &m.body).await?,
                    Err(_) => return Ok(()),
                }
            }
        }
    }
}

fn concrete_direction(dir: Direction) -> Direction {
    match dir {
        Direction::LR => Direction::R,
        d => d,
    }
}

pub struct ConnectStage {
    name: String,
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl ConnectStage {
    pub fn new(addr: String) -> Self {
        Self {
            name: "connect".to_string(),
            addr,
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stage for ConnectStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(concrete_direction(attach.direction));
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect {}: timed out", self.addr))??;
        tracing::info!(addr = self.addr.as_str(), "connected");
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn run(&self, run: RunHandle) -> anyhow::Result<()> {
        let stream = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("connect: run called before a successful prepare"))?;
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connect: no input registered"))?;
        drive_socket(stream, run, input).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(stream) = self.stream.lock().await.as_mut() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

pub struct ListenStage {
    name: String,
    bind: String,
    stream: Mutex<Option<TcpStream>>,
}

impl ListenStage {
    pub fn new(bind: String) -> Self {
        Self {
            name: "listen".to_string(),
            bind,
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stage for ListenStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(concrete_direction(attach.direction));
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let bind = if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        };
        let listener = TcpListener::bind(&bind).await?;
        tracing::info!(bind = bind.as_str(), "listening");
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "accepted connection");
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn run(&self, run: RunHandle) -> anyhow::Result<()> {
        let stream = self
            .stream
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("listen: run called before a successful prepare"))?;
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("listen: no input registered"))?;
        drive_socket(stream, run, input).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(stream) = self.stream.lock().await.as_mut() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}
