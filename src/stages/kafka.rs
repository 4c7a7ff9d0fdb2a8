//! RouteViews' live-updates topic, consumed as a plain Kafka source.
//! Grounded in the `rdkafka` crate's async `StreamConsumer`, the public
//! API the producer-side internals in the example pack sit underneath.

use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message as _};
use tokio::sync::Mutex;

use crate::error::KernelError;
use crate::message::{Direction, Message, MessageType};
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "routeviews-kafka",
        Arc::new(|args| {
            if args.len() < 2 {
                return Err(anyhow::anyhow!(
                    "routeviews-kafka: requires BROKERS and TOPIC arguments"
                ));
            }
            let options = StageOptions::producer()
                .with_args(vec!["brokers", "topic"])
                .with_descr("consumes a Kafka topic of opaque BGP update records")
                .with_usage("routeviews-kafka BROKERS TOPIC");
            Ok((
                Box::new(RouteViewsKafkaStage::new(args[0].clone(), args[1].clone())) as Box<dyn Stage>,
                options,
            ))
        }),
    );
}

pub struct RouteViewsKafkaStage {
    name: String,
    brokers: String,
    topic: String,
    consumer: Mutex<Option<StreamConsumer>>,
}

impl RouteViewsKafkaStage {
    pub fn new(brokers: String, topic: String) -> Self {
        Self {
            name: "routeviews-kafka".to_string(),
            brokers,
            topic,
            consumer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stage for RouteViewsKafkaStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        attach.add_primary_input(Direction::R);
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", "bgpipe")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;
        consumer.subscribe(&[self.topic.as_str()])?;
        tracing::info!(brokers = self.brokers.as_str(), topic = self.topic.as_str(), "subscribed");
        *self.consumer.lock().await = Some(consumer);
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        let input = run
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("routeviews-kafka: no input registered"))?;
        let guard = self.consumer.lock().await;
        let consumer = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("routeviews-kafka: run called before a successful prepare"))?;
        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(KernelError::StageStopped.into()),
                msg = consumer.recv() => {
                    let msg = msg?;
                    let body = msg.payload().unwrap_or(&[]).to_vec();
                    let out = Message::new(input.direction, MessageType::Update, body);
                    run.emit(&input, out).await;
                }
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
