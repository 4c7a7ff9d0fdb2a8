//! Pure bus-callback stages: no inputs, no run loop doing real work, just
//! a registered callback that inspects or rewrites each message in place.
//! Written as synchronous callbacks rather than async per-message tasks,
//! since the bus already runs callbacks synchronously on the injecting
//! stage's task.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::KernelError;
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "grep",
        Arc::new(|args| {
            let pattern = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("grep: requires a pattern argument"))?;
            let re = Regex::new(&pattern)?;
            let options = StageOptions::default()
                .filter_in()
                .bidir()
                .with_args(vec!["pattern"])
                .with_descr("drops messages whose body does not match a regular expression")
                .with_usage("grep PATTERN");
            Ok((Box::new(GrepStage::new(re)) as Box<dyn Stage>, options))
        }),
    );
    StageRegistry::register(
        "tag",
        Arc::new(|args| {
            if args.len() < 2 {
                return Err(anyhow::anyhow!("tag: requires a pattern and a tag name argument"));
            }
            let re = Regex::new(&args[0])?;
            let options = StageOptions::default()
                .filter_in()
                .bidir()
                .with_args(vec!["pattern", "tag"])
                .with_descr("tags messages matching a regular expression")
                .with_usage("tag PATTERN TAG");
            Ok((
                Box::new(TagStage::new(re, args[1].clone())) as Box<dyn Stage>,
                options,
            ))
        }),
    );
    StageRegistry::register(
        "modify",
        Arc::new(|args| {
            if args.len() < 2 {
                return Err(anyhow::anyhow!("modify: requires a pattern and a replacement argument"));
            }
            let re = Regex::new(&args[0])?;
            let options = StageOptions::default()
                .filter_in()
                .bidir()
                .with_args(vec!["pattern", "replacement"])
                .with_descr("rewrites message bodies matching a regular expression")
                .with_usage("modify PATTERN REPLACEMENT");
            Ok((
                Box::new(ModifyStage::new(re, args[1].clone())) as Box<dyn Stage>,
                options,
            ))
        }),
    );
}

/// Shared by every filter stage here: registers one callback, then just
/// waits to be cancelled since the bus drives the callback directly.
async fn wait_for_stop(mut run: RunHandle) -> anyhow::Result<()> {
    run.cancel.cancelled().await;
    Err(KernelError::StageStopped.into())
}

pub struct GrepStage {
    name: String,
    pattern: Regex,
}

impl GrepStage {
    pub fn new(pattern: Regex) -> Self {
        Self {
            name: "grep".to_string(),
            pattern,
        }
    }
}

#[async_trait]
impl Stage for GrepStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        let pattern = self.pattern.clone();
        attach.add_callback(
            0,
            false,
            vec![],
            None,
            Arc::new(move |msg| pattern.is_match(&String::from_utf8_lossy(&msg.body))),
        );
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, run: RunHandle) -> anyhow::Result<()> {
        wait_for_stop(run).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TagStage {
    name: String,
    pattern: Regex,
    tag: String,
}

impl TagStage {
    pub fn new(pattern: Regex, tag: String) -> Self {
        Self {
            name: "tag".to_string(),
            pattern,
            tag,
        }
    }
}

#[async_trait]
impl Stage for TagStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        let pattern = self.pattern.clone();
        let tag = self.tag.clone();
        attach.add_callback(
            0,
            false,
            vec![],
            None,
            Arc::new(move |msg| {
                if let Some(m) = pattern.find(&String::from_utf8_lossy(&msg.body)) {
                    msg.context.tags.insert(tag.clone(), m.as_str().to_string());
                }
                true
            }),
        );
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, run: RunHandle) -> anyhow::Result<()> {
        wait_for_stop(run).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ModifyStage {
    name: String,
    pattern: Regex,
    replacement: String,
}

impl ModifyStage {
    pub fn new(pattern: Regex, replacement: String) -> Self {
        Self {
            name: "modify".to_string(),
            pattern,
            replacement,
        }
    }
}

#[async_trait]
impl Stage for ModifyStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        let pattern = self.pattern.clone();
        let replacement = self.replacement.clone();
        attach.add_callback(
            0,
            false,
            vec![],
            None,
            Arc::new(move |msg| {
                let text = String::from_utf8_lossy(&msg.body);
                let rewritten = pattern.replace_all(&text, replacement.as_str());
                msg.body = rewritten.into_owned().into_bytes();
                true
            }),
        );
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, run: RunHandle) -> anyhow::Result<()> {
        wait_for_stop(run).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, Message, MessageType};

    #[test]
    fn grep_callback_drops_non_matching() {
        let re = Regex::new("UPDATE").unwrap();
        let func: crate::bus::CallbackFn = Arc::new(move |msg| re.is_match(&String::from_utf8_lossy(&msg.body)));
        let mut msg = Message::new(Direction::L, MessageType::Unknown, b"KEEPALIVE".to_vec());
        assert!(!func(&mut msg));
        let mut msg = Message::new(Direction::L, MessageType::Unknown, b"UPDATE".to_vec());
        assert!(func(&mut msg));
    }
}
