//! Tags messages against a tiny in-memory ROA table. Real RPKI validation
//! needs a relying-party cache talking rtr; this stage only exists to
//! give the kernel a second kind of tagging stage to drive through its
//! callback machinery, so the table is loaded from a flat file of
//! `PREFIX ASN` pairs rather than fetched from anywhere.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KernelError;
use crate::stage::{AttachHandle, RunHandle, Stage, StageOptions, StageRegistry};

pub fn register() {
    StageRegistry::register(
        "rpki",
        Arc::new(|args| {
            let path = args
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("rpki: requires a ROA table path argument"))?;
            let options = StageOptions::default()
                .filter_in()
                .bidir()
                .with_args(vec!["roa_table"])
                .with_descr("tags messages as roa-valid/roa-invalid/roa-unknown against a flat ROA table")
                .with_usage("rpki ROA_TABLE_PATH");
            Ok((Box::new(RpkiStage::new(path)) as Box<dyn Stage>, options))
        }),
    );
}

/// `PREFIX -> expected origin ASN`. A message body of `"PREFIX ASN"` is
/// looked up directly; anything else is tagged `roa-unknown`.
fn load_roa_table(text: &str) -> HashMap<String, u32> {
    let mut table = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let (Some(prefix), Some(asn)) = (parts.next(), parts.next()) {
            if let Ok(asn) = asn.parse::<u32>() {
                table.insert(prefix.to_string(), asn);
            }
        }
    }
    table
}

pub struct RpkiStage {
    name: String,
    path: String,
    table: Arc<std::sync::Mutex<HashMap<String, u32>>>,
}

impl RpkiStage {
    pub fn new(path: String) -> Self {
        Self {
            name: "rpki".to_string(),
            path,
            table: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Stage for RpkiStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, attach: &mut AttachHandle) -> anyhow::Result<()> {
        let table = self.table.clone();
        attach.add_callback(
            0,
            false,
            vec![],
            None,
            Arc::new(move |msg| {
                let text = String::from_utf8_lossy(&msg.body);
                let mut parts = text.split_whitespace();
                let verdict = match (parts.next(), parts.next()) {
                    (Some(prefix), Some(asn)) => match (table.lock().unwrap().get(prefix), asn.parse::<u32>()) {
                        (Some(expected), Ok(asn)) if *expected == asn => "roa-valid",
                        (Some(_), Ok(_)) => "roa-invalid",
                        _ => "roa-unknown",
                    },
                    _ => "roa-unknown",
                };
                msg.context.tags.insert("rpki".to_string(), verdict.to_string());
                true
            }),
        );
        Ok(())
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        *self.table.lock().unwrap() = load_roa_table(&text);
        Ok(())
    }

    async fn run(&self, mut run: RunHandle) -> anyhow::Result<()> {
        run.cancel.cancelled().await;
        Err(KernelError::StageStopped.into())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_asn_pairs_and_skips_comments() {
        let table = load_roa_table("# comment\n10.0.0.0/8 65000\n\nbad-line\n");
        assert_eq!(table.get("10.0.0.0/8"), Some(&65000));
        assert_eq!(table.len(), 1);
    }
}
