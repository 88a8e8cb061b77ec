//! Built-in `wordcount` module
//!
//! Extracts text lines, splits each into lowercase words and tallies them.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::EngineSettings;
use crate::pipeline::{Cluster, ExtractSink, Item, RunConfig};

pub const MODULE: &str = "wordcount";
pub const CLUSTER: &str = "words";

#[derive(Debug, Default)]
pub struct WordCount {
    lines: Vec<String>,
    tally: Mutex<BTreeMap<String, u64>>,
}

impl WordCount {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            tally: Mutex::new(BTreeMap::new()),
        }
    }

    /// Counts loaded so far
    pub fn tally(&self) -> BTreeMap<String, u64> {
        self.tally.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Cluster list for `Provisioner::register_module`
    pub fn module(self: &Arc<Self>) -> Vec<(String, Arc<dyn Cluster>)> {
        vec![(CLUSTER.to_string(), Arc::clone(self) as Arc<dyn Cluster>)]
    }

    /// Default run config for the `words` cluster
    pub fn config(settings: &EngineSettings) -> RunConfig {
        RunConfig::from_settings(CLUSTER, settings).with_workers(2, 1)
    }
}

#[async_trait]
impl Cluster for WordCount {
    async fn extract(&self, sink: ExtractSink) -> anyhow::Result<()> {
        for line in &self.lines {
            sink.push(json!(line)).await?;
        }
        Ok(())
    }

    async fn verify_extracted(&self, item: &Item) -> bool {
        item.as_str().is_some_and(|line| !line.trim().is_empty())
    }

    async fn transform(&self, item: Item) -> anyhow::Result<Option<Item>> {
        let line = item.as_str().context("wordcount expects string lines")?;
        let words: Vec<String> = line
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .map(|w| w.trim_matches('\'').to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!(words)))
    }

    async fn load(&self, item: Item) -> anyhow::Result<()> {
        let words: Vec<String> = serde_json::from_value(item)?;
        let mut tally = self.tally.lock().unwrap_or_else(|p| p.into_inner());
        for word in words {
            *tally.entry(word).or_default() += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transform_splits_and_lowercases() {
        let wc = WordCount::default();
        let out = wc.transform(json!("The cat's hat, the CAT!")).await.unwrap();
        assert_eq!(out, Some(json!(["the", "cat's", "hat", "the", "cat"])));

        assert_eq!(wc.transform(json!("... --- ...")).await.unwrap(), None);
        assert!(wc.transform(json!(42)).await.is_err());
    }

    #[tokio::test]
    async fn test_blank_lines_fail_verification() {
        let wc = WordCount::default();
        assert!(!wc.verify_extracted(&json!("   ")).await);
        assert!(wc.verify_extracted(&json!("a")).await);
    }

    #[tokio::test]
    async fn test_load_tallies() {
        let wc = WordCount::default();
        wc.load(json!(["a", "b", "a"])).await.unwrap();
        wc.load(json!(["b"])).await.unwrap();

        let tally = wc.tally();
        assert_eq!(tally.get("a"), Some(&2));
        assert_eq!(tally.get("b"), Some(&2));
    }
}
