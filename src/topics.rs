//! Topic snippet sources.
//!
//! A topic is reference text selected by an external rule-based router and
//! identified by name. The context assembler asks a [`TopicSource`] for the
//! text of each matched topic.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;

#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn load_topic_text(&self, topic: &str) -> Result<String>;
}

/// Reads `<dir>/<topic>.txt` or `<dir>/<topic>.md`.
///
/// The topic name is tried as given and then slugified (lowercase, runs of
/// non-alphanumerics replaced by `_`).
pub struct DirTopicSource {
    dir: PathBuf,
}

impl DirTopicSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, topic: &str) -> Vec<PathBuf> {
        let mut stems = vec![topic.to_string()];
        let slug = slugify(topic);
        if slug != topic {
            stems.push(slug);
        }
        stems
            .iter()
            .flat_map(|s| ["txt", "md"].map(|ext| self.dir.join(format!("{}.{}", s, ext))))
            .collect()
    }
}

#[async_trait]
impl TopicSource for DirTopicSource {
    async fn load_topic_text(&self, topic: &str) -> Result<String> {
        if topic.trim().is_empty() || topic.contains(['/', '\\']) || topic.contains("..") {
            bail!("invalid topic name: {:?}", topic);
        }
        for path in self.candidates(topic) {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => return Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        bail!("no topic file for {:?} in {}", topic, self.dir.display())
    }
}

/// In-memory topics, keyed by exact name.
#[derive(Default)]
pub struct MapTopicSource {
    topics: HashMap<String, String>,
}

impl MapTopicSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, text: &str) -> Self {
        self.topics.insert(name.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl TopicSource for MapTopicSource {
    async fn load_topic_text(&self, topic: &str) -> Result<String> {
        match self.topics.get(topic) {
            Some(text) => Ok(text.clone()),
            None => bail!("unknown topic: {:?}", topic),
        }
    }
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}
