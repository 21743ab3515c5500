use std::collections::HashMap;

use conveyor_core::{
    CancelReason, ItemResult, Pipeline, PipelineConfig, PipelineExit, Stage, StageContext,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// What travels through the word-count pipeline. Each stage turns one
/// variant into the next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    Line(String),
    Words(Vec<String>),
    Tally(HashMap<String, u64>),
}

impl Chunk {
    fn kind(&self) -> &'static str {
        match self {
            Chunk::Line(_) => "line",
            Chunk::Words(_) => "words",
            Chunk::Tally(_) => "tally",
        }
    }
}

pub struct Normalize;

impl Stage<Chunk> for Normalize {
    fn name(&self) -> &str {
        "normalize"
    }

    fn process(&self, _ctx: &StageContext, item: Chunk) -> anyhow::Result<Chunk> {
        match item {
            Chunk::Line(line) => Ok(Chunk::Line(line.trim().to_lowercase())),
            other => anyhow::bail!("normalize expects a line, got {}", other.kind()),
        }
    }
}

/// Splits on anything that is not alphanumeric or an apostrophe.
pub struct Tokenize;

impl Stage<Chunk> for Tokenize {
    fn name(&self) -> &str {
        "tokenize"
    }

    fn process(&self, ctx: &StageContext, item: Chunk) -> anyhow::Result<Chunk> {
        let line = match item {
            Chunk::Line(line) => line,
            other => anyhow::bail!("tokenize expects a line, got {}", other.kind()),
        };
        let words: Vec<String> = line
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .map(|w| w.trim_matches('\''))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        log::trace!(
            "tokenize[{}]: item {:?} has {} words",
            ctx.worker(),
            ctx.item_id(),
            words.len()
        );
        Ok(Chunk::Words(words))
    }
}

pub struct Tally;

impl Stage<Chunk> for Tally {
    fn name(&self) -> &str {
        "tally"
    }

    fn process(&self, _ctx: &StageContext, item: Chunk) -> anyhow::Result<Chunk> {
        let words = match item {
            Chunk::Words(words) => words,
            other => anyhow::bail!("tally expects words, got {}", other.kind()),
        };
        let mut counts = HashMap::new();
        for word in words {
            *counts.entry(word).or_insert(0) += 1;
        }
        Ok(Chunk::Tally(counts))
    }
}

pub fn build_pipeline(
    config: &PipelineConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<Pipeline<Chunk>> {
    Pipeline::builder()
        .id("wordcount")
        .config(config.clone())
        .parent(shutdown)
        .stage(Normalize)
        .stage(Tokenize)
        .stage(Tally)
        .build()
}

/// Running totals over the results of one run.
#[derive(Debug, Default)]
pub struct WordCount {
    lines: u64,
    failed: u64,
    counts: HashMap<String, u64>,
}

impl WordCount {
    pub fn add(&mut self, result: ItemResult<Chunk>) {
        self.lines += 1;
        match (result.value, result.error) {
            (Some(Chunk::Tally(counts)), _) => {
                for (word, n) in counts {
                    *self.counts.entry(word).or_insert(0) += n;
                }
            }
            (_, Some(error)) => {
                log::warn!("line {} skipped: {}", result.item_id, error);
                self.failed += 1;
            }
            (value, None) => {
                log::warn!("line {} produced {:?} instead of a tally", result.item_id, value);
                self.failed += 1;
            }
        }
    }

    pub async fn collect(results: impl Stream<Item = ItemResult<Chunk>>) -> Self {
        let mut count = Self::default();
        futures::pin_mut!(results);
        while let Some(result) = results.next().await {
            count.add(result);
        }
        count
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn unique(&self) -> usize {
        self.counts.len()
    }

    /// Most frequent words first, ties broken alphabetically. `n == 0`
    /// returns every word.
    pub fn top(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> =
            self.counts.iter().map(|(w, c)| (w.clone(), *c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if n > 0 {
            entries.truncate(n);
        }
        entries
    }

    pub fn report(&self, top: usize, exit: &PipelineExit) -> Report {
        Report {
            lines: self.lines,
            failed_lines: self.failed,
            total_words: self.total(),
            unique_words: self.unique(),
            top: self
                .top(top)
                .into_iter()
                .map(|(word, count)| Entry { word, count })
                .collect(),
            outcome: describe(exit),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Entry {
    pub word: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub lines: u64,
    pub failed_lines: u64,
    pub total_words: u64,
    pub unique_words: usize,
    pub top: Vec<Entry>,
    pub outcome: String,
}

impl Report {
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "lines: {} ({} failed)\nwords: {} total, {} unique\n",
            self.lines, self.failed_lines, self.total_words, self.unique_words
        );
        let width = self.top.iter().map(|e| e.word.len()).max().unwrap_or(0);
        for entry in &self.top {
            out.push_str(&format!("{:<width$}  {}\n", entry.word, entry.count, width = width));
        }
        out.push_str(&format!("outcome: {}\n", self.outcome));
        out
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn describe(exit: &PipelineExit) -> String {
    match exit {
        PipelineExit::Completed => "completed".to_string(),
        PipelineExit::Cancelled(CancelReason::Shutdown) => "interrupted".to_string(),
        PipelineExit::Cancelled(reason) => format!("cancelled ({})", reason),
        PipelineExit::ForceStopped(reason) => format!("force stopped ({}), partial counts", reason),
    }
}

#[cfg(test)]
#[path = "words_test.rs"]
mod words_test;
