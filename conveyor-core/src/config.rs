use std::{path::Path, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

/// Token bucket settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub capacity: usize,
    // milliseconds on the wire under either name
    #[serde(
        rename = "refill_interval_ms",
        alias = "refill_interval",
        with = "duration_ms"
    )]
    pub refill_interval: Duration,
}

impl LimiterConfig {
    pub fn new(capacity: usize, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
        }
    }

    /// `rate` tokens per second with a burst of `rate`.
    pub fn per_second(rate: u32) -> Self {
        let rate = rate.max(1);
        Self {
            capacity: rate as usize,
            refill_interval: Duration::from_secs(1) / rate,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::per_second(100)
    }
}

/// Plain description of a pipeline run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub stage_count: usize,
    pub fanout_width_per_stage: Vec<usize>,
    pub limiter: LimiterConfig,
    pub fatal_on_stage_error: bool,
    /// Buffer size of every hop between stages and of the result channel.
    pub channel_capacity: usize,
    /// Wall-clock budget for the whole run.
    #[serde(rename = "deadline_ms", alias = "deadline", with = "duration_ms_opt")]
    pub deadline: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_count: 0,
            fanout_width_per_stage: Vec::new(),
            limiter: LimiterConfig::default(),
            fatal_on_stage_error: false,
            channel_capacity: 16,
            deadline: None,
        }
    }
}

impl PipelineConfig {
    /// One stage per entry of `widths`, everything else default.
    pub fn with_widths(widths: &[usize]) -> Self {
        Self {
            stage_count: widths.len(),
            fanout_width_per_stage: widths.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_fatal_errors(mut self, fatal: bool) -> Self {
        self.fatal_on_stage_error = fatal;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("loading pipeline config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text).context("parsing pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stage_count == 0 {
            anyhow::bail!("stage_count must be at least 1");
        }
        if self.fanout_width_per_stage.len() != self.stage_count {
            anyhow::bail!(
                "fanout_width_per_stage has {} entries, expected {}",
                self.fanout_width_per_stage.len(),
                self.stage_count
            );
        }
        if let Some(index) = self.fanout_width_per_stage.iter().position(|w| *w == 0) {
            anyhow::bail!("fan-out width of stage {} must be at least 1", index);
        }
        if self.limiter.capacity == 0 {
            anyhow::bail!("limiter capacity must be at least 1");
        }
        if self.limiter.refill_interval.is_zero() {
            anyhow::bail!("limiter refill interval must be non-zero");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be at least 1");
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            anyhow::bail!("deadline must be non-zero when set");
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
