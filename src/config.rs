use std::{str::FromStr, sync::LazyLock, time::Duration};

use anyhow::Context as _;
use conveyor_core::{LimiterConfig, PipelineConfig};

pub const CONFIG_ENV: &str = "CONVEYOR_CONFIG";
pub const FORMAT_ENV: &str = "CONVEYOR_FORMAT";
pub const TOP_ENV: &str = "CONVEYOR_TOP";
pub const FORCE_TIMEOUT_ENV: &str = "CONVEYOR_FORCE_TIMEOUT_MS";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(anyhow::anyhow!("unknown output format {:?}", other)),
        }
    }
}

pub struct AppConfig {
    pipeline: PipelineConfig,
    format: OutputFormat,
    top: usize,
    force_timeout: Duration,
}

impl AppConfig {
    /// Word count defaults: fanned-out tokenizer, a limiter loose enough
    /// for interactive input.
    pub fn default_pipeline() -> PipelineConfig {
        PipelineConfig::with_widths(&[1, 4, 1]).with_limiter(LimiterConfig::per_second(10_000))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let pipeline = match lookup(CONFIG_ENV) {
            Some(path) => PipelineConfig::from_file(&path)?,
            None => Self::default_pipeline(),
        };
        if pipeline.stage_count != 3 {
            anyhow::bail!(
                "word count runs 3 stages, config describes {}",
                pipeline.stage_count
            );
        }

        let format = match lookup(FORMAT_ENV) {
            Some(value) => value.parse()?,
            None => OutputFormat::Text,
        };
        let top = match lookup(TOP_ENV) {
            Some(value) => value
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", TOP_ENV, value))?,
            None => 10,
        };
        let force_timeout = match lookup(FORCE_TIMEOUT_ENV) {
            Some(value) => Duration::from_millis(value.parse().with_context(|| {
                format!("{} must be milliseconds, got {:?}", FORCE_TIMEOUT_ENV, value)
            })?),
            None => Duration::from_secs(5),
        };

        Ok(Self {
            pipeline,
            format,
            top,
            force_timeout,
        })
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Entries in the report; 0 lists every word.
    pub fn top(&self) -> usize {
        self.top
    }

    /// How long to wait for tasks after the input ends or ctrl-c.
    pub fn force_timeout(&self) -> Duration {
        self.force_timeout
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(|| {
        AppConfig::from_env().unwrap_or_else(|e| {
            eprintln!("Error loading configuration: {:#}", e);
            std::process::exit(2);
        })
    });
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
