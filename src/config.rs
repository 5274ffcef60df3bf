use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::connection::{RetryPolicy, DEFAULT_JOIN_TIMEOUT};
use crate::error::StreamError;
use crate::supervisor::{ExhaustionPolicy, RunOptions, SupervisorConfig, DEFAULT_RETRY_BACKOFF};
use crate::{default_label, SourceDescriptor};

const DEFAULT_SOURCE_URI: &str = "stub://front_camera";
const DEFAULT_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 2_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_REPORT_INTERVAL_MS: u64 = 1_000;

const SUPPORTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "http", "https", "stub"];

#[derive(Debug, Deserialize, Default)]
struct StreamdConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    retry: Option<RetryConfigFile>,
    poll: Option<PollConfigFile>,
    exhaustion: Option<ExhaustionConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    report: Option<ReportConfigFile>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    uri: String,
    label: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    max_attempts: Option<u32>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PollConfigFile {
    interval_ms: Option<u64>,
    duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ExhaustionConfigFile {
    policy: Option<String>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    join_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportConfigFile {
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamdConfig {
    pub sources: Vec<SourceDescriptor>,
    pub retry: RetryPolicy,
    /// Zero means the poll loop only yields between iterations.
    pub poll_interval: Duration,
    /// `None` runs until cancelled.
    pub duration: Option<Duration>,
    pub exhaustion: ExhaustionPolicy,
    pub join_timeout: Duration,
    /// Minimum spacing of per-stream status lines.
    pub report_interval: Duration,
}

#[derive(Debug, Clone)]
struct PendingSource {
    uri: String,
    label: Option<String>,
}

impl StreamdConfig {
    /// Read `STREAMD_CONFIG` (if set), apply `STREAMD_*` overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMD_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => StreamdConfigFile::default(),
        };
        let (mut cfg, mut sources) = Self::from_file(file_cfg)?;
        cfg.apply_env(&mut sources)?;
        cfg.sources = resolve_sources(sources)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamdConfigFile) -> Result<(Self, Vec<PendingSource>)> {
        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(|source| PendingSource {
                    uri: source.uri,
                    label: source.label,
                })
                .collect(),
            None => vec![PendingSource {
                uri: DEFAULT_SOURCE_URI.to_string(),
                label: None,
            }],
        };

        let retry = RetryPolicy {
            max_attempts: file
                .retry
                .as_ref()
                .and_then(|retry| retry.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_interval: Duration::from_millis(
                file.retry
                    .as_ref()
                    .and_then(|retry| retry.interval_ms)
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            ),
        };
        let poll_interval = Duration::from_millis(
            file.poll
                .as_ref()
                .and_then(|poll| poll.interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        let duration = duration_from_secs(file.poll.as_ref().and_then(|poll| poll.duration_secs));

        let backoff = file
            .exhaustion
            .as_ref()
            .and_then(|exhaustion| exhaustion.backoff_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_BACKOFF);
        let exhaustion = match file.exhaustion.and_then(|exhaustion| exhaustion.policy) {
            Some(policy) => parse_policy(&policy, backoff)?,
            None => ExhaustionPolicy::DropOnExhaustion,
        };

        let join_timeout = file
            .shutdown
            .and_then(|shutdown| shutdown.join_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_JOIN_TIMEOUT);
        let report_interval = Duration::from_millis(
            file.report
                .and_then(|report| report.interval_ms)
                .unwrap_or(DEFAULT_REPORT_INTERVAL_MS),
        );

        Ok((
            Self {
                sources: Vec::new(),
                retry,
                poll_interval,
                duration,
                exhaustion,
                join_timeout,
                report_interval,
            },
            sources,
        ))
    }

    fn apply_env(&mut self, sources: &mut Vec<PendingSource>) -> Result<()> {
        if let Ok(list) = std::env::var("STREAMD_SOURCES") {
            let parsed = split_csv(&list);
            if !parsed.is_empty() {
                *sources = parsed
                    .into_iter()
                    .map(|uri| PendingSource { uri, label: None })
                    .collect();
            }
        }
        if let Some(attempts) = env_integer("STREAMD_MAX_ATTEMPTS")? {
            self.retry.max_attempts = u32::try_from(attempts).map_err(|_| {
                StreamError::config("STREAMD_MAX_ATTEMPTS is out of range")
            })?;
        }
        if let Some(ms) = env_integer("STREAMD_RETRY_INTERVAL_MS")? {
            self.retry.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_integer("STREAMD_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_integer("STREAMD_DURATION_SECS")? {
            self.duration = duration_from_secs(Some(secs));
        }
        if let Some(ms) = env_integer("STREAMD_JOIN_TIMEOUT_MS")? {
            self.join_timeout = Duration::from_millis(ms);
        }
        if let Ok(policy) = std::env::var("STREAMD_EXHAUSTION_POLICY") {
            if !policy.trim().is_empty() {
                let backoff = match self.exhaustion {
                    ExhaustionPolicy::RetryForever { backoff } => backoff,
                    ExhaustionPolicy::DropOnExhaustion => DEFAULT_RETRY_BACKOFF,
                };
                self.exhaustion = parse_policy(policy.trim(), backoff)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(StreamError::config("source list is empty").into());
        }
        if self.retry.max_attempts == 0 {
            return Err(StreamError::config("max_attempts must be at least 1").into());
        }
        let mut labels = HashSet::new();
        for source in &self.sources {
            validate_uri(&source.uri)?;
            if !labels.insert(source.label.as_str()) {
                return Err(
                    StreamError::config(format!("duplicate source label '{}'", source.label))
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            retry: self.retry,
            exhaustion: self.exhaustion,
            join_timeout: self.join_timeout,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            poll_interval: (!self.poll_interval.is_zero()).then_some(self.poll_interval),
            duration: self.duration,
        }
    }
}

fn read_config_file(path: &Path) -> Result<StreamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| {
            StreamError::config(format!("invalid config file {}: {}", path.display(), e))
        })?
    } else {
        serde_json::from_str(&raw).map_err(|e| {
            StreamError::config(format!("invalid config file {}: {}", path.display(), e))
        })?
    };
    Ok(cfg)
}

fn resolve_sources(sources: Vec<PendingSource>) -> Result<Vec<SourceDescriptor>> {
    Ok(sources
        .into_iter()
        .enumerate()
        .map(|(idx, source)| {
            let uri = source.uri.trim().to_string();
            let label = source
                .label
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| default_label(&uri, idx + 1));
            SourceDescriptor { uri, label }
        })
        .collect())
}

fn validate_uri(uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| StreamError::config(format!("invalid source URI '{}': {}", uri, e)))?;
    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(StreamError::config(format!(
            "unsupported scheme '{}' in source URI '{}'",
            parsed.scheme(),
            uri
        ))
        .into());
    }
    Ok(())
}

fn parse_policy(value: &str, backoff: Duration) -> Result<ExhaustionPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "drop" | "drop-on-exhaustion" => Ok(ExhaustionPolicy::DropOnExhaustion),
        "retry" | "retry-forever" => Ok(ExhaustionPolicy::RetryForever { backoff }),
        other => Err(StreamError::config(format!(
            "unknown exhaustion policy '{}' (expected drop or retry)",
            other
        ))
        .into()),
    }
}

fn env_integer(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| StreamError::config(format!("{} must be a non-negative integer", key)).into()),
        _ => Ok(None),
    }
}

fn duration_from_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|secs| *secs > 0).map(Duration::from_secs)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
