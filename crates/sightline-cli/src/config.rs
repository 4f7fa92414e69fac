use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use sightline_core::cooldown::DEFAULT_VISIT_COOLDOWN_SECS;
use sightline_core::matcher::DEFAULT_SIMILARITY_THRESHOLD;
use sightline_core::snapshot::DEFAULT_JPEG_QUALITY;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration: defaults, then an optional TOML file, then
/// `SIGHTLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match (inclusive).
    pub similarity_threshold: f32,
    /// Minimum seconds between two logged visits of one identity.
    pub visit_cooldown_secs: u64,
    /// Sleep between polls when no frame is available.
    pub poll_interval_ms: u64,
    /// JPEG quality for visit snapshots (1–100).
    pub snapshot_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("sightline.db"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            visit_cooldown_secs: DEFAULT_VISIT_COOLDOWN_SECS.unsigned_abs(),
            poll_interval_ms: 10,
            snapshot_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Config {
    /// Load from `file` (if given) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let base = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        let config = base.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `SIGHTLINE_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("SIGHTLINE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.similarity_threshold =
            env_parse(&lookup, "SIGHTLINE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.visit_cooldown_secs =
            env_parse(&lookup, "SIGHTLINE_VISIT_COOLDOWN_SECS", self.visit_cooldown_secs);
        self.poll_interval_ms = env_parse(&lookup, "SIGHTLINE_POLL_INTERVAL_MS", self.poll_interval_ms);
        self.snapshot_quality = env_parse(&lookup, "SIGHTLINE_SNAPSHOT_QUALITY", self.snapshot_quality);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if cooldown_delta(self.visit_cooldown_secs).is_none() {
            bail!(
                "visit_cooldown_secs is out of range, got {}",
                self.visit_cooldown_secs
            );
        }
        if !(1..=100).contains(&self.snapshot_quality) {
            bail!("snapshot_quality must be within 1..=100, got {}", self.snapshot_quality);
        }
        Ok(())
    }

    /// Saturates at [`TimeDelta::MAX`]; [`validate`](Self::validate) rejects
    /// values that do not fit.
    pub fn cooldown(&self) -> TimeDelta {
        cooldown_delta(self.visit_cooldown_secs).unwrap_or(TimeDelta::MAX)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn cooldown_delta(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("sightline")
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        None => current,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            current
        }),
    }
}
