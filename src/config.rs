//! Service configuration.
//!
//! Loaded from `carecoord.toml`. Every field has a default so an empty or
//! missing file yields a working single-node setup; the weighting constants
//! for metrics and insight rules all live here rather than in code.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Directory holding `carecoord.db`.
    pub data_dir: PathBuf,
    pub api: ApiConfig,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            api: ApiConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file at the default location is not an
    /// error; a missing file that was asked for explicitly is.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from("carecoord.toml"), false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("config file not found: {}", path.display());
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("carecoord.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8686".into(),
        }
    }
}

/// Aggregation, pattern, scheduling and insight tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Days in the trailing window for rolling metrics.
    pub trailing_window_days: u32,
    /// Days in the comparison window immediately before the trailing window.
    pub prior_window_days: u32,
    /// Lookback for the latest quality-of-life rating per dimension.
    pub quality_of_life_window_days: u32,
    /// Pattern reports are materialized for each of these windows.
    pub pattern_windows_days: Vec<u32>,
    /// Below this many behavior observations a ratio is `insufficient_data`.
    pub min_behavior_samples: u32,
    /// Triggers with fewer occurrences stay out of the ranked list.
    pub min_trigger_occurrences: u32,
    /// Width of a time-of-day bucket. Must divide a day evenly.
    pub bucket_minutes: u32,
    pub min_bucket_samples: u32,
    /// Length of the best / challenging bucket lists.
    pub top_buckets: usize,
    pub skill_level_weight: f64,
    pub skill_milestone_weight: f64,
    /// Seconds between pattern batch passes.
    pub pattern_interval_secs: u64,
    /// A subject whose last pass is older than this is recomputed even
    /// without new observations, so rolling windows and insight expiry
    /// follow the clock. At most half the insight TTL.
    pub refresh_interval_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// How far in the future an observation timestamp may be.
    pub max_future_skew_secs: i64,
    pub insights: InsightConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trailing_window_days: 30,
            prior_window_days: 30,
            quality_of_life_window_days: 90,
            pattern_windows_days: vec![30, 90],
            min_behavior_samples: 5,
            min_trigger_occurrences: 3,
            bucket_minutes: 60,
            min_bucket_samples: 3,
            top_buckets: 3,
            skill_level_weight: 0.6,
            skill_milestone_weight: 0.4,
            pattern_interval_secs: 300,
            refresh_interval_secs: 3600,
            retry_max_attempts: 5,
            retry_base_delay_ms: 500,
            max_future_skew_secs: 300,
            insights: InsightConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trailing_window_days == 0 {
            anyhow::bail!("engine.trailing_window_days must be positive");
        }
        if self.bucket_minutes == 0 || 1440 % self.bucket_minutes != 0 {
            anyhow::bail!(
                "engine.bucket_minutes must evenly divide 1440, got {}",
                self.bucket_minutes
            );
        }
        if self.pattern_windows_days.iter().any(|days| *days == 0) {
            anyhow::bail!("engine.pattern_windows_days entries must be positive");
        }
        // The sweep runs once per interval, so a subject may wait up to two
        // intervals; its live insights must not expire in between.
        let ttl_secs = self.insights.ttl_hours.saturating_mul(3600);
        let refresh_secs = i64::try_from(self.refresh_interval_secs).unwrap_or(i64::MAX);
        if refresh_secs == 0 || refresh_secs.saturating_mul(2) > ttl_secs {
            anyhow::bail!(
                "engine.refresh_interval_secs must be positive and at most half the insight ttl ({ttl_secs}s), got {}",
                self.refresh_interval_secs
            );
        }
        let weights = self.skill_level_weight + self.skill_milestone_weight;
        if (weights - 1.0).abs() > 1e-9 {
            anyhow::bail!("skill weights must sum to 1.0, got {weights}");
        }
        Ok(())
    }

    /// The window the pattern endpoint serves when none is requested.
    pub fn default_pattern_window(&self) -> u32 {
        self.pattern_windows_days.iter().copied().max().unwrap_or(90)
    }
}

/// Thresholds for the insight rule catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InsightConfig {
    /// Percentage points of behavior-ratio improvement worth reporting.
    pub improvement_threshold_pp: f64,
    pub improvement_min_samples: u32,
    /// Rise in mean intensity (trailing vs prior) that counts as escalation.
    pub intensity_trend_delta: f64,
    /// Mean intensity at or above this is a safety concern.
    pub safety_intensity: f64,
    pub low_consistency_pct: f64,
    pub effective_intervention_rate: f64,
    pub low_quality_of_life: f64,
    /// Margin by which the best time bucket must beat the overall rate.
    pub best_time_margin: f64,
    /// Share of the current level's milestones achieved before predicting advancement.
    pub milestone_ready_fraction: f64,
    pub ttl_hours: i64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            improvement_threshold_pp: 10.0,
            improvement_min_samples: 10,
            intensity_trend_delta: 1.0,
            safety_intensity: 7.0,
            low_consistency_pct: 60.0,
            effective_intervention_rate: 0.7,
            low_quality_of_life: 5.0,
            best_time_margin: 0.2,
            milestone_ready_fraction: 0.75,
            ttl_hours: 24,
        }
    }
}
