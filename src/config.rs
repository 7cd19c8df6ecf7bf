//! Orchestrator configuration.
//!
//! Every recognized tuning key with its default. Values can be overridden
//! programmatically or from the environment (`SPECLOOM_*` variables, with
//! `.env` support via `dotenvy`).

use std::time::Duration;

/// Recognized configuration keys. Construct with [`Config::default`] and
/// override fields, or pull overrides from the environment with
/// [`Config::from_env`].
///
/// ```rust
/// use specloom::config::Config;
///
/// let config = Config {
///     trd_quality_threshold: 85,
///     ..Config::default()
/// };
/// assert_eq!(config.trd_max_regenerations, 3);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Absolute expiry for sessions awaiting user input.
    pub session_ttl: Duration,
    /// Idle window after which a reminder event is published.
    pub user_idle_reminder: Duration,
    /// Cap on the research loop; `None` means unbounded.
    pub research_max_gaps_per_session: Option<u32>,
    /// Options appended per gap; clamped to 2..=5.
    pub research_options_per_gap: usize,
    /// TTL of the read-through research cache.
    pub research_cache_ttl: Duration,
    /// TRD validation score at or above which the draft passes.
    pub trd_quality_threshold: u8,
    /// TRD regeneration cap; router forces a pass once reached.
    pub trd_max_regenerations: u32,
    /// Architecture validation score below which warnings are recorded.
    pub architecture_quality_threshold: u8,
    /// Wall-clock budget for ordinary nodes.
    pub node_default_timeout: Duration,
    /// Budget for research nodes (web search dominates).
    pub research_timeout: Duration,
    /// Budget for generation nodes (long completions).
    pub generation_timeout: Duration,
    /// Per-session event backlog capacity; overflow drops oldest.
    pub event_queue_capacity: usize,
    /// Compact a checkpoint chain once it grows past this length.
    pub checkpoint_compact_after: Option<u64>,
    /// Inline retries per node for recoverable faults.
    pub node_retry_limit: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_base_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            user_idle_reminder: Duration::from_secs(30 * 60),
            research_max_gaps_per_session: None,
            research_options_per_gap: 3,
            research_cache_ttl: Duration::from_secs(24 * 60 * 60),
            trd_quality_threshold: 90,
            trd_max_regenerations: 3,
            architecture_quality_threshold: 70,
            node_default_timeout: Duration::from_secs(120),
            research_timeout: Duration::from_secs(180),
            generation_timeout: Duration::from_secs(300),
            event_queue_capacity: 100,
            checkpoint_compact_after: None,
            node_retry_limit: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// Defaults overridden by `SPECLOOM_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Some(secs) = env_u64("SPECLOOM_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SPECLOOM_IDLE_REMINDER_SECS") {
            config.user_idle_reminder = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("SPECLOOM_MAX_GAPS_PER_SESSION") {
            config.research_max_gaps_per_session = Some(n as u32);
        }
        if let Some(n) = env_u64("SPECLOOM_OPTIONS_PER_GAP") {
            config.research_options_per_gap = n as usize;
        }
        if let Some(n) = env_u64("SPECLOOM_TRD_QUALITY_THRESHOLD") {
            config.trd_quality_threshold = n.min(100) as u8;
        }
        if let Some(n) = env_u64("SPECLOOM_TRD_MAX_REGENERATIONS") {
            config.trd_max_regenerations = n as u32;
        }
        if let Some(secs) = env_u64("SPECLOOM_NODE_TIMEOUT_SECS") {
            config.node_default_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("SPECLOOM_EVENT_QUEUE_CAPACITY") {
            config.event_queue_capacity = n as usize;
        }
        if let Some(n) = env_u64("SPECLOOM_COMPACT_AFTER") {
            config.checkpoint_compact_after = Some(n);
        }
        config
    }

    /// `research_options_per_gap` clamped to the supported 2..=5 range.
    #[must_use]
    pub fn options_per_gap(&self) -> usize {
        self.research_options_per_gap.clamp(2, 5)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}
