//! Scheduler configuration
//!
//! [`SchedulerConfig`] carries every tunable of the scheduling core. It can
//! be built with `with_*` methods, deserialized with serde (missing fields
//! take their defaults), or overlaid from `BATCHFORGE_*` environment
//! variables. Call [`SchedulerConfig::validate`] before use; the scheduler
//! does so on construction.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::ForgeResult;

/// Retry policy for batch-wide dispatch failures
///
/// The scheduler retries a failed batch at most once; a larger
/// `max_retries` is rejected by [`SchedulerConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt (0 or 1)
    pub max_retries: usize,
    /// Pause before the retry, in milliseconds
    pub delay_ms: u64,
    /// Add up to 25% random jitter to the delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 1,
            delay_ms: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create the default policy (one retry after ~10ms)
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that escalates on the first failure
    pub fn no_retry() -> Self {
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the pause before the retry
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry, jittered if enabled
    pub fn retry_delay(&self) -> Duration {
        let jitter_range = self.delay_ms / 4;
        if self.jitter && jitter_range > 0 {
            let jitter_amt = rand::thread_rng().gen_range(0..=jitter_range);
            Duration::from_millis(self.delay_ms + jitter_amt)
        } else {
            Duration::from_millis(self.delay_ms)
        }
    }
}

/// Configuration for the scheduling core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of requests in one dispatched batch
    pub max_batch_size: usize,

    /// Total cache units (pages) the ledger may hand out
    pub total_units: usize,

    /// Maximum number of concurrently admitted sequences
    pub max_sequences: usize,

    /// Tokens per cache unit. 1 means per-token accounting.
    pub page_size: usize,

    /// Submissions accepted but not yet admitted before `QueueFull`
    pub max_queue_depth: usize,

    /// Upper bound on a single `execute` call
    pub dispatch_timeout: Duration,

    /// Retry policy for batch-wide failures (at most one retry)
    pub dispatch_retry: RetryConfig,

    /// Consecutive deferrals after which a request is evicted
    pub deferral_threshold: u32,

    /// How long an idle loop sleeps before re-checking its state
    pub idle_timeout: Duration,

    /// Tokens each request may produce in a single dispatch
    pub max_steps_per_batch: usize,

    /// Prompt tokens one batch may carry. Prefill entries stop being added
    /// once the total reaches this; the first prefill always fits.
    pub max_prefill_tokens: usize,

    /// Per-request output buffer, including the slot kept for the end marker
    pub stream_buffer: usize,

    /// Free-unit fraction below which admission yields to running requests
    pub admission_watermark: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_batch_size: 32,
            total_units: 1024,
            max_sequences: 256,
            page_size: 16,
            max_queue_depth: 1024,
            dispatch_timeout: Duration::from_secs(30),
            dispatch_retry: RetryConfig::default(),
            deferral_threshold: 64,
            idle_timeout: Duration::from_millis(50),
            max_steps_per_batch: 1,
            max_prefill_tokens: 8192,
            stream_buffer: 64,
            admission_watermark: 0.1,
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum batch size
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the total unit capacity
    pub fn with_total_units(mut self, total_units: usize) -> Self {
        self.total_units = total_units;
        self
    }

    /// Set the number of sequence slots
    pub fn with_max_sequences(mut self, max_sequences: usize) -> Self {
        self.max_sequences = max_sequences;
        self
    }

    /// Set tokens per unit
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the admission queue limit
    pub fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the per-dispatch timeout
    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }

    /// Set the dispatch retry policy
    pub fn with_dispatch_retry(mut self, dispatch_retry: RetryConfig) -> Self {
        self.dispatch_retry = dispatch_retry;
        self
    }

    /// Set the eviction threshold
    pub fn with_deferral_threshold(mut self, deferral_threshold: u32) -> Self {
        self.deferral_threshold = deferral_threshold;
        self
    }

    /// Set the idle re-check interval
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set tokens per request per dispatch
    pub fn with_max_steps_per_batch(mut self, max_steps_per_batch: usize) -> Self {
        self.max_steps_per_batch = max_steps_per_batch;
        self
    }

    /// Set the per-request output buffer
    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    /// Set the admission watermark
    pub fn with_admission_watermark(mut self, admission_watermark: f64) -> Self {
        self.admission_watermark = admission_watermark;
        self
    }

    /// Set the per-batch prompt token budget
    pub fn with_max_prefill_tokens(mut self, max_prefill_tokens: usize) -> Self {
        self.max_prefill_tokens = max_prefill_tokens;
        self
    }

    /// Largest sequence (prompt + output) the ledger could ever hold
    pub fn max_tokens_per_sequence(&self) -> usize {
        self.total_units.saturating_mul(self.page_size)
    }

    /// Check every field; errors are `InvalidConfiguration`
    pub fn validate(&self) -> ForgeResult<()> {
        if self.max_batch_size == 0 {
            return Err(config_error!("max_batch_size must be > 0"));
        }
        if self.total_units == 0 {
            return Err(config_error!("total_units must be > 0"));
        }
        if self.max_sequences == 0 {
            return Err(config_error!("max_sequences must be > 0"));
        }
        if self.page_size == 0 {
            return Err(config_error!("page_size must be > 0"));
        }
        if self.max_queue_depth == 0 {
            return Err(config_error!("max_queue_depth must be > 0"));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(config_error!("dispatch_timeout must be non-zero"));
        }
        if self.dispatch_retry.max_retries > 1 {
            return Err(config_error!(
                "dispatch_retry.max_retries must be 0 or 1, got {}",
                self.dispatch_retry.max_retries
            ));
        }
        if self.max_steps_per_batch == 0 {
            return Err(config_error!("max_steps_per_batch must be > 0"));
        }
        if self.max_prefill_tokens == 0 {
            return Err(config_error!("max_prefill_tokens must be > 0"));
        }
        // One slot for at least one token, one reserved for the end marker
        if self.stream_buffer < 2 {
            return Err(config_error!(
                "stream_buffer must be >= 2, got {}",
                self.stream_buffer
            ));
        }
        if !(0.0..1.0).contains(&self.admission_watermark) {
            return Err(config_error!(
                "admission_watermark must be in [0, 1), got {}",
                self.admission_watermark
            ));
        }
        Ok(())
    }

    /// Overlay `BATCHFORGE_*` environment variables on top of `self`.
    ///
    /// Durations are read in milliseconds. Unparseable values are errors.
    pub fn with_env_overrides(mut self) -> ForgeResult<Self> {
        if let Some(v) = env_value("BATCHFORGE_MAX_BATCH_SIZE")? {
            self.max_batch_size = v;
        }
        if let Some(v) = env_value("BATCHFORGE_TOTAL_UNITS")? {
            self.total_units = v;
        }
        if let Some(v) = env_value("BATCHFORGE_MAX_SEQUENCES")? {
            self.max_sequences = v;
        }
        if let Some(v) = env_value("BATCHFORGE_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = env_value("BATCHFORGE_MAX_QUEUE_DEPTH")? {
            self.max_queue_depth = v;
        }
        if let Some(v) = env_value::<u64>("BATCHFORGE_DISPATCH_TIMEOUT_MS")? {
            self.dispatch_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_value("BATCHFORGE_DISPATCH_RETRIES")? {
            self.dispatch_retry.max_retries = v;
        }
        if let Some(v) = env_value("BATCHFORGE_DEFERRAL_THRESHOLD")? {
            self.deferral_threshold = v;
        }
        if let Some(v) = env_value::<u64>("BATCHFORGE_IDLE_TIMEOUT_MS")? {
            self.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_value("BATCHFORGE_MAX_STEPS_PER_BATCH")? {
            self.max_steps_per_batch = v;
        }
        if let Some(v) = env_value("BATCHFORGE_MAX_PREFILL_TOKENS")? {
            self.max_prefill_tokens = v;
        }
        if let Some(v) = env_value("BATCHFORGE_STREAM_BUFFER")? {
            self.stream_buffer = v;
        }
        if let Some(v) = env_value("BATCHFORGE_ADMISSION_WATERMARK")? {
            self.admission_watermark = v;
        }
        Ok(self)
    }

    /// Defaults overlaid with the environment, validated
    pub fn from_env() -> ForgeResult<Self> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

fn env_value<T>(name: &str) -> ForgeResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| config_error!("{}={:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_batch_size, 32);
        assert_eq!(config.page_size, 16);
        assert_eq!(config.deferral_threshold, 64);
        assert_eq!(config.dispatch_retry.max_retries, 1);
        assert_eq!(config.admission_watermark, 0.1);
        assert_eq!(config.max_prefill_tokens, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::new()
            .with_max_batch_size(4)
            .with_total_units(8)
            .with_max_sequences(2)
            .with_page_size(1)
            .with_max_queue_depth(3)
            .with_dispatch_timeout(Duration::from_millis(200))
            .with_deferral_threshold(5)
            .with_idle_timeout(Duration::from_millis(5))
            .with_max_steps_per_batch(4)
            .with_stream_buffer(8)
            .with_admission_watermark(0.0);

        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.total_units, 8);
        assert_eq!(config.max_sequences, 2);
        assert_eq!(config.max_tokens_per_sequence(), 8);
        assert_eq!(config.max_queue_depth, 3);
        assert_eq!(config.dispatch_timeout.as_millis(), 200);
        assert_eq!(config.max_steps_per_batch, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SchedulerConfig::new().with_page_size(0).validate().is_err());
        assert!(SchedulerConfig::new().with_max_batch_size(0).validate().is_err());
        assert!(SchedulerConfig::new().with_stream_buffer(1).validate().is_err());
        assert!(SchedulerConfig::new().with_max_prefill_tokens(0).validate().is_err());
        assert!(SchedulerConfig::new()
            .with_admission_watermark(1.0)
            .validate()
            .is_err());

        let err = SchedulerConfig::new()
            .with_dispatch_retry(RetryConfig::new().with_max_retries(3))
            .validate()
            .unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_batch_size": 8, "page_size": 4}"#).unwrap();
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.page_size, 4);
        assert_eq!(config.total_units, SchedulerConfig::default().total_units);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("BATCHFORGE_MAX_BATCH_SIZE", "7");
        std::env::set_var("BATCHFORGE_IDLE_TIMEOUT_MS", "15");
        std::env::set_var("BATCHFORGE_MAX_PREFILL_TOKENS", "512");
        let config = SchedulerConfig::from_env().unwrap();
        assert_eq!(config.max_batch_size, 7);
        assert_eq!(config.max_prefill_tokens, 512);
        assert_eq!(config.idle_timeout, Duration::from_millis(15));

        std::env::set_var("BATCHFORGE_MAX_BATCH_SIZE", "lots");
        assert!(SchedulerConfig::from_env().is_err());

        std::env::remove_var("BATCHFORGE_MAX_BATCH_SIZE");
        std::env::remove_var("BATCHFORGE_IDLE_TIMEOUT_MS");
        std::env::remove_var("BATCHFORGE_MAX_PREFILL_TOKENS");
    }

    #[test]
    fn test_retry_delay_without_jitter() {
        let retry = RetryConfig::new().with_delay_ms(10).with_jitter(false);
        assert_eq!(retry.retry_delay().as_millis(), 10);
        assert_eq!(RetryConfig::new().with_delay_ms(0).retry_delay(), Duration::ZERO);
    }

    #[test]
    fn test_retry_jitter_in_range() {
        let retry = RetryConfig::new().with_delay_ms(100).with_jitter(true);

        for _ in 0..20 {
            let delay = retry.retry_delay().as_millis();
            assert!((100..=125).contains(&delay));
        }
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
    }
}
