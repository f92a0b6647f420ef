use std::time::Duration;

use thiserror::Error;

/// Pool sizes and pacing constants of a [`super::SinkController`].
///
/// All the setters consume and return the configuration so they can be
/// chained:
///
/// ```
/// # use std::time::Duration;
/// # use v4l2sink::sink::SinkConfig;
/// let config = SinkConfig::new()
///     .buffers(8)
///     .reserved_depth(3)
///     .acquire_backoff(Duration::from_millis(2));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.high_watermark, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Number of hardware buffers requested from the device at start.
    pub buffers: usize,
    /// Depth of the reserve kept to back software frames.
    pub reserved_depth: usize,
    /// `acquire` drains completed buffers while more than this many are queued.
    pub low_watermark: usize,
    /// Pacing keeps the number of queued buffers at or below this value.
    pub high_watermark: usize,
    /// Number of retries before `acquire` falls back to a software buffer.
    pub max_acquire_retries: usize,
    /// Sleep between two unsuccessful retries.
    pub acquire_backoff: Duration,
    /// Maximum number of dequeues of a single pacing pass.
    pub pacing_attempts: usize,
    /// Number of queued buffers that triggers stream-on.
    pub stream_on_threshold: usize,
    /// Number of shows making a display cycle. Pacing runs once per cycle.
    pub cycle_length: usize,
    /// A warning is logged every time this many frames have been dropped.
    pub drop_log_interval: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            buffers: 6,
            reserved_depth: 2,
            low_watermark: 2,
            high_watermark: 3,
            max_acquire_retries: 8,
            acquire_backoff: Duration::from_millis(5),
            pacing_attempts: 10,
            stream_on_threshold: 1,
            cycle_length: 1,
            drop_log_interval: 64,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one buffer is required")]
    NoBuffers,
    #[error("reserved depth {reserved} must be between 1 and the buffer count {buffers}")]
    InvalidReservedDepth { reserved: usize, buffers: usize },
    #[error("low watermark {low} is above high watermark {high}")]
    InvalidWatermarks { low: usize, high: usize },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

impl SinkConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn buffers(self, buffers: usize) -> Self {
        SinkConfig { buffers, ..self }
    }

    pub fn reserved_depth(self, reserved_depth: usize) -> Self {
        SinkConfig {
            reserved_depth,
            ..self
        }
    }

    pub fn watermarks(self, low_watermark: usize, high_watermark: usize) -> Self {
        SinkConfig {
            low_watermark,
            high_watermark,
            ..self
        }
    }

    pub fn max_acquire_retries(self, max_acquire_retries: usize) -> Self {
        SinkConfig {
            max_acquire_retries,
            ..self
        }
    }

    pub fn acquire_backoff(self, acquire_backoff: Duration) -> Self {
        SinkConfig {
            acquire_backoff,
            ..self
        }
    }

    pub fn pacing_attempts(self, pacing_attempts: usize) -> Self {
        SinkConfig {
            pacing_attempts,
            ..self
        }
    }

    pub fn stream_on_threshold(self, stream_on_threshold: usize) -> Self {
        SinkConfig {
            stream_on_threshold,
            ..self
        }
    }

    pub fn cycle_length(self, cycle_length: usize) -> Self {
        SinkConfig {
            cycle_length,
            ..self
        }
    }

    pub fn drop_log_interval(self, drop_log_interval: u64) -> Self {
        SinkConfig {
            drop_log_interval,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffers == 0 {
            return Err(ConfigError::NoBuffers);
        }
        if self.reserved_depth == 0 || self.reserved_depth > self.buffers {
            return Err(ConfigError::InvalidReservedDepth {
                reserved: self.reserved_depth,
                buffers: self.buffers,
            });
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::InvalidWatermarks {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        if self.stream_on_threshold == 0 {
            return Err(ConfigError::Zero("stream_on_threshold"));
        }
        if self.cycle_length == 0 {
            return Err(ConfigError::Zero("cycle_length"));
        }
        if self.drop_log_interval == 0 {
            return Err(ConfigError::Zero("drop_log_interval"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SinkConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.reserved_depth, 2);
        assert_eq!(config.acquire_backoff, Duration::from_millis(5));
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(
            SinkConfig::new().buffers(0).validate(),
            Err(ConfigError::NoBuffers)
        );
        assert_eq!(
            SinkConfig::new().buffers(2).reserved_depth(3).validate(),
            Err(ConfigError::InvalidReservedDepth {
                reserved: 3,
                buffers: 2
            })
        );
        assert_eq!(
            SinkConfig::new().reserved_depth(0).validate(),
            Err(ConfigError::InvalidReservedDepth {
                reserved: 0,
                buffers: 6
            })
        );
        assert_eq!(
            SinkConfig::new().watermarks(4, 3).validate(),
            Err(ConfigError::InvalidWatermarks { low: 4, high: 3 })
        );
        assert_eq!(
            SinkConfig::new().cycle_length(0).validate(),
            Err(ConfigError::Zero("cycle_length"))
        );
    }
}
