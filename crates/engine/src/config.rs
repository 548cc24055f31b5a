use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Maximum shards representable in the GF(2^8) erasure code.
pub const MAX_SHARDS: usize = 256;

/// How many parity segments accompany the data segments.
#[derive(Clone, Copy, Debug)]
pub enum ParityPlan {
    /// Fixed parity count regardless of data size.
    Count(usize),
    /// Parity as a fraction of the data count, rounded up, minimum one.
    Ratio(f64),
}

impl ParityPlan {
    /// Parity count for `data_segments` data shards.
    #[must_use]
    pub fn parity_for(&self, data_segments: usize) -> usize {
        match *self {
            Self::Count(count) => count,
            Self::Ratio(ratio) => ((data_segments as f64 * ratio).ceil() as usize).max(1),
        }
    }
}

impl Default for ParityPlan {
    fn default() -> Self {
        Self::Ratio(0.5)
    }
}

/// Tunables for the upload dispersal driver.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    /// Payload bytes per data segment.
    pub segment_size: usize,
    /// Parity sizing policy.
    pub parity: ParityPlan,
    /// Candidate peers considered per segment.
    pub replication: usize,
    /// Concurrent in-flight segments per task.
    pub concurrency: usize,
    /// Placement attempts per segment before it fails.
    pub max_retries: u32,
    /// Deadline for one complete placement attempt (dial, send, ack).
    pub attempt_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            segment_size: 1024 * 1024,
            parity: ParityPlan::default(),
            replication: 3,
            concurrency: 8,
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadConfig {
    /// Validates the configuration against `data_segments` shards.
    pub fn validate(&self, data_segments: usize) -> EngineResult<usize> {
        if self.segment_size == 0 {
            return Err(EngineError::InvalidConfig(
                "segment size must be positive".into(),
            ));
        }
        if self.replication == 0 || self.concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "replication and concurrency must be positive".into(),
            ));
        }
        let parity = self.parity.parity_for(data_segments);
        if parity == 0 {
            return Err(EngineError::InvalidConfig(
                "at least one parity segment is required".into(),
            ));
        }
        if data_segments + parity > MAX_SHARDS {
            return Err(EngineError::InvalidConfig(format!(
                "{data_segments} data + {parity} parity segments exceed the {MAX_SHARDS}-shard bound"
            )));
        }
        Ok(parity)
    }
}

/// Tunables for the download recovery driver.
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Candidate peers considered per segment.
    pub replication: usize,
    /// Concurrent in-flight segments per task.
    pub concurrency: usize,
    /// Fetch attempts per segment before it fails.
    pub max_retries: u32,
    /// Deadline for one complete fetch attempt.
    pub attempt_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            replication: 3,
            concurrency: 8,
            max_retries: 3,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_plan_rounds_up_with_floor_of_one() {
        let plan = ParityPlan::Ratio(0.5);
        assert_eq!(plan.parity_for(4), 2);
        assert_eq!(plan.parity_for(5), 3);
        assert_eq!(plan.parity_for(1), 1);

        assert_eq!(ParityPlan::Ratio(0.1).parity_for(2), 1);
    }

    #[test]
    fn count_plan_is_fixed() {
        assert_eq!(ParityPlan::Count(2).parity_for(100), 2);
    }

    #[test]
    fn validate_accepts_the_default() {
        let config = UploadConfig::default();
        assert_eq!(config.validate(4).expect("valid"), 2);
    }

    #[test]
    fn validate_rejects_zero_parity() {
        let config = UploadConfig {
            parity: ParityPlan::Count(0),
            ..UploadConfig::default()
        };
        assert!(matches!(
            config.validate(4),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_shard_overflow() {
        let config = UploadConfig {
            parity: ParityPlan::Count(2),
            ..UploadConfig::default()
        };
        assert!(matches!(
            config.validate(255),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
