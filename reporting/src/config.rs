use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Upper bound for every configured duration.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("delivery interval cannot be 0")]
    ZeroDeliveryInterval,

    #[error("max report attempts cannot be 0")]
    ZeroMaxAttempts,

    #[error("upload timeout cannot be 0")]
    ZeroUploadTimeout,

    #[error("backoff multiply factor must be at least 1.0, got {0}")]
    InvalidMultiplyFactor(f64),

    #[error("maximum backoff must not be shorter than the initial delay")]
    InvalidMaximumBackoff,

    #[error("{field} is {secs}s, the maximum is {max}s", max = MAX_DURATION_SECS)]
    DurationTooLong { field: &'static str, secs: u64 },
}

fn check_duration(field: &'static str, secs: u64) -> Result<(), ValidationError> {
    if secs > MAX_DURATION_SECS {
        return Err(ValidationError::DurationTooLong { field, secs });
    }
    Ok(())
}

/// `now + delay`, saturating at `MAX_DURATION_SECS` from now when the sum
/// does not fit in an `Instant`.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_DURATION_SECS))
}

/// Delivery tuning shared by the agent, the store and the endpoint manager.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Period between flush cycles while the queue is non-empty
    pub delivery_interval_secs: u64,
    /// Reports are dropped once this many uploads of them have failed
    pub max_report_attempts: u32,
    /// Reports older than this are dropped instead of delivered
    pub max_report_age_secs: u64,
    /// Timeout for a single upload, including reading the response
    pub upload_timeout_secs: u64,
    pub endpoint_backoff: BackoffPolicy,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            delivery_interval_secs: 60,
            max_report_attempts: 5,
            max_report_age_secs: 15 * 60,
            upload_timeout_secs: 30,
            endpoint_backoff: BackoffPolicy::default(),
        }
    }
}

impl DeliveryPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.delivery_interval_secs == 0 {
            return Err(ValidationError::ZeroDeliveryInterval);
        }
        if self.max_report_attempts == 0 {
            return Err(ValidationError::ZeroMaxAttempts);
        }
        if self.upload_timeout_secs == 0 {
            return Err(ValidationError::ZeroUploadTimeout);
        }
        check_duration("delivery_interval_secs", self.delivery_interval_secs)?;
        check_duration("max_report_age_secs", self.max_report_age_secs)?;
        check_duration("upload_timeout_secs", self.upload_timeout_secs)?;
        self.endpoint_backoff.validate()
    }

    pub fn delivery_interval(&self) -> Duration {
        Duration::from_secs(self.delivery_interval_secs)
    }

    pub fn max_report_age(&self) -> Duration {
        Duration::from_secs(self.max_report_age_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Exponential backoff applied to an endpoint after failed uploads.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_delay_secs: u64,
    pub multiply_factor: f64,
    pub maximum_backoff_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay_secs: 60,
            multiply_factor: 2.0,
            maximum_backoff_secs: 60 * 60,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.multiply_factor >= 1.0) {
            return Err(ValidationError::InvalidMultiplyFactor(self.multiply_factor));
        }
        if self.maximum_backoff_secs < self.initial_delay_secs {
            return Err(ValidationError::InvalidMaximumBackoff);
        }
        check_duration("maximum_backoff_secs", self.maximum_backoff_secs)
    }

    pub fn maximum_backoff(&self) -> Duration {
        Duration::from_secs(self.maximum_backoff_secs)
    }

    /// Delay before an endpoint may be retried after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay_secs as f64 * self.multiply_factor.powi(exponent);
        let max = self.maximum_backoff_secs as f64;
        if !secs.is_finite() || secs >= max {
            Duration::from_secs(self.maximum_backoff_secs)
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
