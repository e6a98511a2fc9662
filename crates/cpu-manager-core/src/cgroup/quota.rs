//! The `cpu.max` quota grammar.
//!
//! A quota string is exactly `max <period>` or `<quota> <period>`: one
//! space, decimal digits only, `period >= 1`. Everything else is rejected
//! before any write reaches the kernel.

use std::fmt;

/// Error type for quota validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cpu.max value {value:?}: {reason}")]
pub struct QuotaError {
    pub value: String,
    pub reason: &'static str,
}

impl QuotaError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

/// A validated cgroup-v2 `cpu.max` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// No bandwidth cap (`max <period>`).
    Max { period_us: u64 },
    /// At most `quota_us` of CPU time per `period_us` of wall time.
    Limited { quota_us: u64, period_us: u64 },
}

impl Quota {
    /// Parses and validates a quota string.
    ///
    /// A single trailing newline is tolerated because that is how the
    /// kernel hands the file back.
    pub fn parse(input: &str) -> Result<Self, QuotaError> {
        let s = input.strip_suffix('\n').unwrap_or(input);

        let Some((left, right)) = s.split_once(' ') else {
            return Err(QuotaError::new(input, "expected two space-separated fields"));
        };

        let period_us = parse_decimal(right)
            .ok_or_else(|| QuotaError::new(input, "period must be a decimal integer"))?;
        if period_us < 1 {
            return Err(QuotaError::new(input, "period must be >= 1"));
        }

        if left == "max" {
            return Ok(Quota::Max { period_us });
        }

        let quota_us = parse_decimal(left)
            .ok_or_else(|| QuotaError::new(input, "quota must be `max` or a decimal integer"))?;
        Ok(Quota::Limited { quota_us, period_us })
    }

    /// The `(quota_us, period_us)` pair, with `None` for an uncapped quota.
    pub fn pair(&self) -> (Option<u64>, u64) {
        match *self {
            Quota::Max { period_us } => (None, period_us),
            Quota::Limited {
                quota_us,
                period_us,
            } => (Some(quota_us), period_us),
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Quota::Max { period_us } => write!(f, "max {}", period_us),
            Quota::Limited {
                quota_us,
                period_us,
            } => write!(f, "{} {}", quota_us, period_us),
        }
    }
}

/// `u64::from_str` accepts a leading `+`; the quota grammar does not.
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
