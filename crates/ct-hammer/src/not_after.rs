// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Computes the notAfter to stamp on certificates submitted to a log.
//!
//! Logs may be temporally sharded, accepting only certificates whose notAfter falls into
//! `[not_after_start, not_after_limit)`. The hammer picks a notAfter well inside that window.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::{LogTarget, ShardBounds},
    error::ConfigError,
};

/// Validity used when a log has no upper shard bound.
pub const DEFAULT_VALIDITY: TimeDelta = TimeDelta::hours(24);

/// Distance kept from the shard limit when the log has no lower bound.
pub const LIMIT_MARGIN: TimeDelta = TimeDelta::hours(1);

/// Returns the notAfter for the given shard bounds, or `None` on overflow.
pub fn not_after_for_bounds(bounds: &ShardBounds, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match (bounds.start, bounds.limit) {
        (None, None) => now.checked_add_signed(DEFAULT_VALIDITY),
        (Some(start), None) => start.checked_add_signed(DEFAULT_VALIDITY),
        (Some(start), Some(limit)) => start.checked_add_signed((limit - start) / 2),
        (None, Some(limit)) => limit.checked_sub_signed(LIMIT_MARGIN),
    }
}

/// Returns the notAfter to use for `target`.
///
/// An override applies to every log verbatim. Otherwise the log's shard bounds are parsed and
/// [`not_after_for_bounds`] decides.
pub fn resolve_not_after(
    not_after_override: Option<DateTime<Utc>>,
    target: &LogTarget,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ConfigError> {
    if let Some(not_after) = not_after_override {
        return Ok(not_after);
    }
    let bounds = target.shard_bounds()?;
    not_after_for_bounds(&bounds, now).ok_or_else(|| ConfigError::TimestampOutOfRange {
        prefix: target.prefix.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_timestamp;

    fn t0() -> DateTime<Utc> {
        parse_timestamp("2024-03-01T12:00:00Z").unwrap()
    }

    fn sharded(start: Option<&str>, limit: Option<&str>) -> LogTarget {
        let mut target = LogTarget::new("athos");
        target.not_after_start = start.map(str::to_owned);
        target.not_after_limit = limit.map(str::to_owned);
        target
    }

    #[test]
    fn unsharded_log_gets_a_day_from_now() {
        let now = Utc::now();
        let not_after = resolve_not_after(None, &LogTarget::new("athos"), now).unwrap();
        assert!(not_after >= now);
        assert!(not_after <= now + TimeDelta::hours(24));
        assert_eq!(not_after, now + TimeDelta::hours(24));
    }

    #[test]
    fn start_only_gets_a_day_from_start() {
        let target = sharded(Some("2024-03-01T12:00:00Z"), None);
        let not_after = resolve_not_after(None, &target, Utc::now()).unwrap();
        assert_eq!(not_after, t0() + TimeDelta::hours(24));
    }

    #[test]
    fn both_bounds_give_the_midpoint() {
        let target = sharded(Some("2024-03-01T12:00:00Z"), Some("2024-03-01T22:00:00Z"));
        let not_after = resolve_not_after(None, &target, Utc::now()).unwrap();
        assert_eq!(not_after, t0() + TimeDelta::hours(5));
    }

    #[test]
    fn midpoint_keeps_sub_second_precision() {
        let bounds = ShardBounds {
            start: Some(t0()),
            limit: Some(t0() + TimeDelta::nanoseconds(3)),
        };
        assert_eq!(
            not_after_for_bounds(&bounds, Utc::now()),
            Some(t0() + TimeDelta::nanoseconds(1))
        );
    }

    #[test]
    fn limit_only_backs_off_an_hour() {
        let target = sharded(None, Some("2024-03-01T12:00:00Z"));
        let not_after = resolve_not_after(None, &target, Utc::now()).unwrap();
        assert_eq!(not_after, t0() - TimeDelta::hours(1));
    }

    #[test]
    fn override_wins_over_bounds() {
        let fixed = parse_timestamp("2030-01-01T00:00:00Z").unwrap();
        for target in [
            LogTarget::new("athos"),
            sharded(Some("2024-03-01T12:00:00Z"), None),
            sharded(Some("2024-03-01T12:00:00Z"), Some("2024-03-01T22:00:00Z")),
            sharded(None, Some("2024-03-01T12:00:00Z")),
            sharded(Some("garbage"), None),
        ] {
            assert_eq!(resolve_not_after(Some(fixed), &target, t0()).unwrap(), fixed);
        }
    }

    #[test]
    fn malformed_bound_is_fatal() {
        let target = sharded(Some("2024-03-01T12:00:00Z"), Some("not a time"));
        assert!(matches!(
            resolve_not_after(None, &target, t0()),
            Err(ConfigError::InvalidTimestamp { field: "not_after_limit", .. })
        ));
    }
}
