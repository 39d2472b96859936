//! Delay normalization and reveal-time projection.
//!
//! The delay input changed shape three times over the product's life: a
//! combined minute count, a days-only value, and a {days, hours, minutes}
//! triple. Every write and every read re-derives one canonical minute
//! count instead of trusting whichever shape a client happened to send.
//! Reveal status is likewise recomputed per read, never stored.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Upper bound for any stored delay: 30 days in minutes.
pub const MAX_DELAY_MINUTES: i64 = 30 * 24 * 60;

const MAX_DAYS: f64 = 30.0;
const MAX_HOURS: f64 = 23.0;
const MAX_MINUTES: f64 = 59.0;

/// Raw delay fields as they arrive from a client. Any field may be absent
/// or unparseable; `Some(NAN)` means "present but not a number" — presence
/// decides which branch applies, the value decides the arithmetic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DelayInput {
    /// Combined total in minutes. Wins over the triple when finite.
    pub total_minutes: Option<f64>,
    pub days: Option<f64>,
    pub hours: Option<f64>,
    pub minutes: Option<f64>,
}

impl DelayInput {
    /// Build from multipart text fields. A present field that fails to
    /// parse stays present (as NAN) so it still selects its branch.
    pub fn from_form(
        total_minutes: Option<&str>,
        days: Option<&str>,
        hours: Option<&str>,
        minutes: Option<&str>,
    ) -> Self {
        Self {
            total_minutes: parse_field(total_minutes),
            days: parse_field(days),
            hours: parse_field(hours),
            minutes: parse_field(minutes),
        }
    }
}

fn parse_field(raw: Option<&str>) -> Option<f64> {
    raw.map(|s| s.trim().parse::<f64>().unwrap_or(f64::NAN))
}

/// Clamp a single triple component to `[0, max]`, truncating fractions.
/// Non-finite (absent, NAN, infinite) collapses to 0.
fn component(value: Option<f64>, max: f64) -> i64 {
    match value {
        Some(v) if v.is_finite() => v.trunc().clamp(0.0, max) as i64,
        _ => 0,
    }
}

/// Reduce any historical delay shape to a canonical minute count in
/// `[0, MAX_DELAY_MINUTES]`.
///
/// Precedence: a finite combined minute count wins; otherwise the
/// {days, hours, minutes} triple applies when any of its fields is
/// present, each component clamped to its natural range before summing
/// (a days-only request is just the triple with one field). No delay
/// fields at all means 0.
pub fn normalize_delay(input: &DelayInput) -> i64 {
    if let Some(total) = input.total_minutes {
        if total.is_finite() {
            return (total.trunc() as i64).clamp(0, MAX_DELAY_MINUTES);
        }
    }

    if input.days.is_some() || input.hours.is_some() || input.minutes.is_some() {
        let days = component(input.days, MAX_DAYS);
        let hours = component(input.hours, MAX_HOURS);
        let minutes = component(input.minutes, MAX_MINUTES);
        return (days * 1440 + hours * 60 + minutes).clamp(0, MAX_DELAY_MINUTES);
    }

    0
}

/// Canonicalize the delay of a persisted record. Older rows carry only a
/// `delayDays` value; newer rows carry `delayMinutes`.
pub fn stored_delay_minutes(minutes: Option<i64>, days: Option<i64>) -> i64 {
    minutes
        .or_else(|| days.map(|d| d.saturating_mul(1440)))
        .unwrap_or(0)
        .clamp(0, MAX_DELAY_MINUTES)
}

/// Live reveal projection for a letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevealStatus {
    #[serde(rename = "isRevealed")]
    pub is_revealed: bool,
    /// Milliseconds until reveal; 0 once revealed.
    #[serde(rename = "timeLeft")]
    pub time_left_ms: i64,
}

/// Compute reveal status at `now` for a letter scheduled at
/// `schedule_time` with `delay_minutes` of delay.
pub fn reveal_status(
    now: DateTime<Utc>,
    schedule_time: DateTime<Utc>,
    delay_minutes: i64,
) -> RevealStatus {
    let reveal_time = schedule_time + Duration::minutes(delay_minutes);
    RevealStatus {
        is_revealed: now >= reveal_time,
        time_left_ms: (reveal_time - now).num_milliseconds().max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn triple(days: f64, hours: f64, minutes: f64) -> DelayInput {
        DelayInput {
            total_minutes: None,
            days: Some(days),
            hours: Some(hours),
            minutes: Some(minutes),
        }
    }

    #[test]
    fn in_range_triple_sums_exactly() {
        for (d, h, m) in [(0, 0, 0), (1, 0, 0), (0, 23, 59), (30, 0, 0), (7, 12, 30)] {
            let input = triple(d as f64, h as f64, m as f64);
            assert_eq!(normalize_delay(&input), d * 1440 + h * 60 + m);
        }
    }

    #[test]
    fn never_exceeds_thirty_days() {
        // Max representable triple: 30d 23h 59m clamps to the 30-day cap.
        assert_eq!(normalize_delay(&triple(30.0, 23.0, 59.0)), MAX_DELAY_MINUTES);
        assert_eq!(
            normalize_delay(&DelayInput {
                total_minutes: Some(999_999.0),
                ..Default::default()
            }),
            MAX_DELAY_MINUTES
        );
    }

    #[test]
    fn components_clamp_independently() {
        // days=999 clamps to 30, hours=-5 clamps to 0, minutes stays.
        assert_eq!(normalize_delay(&triple(999.0, -5.0, 10.0)), 30 * 1440 + 10);
    }

    #[test]
    fn unparseable_components_are_zero() {
        let input = DelayInput::from_form(None, Some("abc"), Some("2"), Some("xyz"));
        assert_eq!(normalize_delay(&input), 120);
    }

    #[test]
    fn combined_minutes_wins_when_finite() {
        let input = DelayInput {
            total_minutes: Some(90.0),
            days: Some(5.0),
            hours: Some(5.0),
            minutes: Some(5.0),
        };
        assert_eq!(normalize_delay(&input), 90);
    }

    #[test]
    fn unparseable_combined_falls_through_to_triple() {
        let input = DelayInput::from_form(Some("abc"), Some("1"), Some("0"), Some("0"));
        assert_eq!(normalize_delay(&input), 1440);
    }

    #[test]
    fn legacy_days_only_multiplies() {
        let input = DelayInput::from_form(None, Some("2"), None, None);
        assert_eq!(normalize_delay(&input), 2880);
    }

    #[test]
    fn negative_combined_clamps_to_zero() {
        let input = DelayInput {
            total_minutes: Some(-10.0),
            ..Default::default()
        };
        assert_eq!(normalize_delay(&input), 0);
    }

    #[test]
    fn nothing_present_is_zero() {
        assert_eq!(normalize_delay(&DelayInput::default()), 0);
    }

    #[test]
    fn stored_delay_prefers_minutes_over_days() {
        assert_eq!(stored_delay_minutes(Some(90), Some(5)), 90);
        assert_eq!(stored_delay_minutes(None, Some(2)), 2880);
        assert_eq!(stored_delay_minutes(None, None), 0);
        assert_eq!(stored_delay_minutes(Some(-5), None), 0);
        assert_eq!(stored_delay_minutes(None, Some(9999)), MAX_DELAY_MINUTES);
    }

    #[test]
    fn reveal_boundary() {
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let before = scheduled + Duration::seconds(59);
        let status = reveal_status(before, scheduled, 1);
        assert!(!status.is_revealed);
        assert_eq!(status.time_left_ms, 1000);

        let exactly = scheduled + Duration::minutes(1);
        let status = reveal_status(exactly, scheduled, 1);
        assert!(status.is_revealed);
        assert_eq!(status.time_left_ms, 0);

        let after = scheduled + Duration::seconds(61);
        let status = reveal_status(after, scheduled, 1);
        assert!(status.is_revealed);
        assert_eq!(status.time_left_ms, 0);
    }

    #[test]
    fn zero_delay_reveals_immediately() {
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let status = reveal_status(scheduled, scheduled, 0);
        assert!(status.is_revealed);
        assert_eq!(status.time_left_ms, 0);
    }

    #[test]
    fn reveal_is_monotonic_in_now() {
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let delay = 90;
        let mut revealed_seen = false;
        for offset_s in (0..3 * 60 * 60).step_by(60) {
            let now = scheduled + Duration::seconds(offset_s);
            let status = reveal_status(now, scheduled, delay);
            if revealed_seen {
                assert!(status.is_revealed, "reveal flipped back at +{offset_s}s");
            }
            revealed_seen = status.is_revealed;
        }
        assert!(revealed_seen);
    }
}
