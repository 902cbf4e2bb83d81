//! Vitality Recompute
//!
//! Vitality is never ticked. It is derived on read from the instant at which
//! it will be full again:
//!
//! ```text
//! now >= full_recover_at  =>  max
//! otherwise               =>  max - ceil(secs_until_full / interval), clamped to [0, max]
//! ```

use chrono::{DateTime, Duration, Utc};

use super::model::VitalityState;
use super::store::StateError;

/// Vitality as of `now`.
pub fn recompute(state: &VitalityState, now: DateTime<Utc>) -> Result<u32, StateError> {
    if state.recover_interval_secs == 0 {
        return Err(StateError::InvalidVitality("recover interval is zero".into()));
    }

    if now >= state.full_recover_at {
        return Ok(state.max);
    }

    // Millisecond precision so a partially regenerated point still counts as missing
    let remaining_ms = (state.full_recover_at - now).num_milliseconds().max(0) as u64;
    let interval_ms = u64::from(state.recover_interval_secs) * 1000;
    let missing = remaining_ms.div_ceil(interval_ms);

    Ok(u64::from(state.max).saturating_sub(missing) as u32)
}

/// Recompute and return an updated record with `current` refreshed.
///
/// A stored `current > max` is clamped rather than rejected; the recomputed
/// value never exceeds `max`.
pub fn refresh(state: &VitalityState, now: DateTime<Utc>) -> Result<VitalityState, StateError> {
    let current = recompute(state, now)?.min(state.max);
    Ok(VitalityState { current, ..*state })
}

/// Instant at which `current` points will have regenerated to `max`.
pub fn full_recover_at(
    current: u32,
    max: u32,
    recover_interval_secs: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let missing = i64::from(max.saturating_sub(current));
    now + Duration::seconds(missing * i64::from(recover_interval_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MAX: u32 = 60;
    const INTERVAL: u32 = 300;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn state(full_recover_at: DateTime<Utc>) -> VitalityState {
        VitalityState {
            current: 0,
            max: MAX,
            full_recover_at,
            recover_interval_secs: INTERVAL,
        }
    }

    #[test]
    fn test_full_when_recover_instant_passed() {
        let s = state(now() - Duration::seconds(10));
        assert_eq!(recompute(&s, now()).unwrap(), MAX);
    }

    #[test]
    fn test_full_exactly_at_recover_instant() {
        let s = state(now());
        assert_eq!(recompute(&s, now()).unwrap(), MAX);
    }

    #[test]
    fn test_elapsed_beyond_full_cycle_is_max() {
        // Drained to zero, then waited interval * max seconds or longer
        let drained_at = now();
        let s = state(full_recover_at(0, MAX, INTERVAL, drained_at));

        for extra in [0i64, 1, 299, 3600, 86_400] {
            let elapsed = i64::from(INTERVAL) * i64::from(MAX) + extra;
            let later = drained_at + Duration::seconds(elapsed);
            assert_eq!(recompute(&s, later).unwrap(), MAX);
        }
    }

    #[test]
    fn test_zero_elapsed_keeps_stored_value() {
        let stored = 40;
        let recover = full_recover_at(stored, MAX, INTERVAL, now());
        let s = VitalityState { current: stored, ..state(recover) };

        assert_eq!(recompute(&s, now()).unwrap(), stored);
    }

    #[test]
    fn test_partial_point_counts_as_missing() {
        // 301 seconds left = 2 points missing
        let s = state(now() + Duration::seconds(301));
        assert_eq!(recompute(&s, now()).unwrap(), MAX - 2);

        // 300 seconds left = exactly 1 point missing
        let s = state(now() + Duration::seconds(300));
        assert_eq!(recompute(&s, now()).unwrap(), MAX - 1);

        // 1 millisecond left still counts
        let s = state(now() + Duration::milliseconds(1));
        assert_eq!(recompute(&s, now()).unwrap(), MAX - 1);
    }

    #[test]
    fn test_clamped_at_zero() {
        // Far-future recovery cannot push vitality below zero
        let s = state(now() + Duration::days(30));
        assert_eq!(recompute(&s, now()).unwrap(), 0);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let s = VitalityState { recover_interval_secs: 0, ..state(now()) };
        assert!(matches!(recompute(&s, now()), Err(StateError::InvalidVitality(_))));
    }

    #[test]
    fn test_refresh_clamps_stale_current() {
        let s = VitalityState { current: 500, ..state(now() - Duration::seconds(1)) };
        let refreshed = refresh(&s, now()).unwrap();
        assert_eq!(refreshed.current, MAX);
        assert_eq!(refreshed.full_recover_at, s.full_recover_at);
    }
}
