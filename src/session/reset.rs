//! Daily / Weekly Reset Procedures
//!
//! Both run inside the caller's login transaction and never commit on their
//! own. Any error leaves the transaction to be dropped by the caller.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::calendar::ServerClock;
use super::model::{DailyChallenge, ItemId, MissionId, MissionState, ResetClass, ScheduleId, SongId};
use super::store::{StateError, StoreTransaction};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// A calendar date that forces a specific daily challenge song.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialDate {
    /// Month (1-12).
    pub month: u32,
    /// Day of month (1-31).
    pub day: u32,
    /// Song to select on that date.
    pub song_id: SongId,
}

impl SpecialDate {
    /// Whether `date` falls on this month/day.
    pub fn matches(&self, date: NaiveDate) -> bool {
        date.month() == self.month && date.day() == self.day
    }
}

/// Daily reset tuning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConfig {
    /// One-day consumables zeroed on every daily reset.
    pub one_day_items: Vec<ItemId>,
    /// Mission whose idol-type context follows the daily challenge song.
    pub daily_song_mission: Option<MissionId>,
    /// Date-pinned challenge songs.
    pub special_dates: Vec<SpecialDate>,
}

/// What a daily reset changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyResetReport {
    /// Newly selected challenge song, if any song was available.
    pub song_id: Option<SongId>,
    /// Daily missions restarted.
    pub missions_reset: usize,
    /// One-day items zeroed.
    pub items_cleared: usize,
    /// Unassigned offer placeholders removed.
    pub offers_cleared: usize,
    /// Daily counters restored.
    pub counters_restored: usize,
    /// Login-bonus schedules advanced, with the newly active day.
    pub login_bonus_days: Vec<(ScheduleId, Option<u32>)>,
}

// =============================================================================
// SONG SELECTION
// =============================================================================

/// Pick today's challenge song.
///
/// 1. A special date whose song is unlocked wins outright.
/// 2. With unplayed songs available, a fair coin chooses between the
///    unplayed pool and the full unlocked pool. The weighting matches
///    observed client-facing behavior and is an assumption.
/// 3. Otherwise pick uniformly from all unlocked songs.
///
/// Returns `None` when nothing is unlocked.
pub fn choose_daily_song<R: Rng + ?Sized>(
    today: NaiveDate,
    unlocked: &[SongId],
    unplayed: &[SongId],
    special_dates: &[SpecialDate],
    rng: &mut R,
) -> Option<SongId> {
    if let Some(special) = special_dates
        .iter()
        .find(|s| s.matches(today) && unlocked.contains(&s.song_id))
    {
        return Some(special.song_id);
    }

    let pool = if !unplayed.is_empty() && rng.gen_bool(0.5) {
        unplayed
    } else {
        unlocked
    };
    pool.choose(rng).copied()
}

// =============================================================================
// RESET PROCEDURES
// =============================================================================

/// Restart every in-progress mission of `class`. Completed missions are kept.
pub fn reset_missions(
    tx: &mut dyn StoreTransaction,
    class: ResetClass,
    now: DateTime<Utc>,
) -> Result<usize, StateError> {
    let missions = tx.missions(class, MissionState::InProgress)?;
    let count = missions.len();

    for mut mission in missions {
        mission.restart(now);
        tx.update_mission(mission)?;
    }

    Ok(count)
}

/// Apply the daily reset.
pub fn apply_daily_reset<R: Rng + ?Sized>(
    tx: &mut dyn StoreTransaction,
    now: DateTime<Utc>,
    clock: &ServerClock,
    config: &ResetConfig,
    rng: &mut R,
) -> Result<DailyResetReport, StateError> {
    let mut report = DailyResetReport::default();
    let today = clock.local_date(now);

    // Challenge song
    let unlocked = tx.unlocked_songs()?;
    let unplayed = tx.unplayed_songs()?;
    report.song_id = choose_daily_song(today, &unlocked, &unplayed, &config.special_dates, rng);
    match report.song_id {
        Some(song_id) => tx.set_daily_challenge(DailyChallenge { song_id, updated_at: now })?,
        None => warn!("User {} has no unlocked songs; daily challenge kept", tx.user_id()),
    }

    // One-day consumables
    for item_id in &config.one_day_items {
        tx.zero_item_balance(*item_id)?;
    }
    report.items_cleared = config.one_day_items.len();

    // Daily missions
    report.missions_reset = reset_missions(tx, ResetClass::Daily, now)?;

    // Daily song mission context
    if let (Some(mission_id), Some(song_id)) = (config.daily_song_mission, report.song_id) {
        match tx.mission(mission_id)? {
            Some(mut mission) => {
                mission.context_idol_type = tx.song_idol_type(song_id)?;
                mission.updated_at = now;
                tx.update_mission(mission)?;
            }
            None => debug!("Daily song mission {} not present for user {}", mission_id, tx.user_id()),
        }
    }

    // New offer placeholders
    report.offers_cleared = tx.clear_unassigned_offers()?;

    // Free-draw counters
    for counter in tx.daily_counters()? {
        tx.reset_counter(counter.counter_id, counter.default_count)?;
        report.counters_restored += 1;
    }

    // Login bonus rollover
    for mut schedule in tx.login_bonus_schedules()? {
        if now < schedule.next_login_at {
            continue;
        }
        let active = schedule.advance();
        schedule.next_login_at = clock.next_day_start(now);
        report.login_bonus_days.push((schedule.schedule_id, active));
        tx.update_login_bonus_schedule(schedule)?;
    }

    Ok(report)
}

/// Apply the weekly reset. Returns the number of missions restarted.
pub fn apply_weekly_reset(tx: &mut dyn StoreTransaction, now: DateTime<Utc>) -> Result<usize, StateError> {
    reset_missions(tx, ResetClass::Weekly, now)
}
