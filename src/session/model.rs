//! Game-State Entities
//!
//! Shapes of the store-owned records the session engine reads and mutates
//! during one login transaction.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Player identifier, as sent in the identity header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Song catalog id.
pub type SongId = u32;
/// Mission catalog id.
pub type MissionId = u32;
/// Item catalog id.
pub type ItemId = u32;
/// Daily counter id (free gacha draws and the like).
pub type CounterId = u32;
/// Login bonus schedule id.
pub type ScheduleId = u32;

/// Idol-type attribute of a song, copied into the daily song mission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdolType(pub u8);

// =============================================================================
// VITALITY
// =============================================================================

/// Stored vitality record.
///
/// `current` is only a snapshot; the authoritative value is derived from
/// `full_recover_at` at read time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitalityState {
    /// Last stored vitality.
    pub current: u32,
    /// Vitality cap.
    pub max: u32,
    /// Instant at which vitality reaches `max`.
    pub full_recover_at: DateTime<Utc>,
    /// Seconds to regenerate one point.
    pub recover_interval_secs: u32,
}

impl VitalityState {
    /// Full vitality as of `now`.
    pub fn full(max: u32, recover_interval_secs: u32, now: DateTime<Utc>) -> Self {
        Self {
            current: max,
            max,
            full_recover_at: now,
            recover_interval_secs,
        }
    }
}

// =============================================================================
// DAILY CHALLENGE
// =============================================================================

/// Today's challenge song.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyChallenge {
    /// Selected song.
    pub song_id: SongId,
    /// When the selection was made. Only moves on a daily boundary.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// MISSIONS
// =============================================================================

/// Which boundary crossing resets a mission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetClass {
    /// Reset on the first login of a new server day.
    Daily,
    /// Reset on the first login of a new ISO week.
    Weekly,
    /// Never reset.
    None,
}

/// Mission completion state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    /// Counting progress.
    InProgress,
    /// Goal reached.
    Completed,
}

/// Per-user mission progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgress {
    /// Mission identity.
    pub mission_id: MissionId,
    /// Reset tag.
    pub reset_class: ResetClass,
    /// Completion state.
    pub state: MissionState,
    /// Progress counter.
    pub progress: u32,
    /// When this progress row was (re)started.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// Completion instant, `None` while not completed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Contextual idol type (daily song mission only).
    pub context_idol_type: Option<IdolType>,
}

impl MissionProgress {
    /// Fresh in-progress mission.
    pub fn new(mission_id: MissionId, reset_class: ResetClass, now: DateTime<Utc>) -> Self {
        Self {
            mission_id,
            reset_class,
            state: MissionState::InProgress,
            progress: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            context_idol_type: None,
        }
    }

    /// Restart progress from zero as of `now`.
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.progress = 0;
        self.created_at = now;
        self.updated_at = now;
        self.finished_at = None;
    }
}

// =============================================================================
// LOGIN BONUS
// =============================================================================

/// State of one login-bonus day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginBonusState {
    /// Not reached yet.
    Pending,
    /// Available today.
    Active,
    /// Already granted.
    Claimed,
}

/// One day of a login-bonus schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBonusEntry {
    /// Day index within the schedule (1-based).
    pub day: u32,
    /// Entry state.
    pub state: LoginBonusState,
}

/// A login-bonus schedule. At most one entry is `Active`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBonusSchedule {
    /// Schedule identity.
    pub schedule_id: ScheduleId,
    /// Earliest instant at which the next entry may activate.
    pub next_login_at: DateTime<Utc>,
    /// Entries ordered by day.
    pub entries: Vec<LoginBonusEntry>,
}

impl LoginBonusSchedule {
    /// Schedule with `days` pending entries.
    pub fn new(schedule_id: ScheduleId, days: u32, next_login_at: DateTime<Utc>) -> Self {
        Self {
            schedule_id,
            next_login_at,
            entries: (1..=days)
                .map(|day| LoginBonusEntry { day, state: LoginBonusState::Pending })
                .collect(),
        }
    }

    /// Currently active day, if any.
    pub fn active_day(&self) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.state == LoginBonusState::Active)
            .map(|e| e.day)
    }

    /// Number of active entries. Must never exceed one.
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.state == LoginBonusState::Active).count()
    }

    /// Claim the active entry and activate the next pending one.
    ///
    /// Returns the newly active day, if the schedule had one left.
    pub fn advance(&mut self) -> Option<u32> {
        for entry in self.entries.iter_mut() {
            if entry.state == LoginBonusState::Active {
                entry.state = LoginBonusState::Claimed;
            }
        }

        self.entries.sort_by_key(|e| e.day);
        let next = self.entries.iter_mut().find(|e| e.state == LoginBonusState::Pending)?;
        next.state = LoginBonusState::Active;
        Some(next.day)
    }
}

// =============================================================================
// COUNTERS / ITEMS / OFFERS / SONGS
// =============================================================================

/// Counter that restores to its default every server day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    /// Counter identity.
    pub counter_id: CounterId,
    /// Remaining count.
    pub count: u32,
    /// Value restored on daily reset.
    pub default_count: u32,
}

/// "New offer" slot. Unassigned slots are placeholders cleared on daily reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOffer {
    /// Offer identity.
    pub offer_id: u32,
    /// Whether a concrete offer has been bound to this slot.
    pub assigned: bool,
}

/// Song catalog entry with the attribute used by the daily song mission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    /// Song identity.
    pub song_id: SongId,
    /// Idol type of the song.
    pub idol_type: IdolType,
}
