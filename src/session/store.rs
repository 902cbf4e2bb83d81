//! Game-State Store Interface
//!
//! The narrow view of the persistent store that the session engine needs.
//! Every login runs inside exactly one [`StoreTransaction`]; dropping a
//! transaction without committing discards all of its writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::model::{
    CounterId, DailyChallenge, DailyCounter, IdolType, ItemId, LoginBonusSchedule, MissionId,
    MissionProgress, MissionState, ResetClass, SongId, UserId, VitalityState,
};

/// Game-state errors. Any of these aborts the login transaction.
#[derive(Debug, Error)]
pub enum StateError {
    /// No record exists for the user.
    #[error("unknown user {0}")]
    UserNotFound(UserId),

    /// Stored vitality violates its invariants.
    #[error("invalid vitality state: {0}")]
    InvalidVitality(String),

    /// Referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: u64,
    },

    /// Backend failure (lock poisoned, commit rejected, I/O).
    #[error("store failure: {0}")]
    Store(String),
}

/// Opens login transactions.
#[async_trait]
pub trait GameStateStore: Send + Sync {
    /// Begin a transaction scoped to one user.
    async fn begin(&self, user_id: UserId) -> Result<Box<dyn StoreTransaction>, StateError>;
}

/// Operations available inside one login transaction.
pub trait StoreTransaction: Send {
    /// User the transaction is scoped to.
    fn user_id(&self) -> UserId;

    /// Stored vitality record.
    fn vitality_state(&self) -> Result<VitalityState, StateError>;
    /// Replace the vitality record.
    fn set_vitality_state(&mut self, state: VitalityState) -> Result<(), StateError>;

    /// Last successful login, `None` before the first one.
    fn last_login(&self) -> Result<Option<DateTime<Utc>>, StateError>;
    /// Record a successful login.
    fn set_last_login(&mut self, at: DateTime<Utc>) -> Result<(), StateError>;

    /// Songs the user has unlocked.
    fn unlocked_songs(&self) -> Result<Vec<SongId>, StateError>;
    /// Unlocked songs the user has never played.
    fn unplayed_songs(&self) -> Result<Vec<SongId>, StateError>;
    /// Catalog idol type of a song.
    fn song_idol_type(&self, song_id: SongId) -> Result<Option<IdolType>, StateError>;

    /// Current daily challenge, if one was ever selected.
    fn daily_challenge(&self) -> Result<Option<DailyChallenge>, StateError>;
    /// Replace the daily challenge.
    fn set_daily_challenge(&mut self, challenge: DailyChallenge) -> Result<(), StateError>;

    /// Missions matching a reset class and state.
    fn missions(
        &self,
        reset_class: ResetClass,
        state: MissionState,
    ) -> Result<Vec<MissionProgress>, StateError>;
    /// Single mission by id.
    fn mission(&self, mission_id: MissionId) -> Result<Option<MissionProgress>, StateError>;
    /// Write back a mission row.
    fn update_mission(&mut self, mission: MissionProgress) -> Result<(), StateError>;

    /// Daily counters.
    fn daily_counters(&self) -> Result<Vec<DailyCounter>, StateError>;
    /// Set a counter's remaining count.
    fn reset_counter(&mut self, counter_id: CounterId, count: u32) -> Result<(), StateError>;

    /// Zero an item balance. Missing items are not an error.
    fn zero_item_balance(&mut self, item_id: ItemId) -> Result<(), StateError>;

    /// Remove unassigned "new offer" placeholders. Returns how many were removed.
    fn clear_unassigned_offers(&mut self) -> Result<usize, StateError>;

    /// Login-bonus schedules.
    fn login_bonus_schedules(&self) -> Result<Vec<LoginBonusSchedule>, StateError>;
    /// Write back a login-bonus schedule.
    fn update_login_bonus_schedule(&mut self, schedule: LoginBonusSchedule) -> Result<(), StateError>;

    /// Make every write visible atomically.
    fn commit(self: Box<Self>) -> Result<(), StateError>;
}
