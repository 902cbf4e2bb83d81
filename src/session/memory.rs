//! In-Memory Game-State Store
//!
//! Reference [`GameStateStore`] used by the binary and the tests.
//! A transaction holds the store lock for its whole lifetime and mutates a
//! private copy of the user's record; `commit` swaps the copy in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::model::{
    CounterId, DailyChallenge, DailyCounter, IdolType, ItemId, LoginBonusSchedule, MissionId,
    MissionProgress, MissionState, NewOffer, ResetClass, ScheduleId, Song, SongId, UserId,
    VitalityState,
};
use super::store::{GameStateStore, StateError, StoreTransaction};

/// Everything the store keeps for one user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserRecord {
    /// Vitality snapshot.
    pub vitality: VitalityState,
    /// Last successful login.
    pub last_login_at: Option<DateTime<Utc>>,
    /// Unlocked songs.
    pub unlocked_songs: BTreeSet<SongId>,
    /// Songs with at least one play.
    pub played_songs: BTreeSet<SongId>,
    /// Daily challenge selection.
    pub daily_challenge: Option<DailyChallenge>,
    /// Mission progress by id.
    pub missions: BTreeMap<MissionId, MissionProgress>,
    /// Daily counters by id.
    pub counters: BTreeMap<CounterId, DailyCounter>,
    /// Item balances by id.
    pub items: BTreeMap<ItemId, u32>,
    /// "New offer" slots.
    pub offers: Vec<NewOffer>,
    /// Login-bonus schedules by id.
    pub login_bonuses: BTreeMap<ScheduleId, LoginBonusSchedule>,
}

impl UserRecord {
    /// Brand-new player with full vitality and nothing else.
    pub fn new_player(vitality_max: u32, recover_interval_secs: u32, now: DateTime<Utc>) -> Self {
        Self {
            vitality: VitalityState::full(vitality_max, recover_interval_secs, now),
            last_login_at: None,
            unlocked_songs: BTreeSet::new(),
            played_songs: BTreeSet::new(),
            daily_challenge: None,
            missions: BTreeMap::new(),
            counters: BTreeMap::new(),
            items: BTreeMap::new(),
            offers: Vec::new(),
            login_bonuses: BTreeMap::new(),
        }
    }

    /// Starting fixture for a fresh process: every catalog song unlocked
    /// and, when one is configured, the daily song mission in progress.
    pub fn starter(
        catalog: &[Song],
        daily_song_mission: Option<MissionId>,
        vitality_max: u32,
        recover_interval_secs: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let record = Self::new_player(vitality_max, recover_interval_secs, now)
            .with_unlocked(catalog.iter().map(|song| song.song_id));
        match daily_song_mission {
            Some(mission_id) => record.with_mission(MissionProgress::new(mission_id, ResetClass::Daily, now)),
            None => record,
        }
    }

    /// Unlock songs.
    pub fn with_unlocked(mut self, songs: impl IntoIterator<Item = SongId>) -> Self {
        self.unlocked_songs.extend(songs);
        self
    }

    /// Add a mission row.
    pub fn with_mission(mut self, mission: MissionProgress) -> Self {
        self.missions.insert(mission.mission_id, mission);
        self
    }

    /// Add a daily counter.
    pub fn with_counter(mut self, counter: DailyCounter) -> Self {
        self.counters.insert(counter.counter_id, counter);
        self
    }

    /// Set an item balance.
    pub fn with_item(mut self, item_id: ItemId, amount: u32) -> Self {
        self.items.insert(item_id, amount);
        self
    }

    /// Add a login-bonus schedule.
    pub fn with_login_bonus(mut self, schedule: LoginBonusSchedule) -> Self {
        self.login_bonuses.insert(schedule.schedule_id, schedule);
        self
    }
}

/// Shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<Mutex<BTreeMap<UserId, UserRecord>>>,
    songs: Arc<BTreeMap<SongId, Song>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a store over a fixed song catalog.
    pub fn new(songs: impl IntoIterator<Item = Song>) -> Self {
        Self {
            users: Arc::new(Mutex::new(BTreeMap::new())),
            songs: Arc::new(songs.into_iter().map(|s| (s.song_id, s)).collect()),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Insert or replace a user record.
    pub async fn insert_user(&self, user_id: UserId, record: UserRecord) {
        self.users.lock().await.insert(user_id, record);
    }

    /// Snapshot of a user record.
    pub async fn user(&self, user_id: UserId) -> Option<UserRecord> {
        self.users.lock().await.get(&user_id).cloned()
    }

    /// Make the next commit fail (fault injection for rollback tests).
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GameStateStore for MemoryStore {
    async fn begin(&self, user_id: UserId) -> Result<Box<dyn StoreTransaction>, StateError> {
        let guard = self.users.clone().lock_owned().await;
        let working = guard
            .get(&user_id)
            .cloned()
            .ok_or(StateError::UserNotFound(user_id))?;

        Ok(Box::new(MemoryTransaction {
            guard,
            user_id,
            working,
            songs: self.songs.clone(),
            fail_commit: self.fail_next_commit.clone(),
        }))
    }
}

/// Open transaction on a [`MemoryStore`].
struct MemoryTransaction {
    guard: OwnedMutexGuard<BTreeMap<UserId, UserRecord>>,
    user_id: UserId,
    working: UserRecord,
    songs: Arc<BTreeMap<SongId, Song>>,
    fail_commit: Arc<AtomicBool>,
}

impl StoreTransaction for MemoryTransaction {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn vitality_state(&self) -> Result<VitalityState, StateError> {
        Ok(self.working.vitality)
    }

    fn set_vitality_state(&mut self, state: VitalityState) -> Result<(), StateError> {
        if state.current > state.max {
            return Err(StateError::InvalidVitality(format!(
                "current {} exceeds max {}",
                state.current, state.max
            )));
        }
        self.working.vitality = state;
        Ok(())
    }

    fn last_login(&self) -> Result<Option<DateTime<Utc>>, StateError> {
        Ok(self.working.last_login_at)
    }

    fn set_last_login(&mut self, at: DateTime<Utc>) -> Result<(), StateError> {
        self.working.last_login_at = Some(at);
        Ok(())
    }

    fn unlocked_songs(&self) -> Result<Vec<SongId>, StateError> {
        Ok(self.working.unlocked_songs.iter().copied().collect())
    }

    fn unplayed_songs(&self) -> Result<Vec<SongId>, StateError> {
        Ok(self
            .working
            .unlocked_songs
            .difference(&self.working.played_songs)
            .copied()
            .collect())
    }

    fn song_idol_type(&self, song_id: SongId) -> Result<Option<IdolType>, StateError> {
        Ok(self.songs.get(&song_id).map(|s| s.idol_type))
    }

    fn daily_challenge(&self) -> Result<Option<DailyChallenge>, StateError> {
        Ok(self.working.daily_challenge)
    }

    fn set_daily_challenge(&mut self, challenge: DailyChallenge) -> Result<(), StateError> {
        self.working.daily_challenge = Some(challenge);
        Ok(())
    }

    fn missions(
        &self,
        reset_class: ResetClass,
        state: MissionState,
    ) -> Result<Vec<MissionProgress>, StateError> {
        Ok(self
            .working
            .missions
            .values()
            .filter(|m| m.reset_class == reset_class && m.state == state)
            .cloned()
            .collect())
    }

    fn mission(&self, mission_id: MissionId) -> Result<Option<MissionProgress>, StateError> {
        Ok(self.working.missions.get(&mission_id).cloned())
    }

    fn update_mission(&mut self, mission: MissionProgress) -> Result<(), StateError> {
        match self.working.missions.get_mut(&mission.mission_id) {
            Some(slot) => {
                *slot = mission;
                Ok(())
            }
            None => Err(StateError::NotFound {
                kind: "mission",
                id: u64::from(mission.mission_id),
            }),
        }
    }

    fn daily_counters(&self) -> Result<Vec<DailyCounter>, StateError> {
        Ok(self.working.counters.values().copied().collect())
    }

    fn reset_counter(&mut self, counter_id: CounterId, count: u32) -> Result<(), StateError> {
        let counter = self
            .working
            .counters
            .get_mut(&counter_id)
            .ok_or(StateError::NotFound { kind: "counter", id: u64::from(counter_id) })?;
        counter.count = count;
        Ok(())
    }

    fn zero_item_balance(&mut self, item_id: ItemId) -> Result<(), StateError> {
        if let Some(amount) = self.working.items.get_mut(&item_id) {
            *amount = 0;
        }
        Ok(())
    }

    fn clear_unassigned_offers(&mut self) -> Result<usize, StateError> {
        let before = self.working.offers.len();
        self.working.offers.retain(|o| o.assigned);
        Ok(before - self.working.offers.len())
    }

    fn login_bonus_schedules(&self) -> Result<Vec<LoginBonusSchedule>, StateError> {
        Ok(self.working.login_bonuses.values().cloned().collect())
    }

    fn update_login_bonus_schedule(&mut self, schedule: LoginBonusSchedule) -> Result<(), StateError> {
        self.working.login_bonuses.insert(schedule.schedule_id, schedule);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StateError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StateError::Store("injected commit failure".into()));
        }

        let MemoryTransaction { mut guard, user_id, working, .. } = *self;
        guard.insert(user_id, working);
        debug!("Committed state for user {}", user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new([Song { song_id: 1, idol_type: IdolType(2) }]);
        let record = UserRecord::new_player(60, 300, now()).with_unlocked([1, 2, 3]);
        store.insert_user(UserId(1), record).await;
        store
    }

    #[tokio::test]
    async fn test_begin_unknown_user() {
        let store = seeded_store().await;
        let result = store.begin(UserId(99)).await;
        assert!(matches!(result, Err(StateError::UserNotFound(UserId(99)))));
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = seeded_store().await;

        let mut tx = store.begin(UserId(1)).await.unwrap();
        tx.set_last_login(now()).unwrap();
        tx.commit().unwrap();

        let record = store.user(UserId(1)).await.unwrap();
        assert_eq!(record.last_login_at, Some(now()));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = seeded_store().await;

        {
            let mut tx = store.begin(UserId(1)).await.unwrap();
            tx.set_last_login(now()).unwrap();
            // dropped without commit
        }

        let record = store.user(UserId(1)).await.unwrap();
        assert_eq!(record.last_login_at, None);
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = seeded_store().await;
        store.fail_next_commit();

        let mut tx = store.begin(UserId(1)).await.unwrap();
        tx.set_last_login(now()).unwrap();
        assert!(matches!(tx.commit(), Err(StateError::Store(_))));
        assert_eq!(store.user(UserId(1)).await.unwrap().last_login_at, None);

        // Only the next commit fails
        let mut tx = store.begin(UserId(1)).await.unwrap();
        tx.set_last_login(now()).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.user(UserId(1)).await.unwrap().last_login_at, Some(now()));
    }

    #[tokio::test]
    async fn test_unplayed_songs() {
        let store = MemoryStore::new([]);
        let mut record = UserRecord::new_player(60, 300, now()).with_unlocked([1, 2, 3]);
        record.played_songs.insert(2);
        store.insert_user(UserId(1), record).await;

        let tx = store.begin(UserId(1)).await.unwrap();
        assert_eq!(tx.unplayed_songs().unwrap(), vec![1, 3]);
        assert_eq!(tx.unlocked_songs().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_vitality_invariant_enforced() {
        let store = seeded_store().await;
        let mut tx = store.begin(UserId(1)).await.unwrap();

        let mut vitality = tx.vitality_state().unwrap();
        vitality.current = vitality.max + 1;
        assert!(matches!(
            tx.set_vitality_state(vitality),
            Err(StateError::InvalidVitality(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_unassigned_offers() {
        let store = MemoryStore::new([]);
        let mut record = UserRecord::new_player(60, 300, now());
        record.offers = vec![
            NewOffer { offer_id: 1, assigned: true },
            NewOffer { offer_id: 2, assigned: false },
            NewOffer { offer_id: 3, assigned: false },
        ];
        store.insert_user(UserId(1), record).await;

        let mut tx = store.begin(UserId(1)).await.unwrap();
        assert_eq!(tx.clear_unassigned_offers().unwrap(), 2);
        tx.commit().unwrap();

        let record = store.user(UserId(1)).await.unwrap();
        assert_eq!(record.offers.len(), 1);
        assert_eq!(record.offers[0].offer_id, 1);
    }

    #[tokio::test]
    async fn test_song_catalog_lookup() {
        let store = seeded_store().await;
        let tx = store.begin(UserId(1)).await.unwrap();
        assert_eq!(tx.song_idol_type(1).unwrap(), Some(IdolType(2)));
        assert_eq!(tx.song_idol_type(7).unwrap(), None);
    }
}
