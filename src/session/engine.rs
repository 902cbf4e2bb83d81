//! Session Reset Engine
//!
//! Runs once per login call:
//!
//! ```text
//! begin(user)
//!   -> recompute vitality, write it back
//!   -> detect boundaries (server clock)
//!   -> daily reset  (if crossed)
//!   -> weekly reset (if crossed)
//!   -> last_login = now
//! commit
//! ```
//!
//! Any error drops the transaction, so `last_login` only moves when every
//! reset step made it to the store. A retry on the next login runs the same
//! resets again.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::calendar::ServerClock;
use super::model::{SongId, UserId};
use super::reset::{apply_daily_reset, apply_weekly_reset, ResetConfig};
use super::store::{GameStateStore, StateError};
use super::vitality;
use crate::rpc::{RpcContext, RpcDispatcher, RpcError};

/// Method name of the login call.
pub const LOGIN_METHOD: &str = "AuthService.Login";

/// Result of one login, returned to the client as the RPC result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    /// Caller.
    pub user_id: UserId,
    /// Recomputed vitality.
    pub vitality: u32,
    /// Vitality cap.
    pub vitality_max: u32,
    /// Instant at which vitality is full.
    pub full_recover_at: DateTime<Utc>,
    /// A daily reset ran during this login.
    pub daily_reset: bool,
    /// A weekly reset ran during this login.
    pub weekly_reset: bool,
    /// Current daily challenge song, if any.
    pub daily_song_id: Option<SongId>,
    /// Server instant used for this login.
    pub server_time: DateTime<Utc>,
}

/// Login-time state engine.
pub struct SessionResetEngine {
    store: Arc<dyn GameStateStore>,
    config: ResetConfig,
    clock: ServerClock,
    rng: Mutex<StdRng>,
}

impl SessionResetEngine {
    /// Create an engine with an entropy-seeded song picker.
    pub fn new(store: Arc<dyn GameStateStore>, config: ResetConfig, clock: ServerClock) -> Self {
        Self {
            store,
            config,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the song picker with a deterministic one.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Server clock used for boundary detection.
    pub fn clock(&self) -> ServerClock {
        self.clock
    }

    /// Log in at the current wall-clock time.
    pub async fn login(&self, user_id: UserId) -> Result<LoginOutcome, StateError> {
        self.login_at(user_id, Utc::now()).await
    }

    /// Log in as of `now`.
    #[instrument(skip(self))]
    pub async fn login_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<LoginOutcome, StateError> {
        let mut tx = self.store.begin(user_id).await?;

        let vitality = vitality::refresh(&tx.vitality_state()?, now)?;
        tx.set_vitality_state(vitality)?;

        let boundary = self.clock.detect(tx.last_login()?, now);

        if boundary.daily {
            let report = {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| StateError::Store("song picker lock poisoned".into()))?;
                apply_daily_reset(tx.as_mut(), now, &self.clock, &self.config, &mut *rng)?
            };
            debug!(
                "Daily reset: song={:?} missions={} counters={} offers={}",
                report.song_id, report.missions_reset, report.counters_restored, report.offers_cleared
            );
        }

        if boundary.weekly {
            let missions = apply_weekly_reset(tx.as_mut(), now)?;
            debug!("Weekly reset: missions={}", missions);
        }

        tx.set_last_login(now)?;
        let daily_song_id = tx.daily_challenge()?.map(|c| c.song_id);

        tx.commit()?;

        info!(
            "User {} logged in (vitality {}/{}, daily={}, weekly={})",
            user_id, vitality.current, vitality.max, boundary.daily, boundary.weekly
        );

        Ok(LoginOutcome {
            user_id,
            vitality: vitality.current,
            vitality_max: vitality.max,
            full_recover_at: vitality.full_recover_at,
            daily_reset: boundary.daily,
            weekly_reset: boundary.weekly,
            daily_song_id,
            server_time: now,
        })
    }
}

impl std::fmt::Debug for SessionResetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResetEngine")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Register the login method on a dispatcher.
pub fn register_login(dispatcher: &mut RpcDispatcher, engine: Arc<SessionResetEngine>) {
    dispatcher.register(LOGIN_METHOD, move |_params: Value, ctx: RpcContext| {
        let engine = engine.clone();
        async move {
            let user_id = ctx.require_user()?;
            let outcome = engine.login(user_id).await?;
            serde_json::to_value(outcome).map_err(|e| RpcError::Handler(e.to_string()))
        }
    });
}
