//! Session Reset Engine
//!
//! Login-time game-state logic: lazy vitality recompute plus the daily and
//! weekly resets, all applied inside one store transaction per login.
//!
//! - `model.rs`    - Store-owned entities
//! - `store.rs`    - Store / transaction interface
//! - `memory.rs`   - In-memory reference store
//! - `vitality.rs` - Vitality recompute
//! - `calendar.rs` - Server clock and boundary detection
//! - `reset.rs`    - Daily / weekly reset procedures
//! - `engine.rs`   - Per-login orchestration and the login RPC method

pub mod calendar;
pub mod engine;
pub mod memory;
pub mod model;
pub mod reset;
pub mod store;
pub mod vitality;

pub use calendar::{ResetBoundary, ServerClock};
pub use engine::{register_login, LoginOutcome, SessionResetEngine, LOGIN_METHOD};
pub use memory::{MemoryStore, UserRecord};
pub use model::{
    DailyChallenge, DailyCounter, IdolType, LoginBonusSchedule, MissionProgress, MissionState,
    ResetClass, Song, SongId, UserId, VitalityState,
};
pub use reset::{DailyResetReport, ResetConfig, SpecialDate};
pub use store::{GameStateStore, StateError, StoreTransaction};
