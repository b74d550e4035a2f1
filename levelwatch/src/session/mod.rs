use crate::{alert::AlertBook, paper::PaperBook};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Constructor;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use levelwatch_feed::BrokerCredentials;
use levelwatch_instrument::instrument::{DayOhlc, Instrument, MarketId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

pub mod command;
pub mod registry;
pub mod runner;
pub mod snapshot;

/// Ephemeral session identity: one per login, replaced on rehydrate.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable user identity: survives restarts and keys the durable snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserId(SmolStr);

impl UserId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One watched instrument with its last seen price.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct WatchlistItem {
    pub instrument: Instrument,
    pub ltp: Option<Decimal>,
    pub added_at: DateTime<Utc>,
}

/// The complete per-user state, exclusively owned by the session's command
/// loop. Nothing outside the runner ever holds a reference to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Opaque broker tokens delegated to the upstream feed for auth.
    pub credentials: Option<BrokerCredentials>,
    /// At most one entry per token; insertion order is display order.
    pub watchlist: IndexMap<MarketId, WatchlistItem>,
    pub alerts: AlertBook,
    pub paper: PaperBook,
    /// The day whose OHLC seeds auto alerts; `None` means latest available.
    pub reference_date: Option<NaiveDate>,
    /// Last price this session observed per token - the alert evaluator's
    /// "previous observation", seeded from cached PDC.
    pub last_ltp: FnvHashMap<MarketId, Decimal>,
    /// Previous-day OHLC cache, valid for `ohlc_cached_day` only.
    pub ohlc_cache: FnvHashMap<MarketId, DayOhlc>,
    pub ohlc_cached_day: Option<NaiveDate>,
    /// Set when an invariant violation or corrupt snapshot was detected;
    /// all further commands are refused.
    pub quarantined: bool,
}

impl SessionState {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        credentials: Option<BrokerCredentials>,
        starting_balance: Decimal,
        allow_averaging: bool,
        alert_log_cap: usize,
    ) -> Self {
        Self {
            session_id,
            user_id,
            credentials,
            watchlist: IndexMap::new(),
            alerts: AlertBook::new(alert_log_cap),
            paper: PaperBook::new(starting_balance, allow_averaging),
            reference_date: None,
            last_ltp: FnvHashMap::default(),
            ohlc_cache: FnvHashMap::default(),
            ohlc_cached_day: None,
            quarantined: false,
        }
    }

    /// Tokens the session should be subscribed to upstream.
    pub fn watched_markets(&self) -> Vec<MarketId> {
        self.watchlist.keys().copied().collect()
    }
}
