use crate::{
    alert::{Alert, AlertBook, AlertLogEntry},
    paper::{PaperBook, PaperTrade},
    persist::PersistError,
    session::{SessionId, SessionState, UserId, WatchlistItem},
};
use chrono::{DateTime, NaiveDate, Utc};
use levelwatch_feed::BrokerCredentials;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// The versioned durable form of a session, keyed by `user_id`.
///
/// Carries everything in [`SessionState`] that is not ephemeral: the bound
/// channel, last-seen prices and the OHLC cache are all rebuilt from live
/// traffic after rehydrate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionSnapshot {
    pub version: u8,
    pub user_id: UserId,
    pub credentials: Option<BrokerCredentials>,
    pub watchlist: Vec<WatchlistItem>,
    /// Armed alerts in original creation order.
    pub active_alerts: Vec<Alert>,
    pub alert_log: Vec<AlertLogEntry>,
    pub trades: Vec<PaperTrade>,
    pub virtual_balance: Decimal,
    pub auto_paper_enabled: bool,
    pub allow_averaging: bool,
    pub alerts_paused: bool,
    pub reference_date: Option<NaiveDate>,
    /// Logical timestamp of the snapshot; drives cold-TTL eviction.
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Capture the durable parts of `state`, keeping at most
    /// `closed_trade_cap` closed trades (open trades are always kept).
    pub fn capture(state: &SessionState, closed_trade_cap: usize, now: DateTime<Utc>) -> Self {
        let closed_surplus = state
            .paper
            .trades
            .iter()
            .filter(|trade| !trade.is_open())
            .count()
            .saturating_sub(closed_trade_cap);

        let mut dropped = 0;
        let trades: Vec<PaperTrade> = state
            .paper
            .trades
            .iter()
            .filter(|trade| {
                if trade.is_open() {
                    return true;
                }
                if dropped < closed_surplus {
                    dropped += 1;
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            user_id: state.user_id.clone(),
            credentials: state.credentials.clone(),
            watchlist: state.watchlist.values().cloned().collect(),
            active_alerts: state.alerts.active.values().cloned().collect(),
            alert_log: state.alerts.log.iter().cloned().collect(),
            trades,
            virtual_balance: state.paper.virtual_balance,
            auto_paper_enabled: state.paper.auto_enabled,
            allow_averaging: state.paper.allow_averaging,
            alerts_paused: state.alerts.paused,
            reference_date: state.reference_date,
            updated_at: now,
        }
    }

    /// Rebuild live session state under a fresh `session_id`.
    pub fn restore(self, session_id: SessionId, alert_log_cap: usize) -> SessionState {
        let mut alerts = AlertBook::new(alert_log_cap);
        for alert in self.active_alerts {
            alerts.insert(alert);
        }
        alerts.log = self.alert_log.into_iter().collect();
        while alerts.log.len() > alert_log_cap {
            alerts.log.pop_front();
        }
        alerts.paused = self.alerts_paused;

        let mut paper = PaperBook::new(self.virtual_balance, self.allow_averaging);
        paper.auto_enabled = self.auto_paper_enabled;
        paper.trades = self.trades;

        let mut state = SessionState::new(
            session_id,
            self.user_id,
            self.credentials,
            paper.virtual_balance,
            paper.allow_averaging,
            alert_log_cap,
        );
        state.alerts = alerts;
        state.paper = paper;
        state.reference_date = self.reference_date;
        state.watchlist = self
            .watchlist
            .into_iter()
            .map(|item| (item.instrument.market_id(), item))
            .collect();
        state
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        serde_json::to_vec(self).map_err(PersistError::Serialise)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        // Peek the version before committing to the full layout
        #[derive(Deserialize)]
        struct Versioned {
            version: u8,
        }

        let version = serde_json::from_slice::<Versioned>(bytes)
            .map_err(|error| PersistError::Corrupt(error.to_string()))?
            .version;
        if version != SNAPSHOT_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }

        serde_json::from_slice(bytes).map_err(|error| PersistError::Corrupt(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Alert, AlertCondition, AlertKind};
    use crate::paper::engine::{self, EntrySignal};
    use levelwatch_instrument::{
        Side,
        exchange::Exchange,
        instrument::{Instrument, InstrumentToken},
    };
    use rust_decimal_macros::dec;

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Nse, InstrumentToken(2885), "RELIANCE")
    }

    fn populated_state() -> SessionState {
        let mut state = SessionState::new(
            SessionId::random(),
            UserId::new("bhavesh"),
            Some(BrokerCredentials::new("key".into(), "token".into())),
            dec!(100000),
            false,
            500,
        );

        state.watchlist.insert(
            instrument().market_id(),
            WatchlistItem {
                instrument: instrument(),
                ltp: Some(dec!(2500)),
                added_at: Utc::now(),
            },
        );
        state.alerts.insert(Alert::new(
            instrument(),
            AlertCondition::Above,
            dec!(2550),
            AlertKind::Manual,
            Utc::now(),
        ));
        engine::enter(
            &mut state.paper,
            EntrySignal {
                instrument: instrument(),
                side: Side::Buy,
                entry_price: dec!(2500),
                trigger_level: AlertKind::Manual,
                quantity: Some(10),
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();
        state.last_ltp.insert(instrument().market_id(), dec!(2500));
        state
    }

    #[test]
    fn test_snapshot_round_trip_modulo_ephemeral_fields() {
        let state = populated_state();
        let snapshot = SessionSnapshot::capture(&state, 100, Utc::now());

        let bytes = snapshot.encode().unwrap();
        let decoded = SessionSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snapshot);

        let restored = decoded.restore(SessionId::random(), 500);
        assert_eq!(restored.user_id, state.user_id);
        assert_eq!(restored.watchlist, state.watchlist);
        assert_eq!(restored.alerts.active, state.alerts.active);
        assert_eq!(restored.paper.trades, state.paper.trades);
        assert_eq!(restored.paper.virtual_balance, state.paper.virtual_balance);

        // Ephemeral: fresh identity, no observed prices, no OHLC cache
        assert_ne!(restored.session_id, state.session_id);
        assert!(restored.last_ltp.is_empty());
        assert!(restored.ohlc_cache.is_empty());
        assert!(!restored.quarantined);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let state = populated_state();
        let mut snapshot = SessionSnapshot::capture(&state, 100, Utc::now());
        snapshot.version = 99;

        let bytes = snapshot.encode().unwrap();
        assert!(matches!(
            SessionSnapshot::decode(&bytes),
            Err(PersistError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SessionSnapshot::decode(b"not a snapshot"),
            Err(PersistError::Corrupt(_))
        ));
    }

    #[test]
    fn test_capture_bounds_closed_trades_keeps_open() {
        let mut state = populated_state();
        for index in 0..5u64 {
            let trade = engine::enter(
                &mut state.paper,
                EntrySignal {
                    instrument: instrument(),
                    side: Side::Sell,
                    entry_price: dec!(100) + Decimal::from(index),
                    trigger_level: AlertKind::Manual,
                    quantity: Some(1),
                },
                Decimal::ONE,
                Utc::now(),
            )
            .unwrap();
            engine::close(&mut state.paper, trade.id, dec!(100), Utc::now()).unwrap();
        }

        let snapshot = SessionSnapshot::capture(&state, 2, Utc::now());
        let open = snapshot.trades.iter().filter(|t| t.is_open()).count();
        let closed = snapshot.trades.iter().filter(|t| !t.is_open()).count();
        assert_eq!(open, 1);
        assert_eq!(closed, 2);

        // The most recent closed trades survive
        assert_eq!(snapshot.trades.last().unwrap().entry_price, dec!(104));
    }
}
