use chrono::{DateTime, Utc};
use derive_more::Constructor;
use indexmap::IndexMap;
use levelwatch_instrument::{Side, instrument::Instrument, instrument::MarketId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

pub mod evaluator;
pub mod pivots;

/// Opaque alert identifier.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
#[serde(transparent)]
pub struct AlertId(pub Uuid);

impl AlertId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the level the price must cross onto for the alert to fire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertCondition {
    Above,
    Below,
}

/// Origin of an alert: placed by hand, or generated from the reference-day
/// OHLC pivot grid.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    Manual,
    AutoHigh,
    AutoLow,
    AutoR1,
    AutoR2,
    AutoR3,
    AutoR4,
    AutoR5,
    AutoR6,
    AutoS1,
    AutoS2,
    AutoS3,
    AutoS4,
    AutoS5,
    AutoS6,
}

impl AlertKind {
    pub fn is_auto(&self) -> bool {
        !matches!(self, AlertKind::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Manual => "MANUAL",
            AlertKind::AutoHigh => "AUTO_HIGH",
            AlertKind::AutoLow => "AUTO_LOW",
            AlertKind::AutoR1 => "AUTO_R1",
            AlertKind::AutoR2 => "AUTO_R2",
            AlertKind::AutoR3 => "AUTO_R3",
            AlertKind::AutoR4 => "AUTO_R4",
            AlertKind::AutoR5 => "AUTO_R5",
            AlertKind::AutoR6 => "AUTO_R6",
            AlertKind::AutoS1 => "AUTO_S1",
            AlertKind::AutoS2 => "AUTO_S2",
            AlertKind::AutoS3 => "AUTO_S3",
            AlertKind::AutoS4 => "AUTO_S4",
            AlertKind::AutoS5 => "AUTO_S5",
            AlertKind::AutoS6 => "AUTO_S6",
        }
    }

    /// Crossing direction implied by the level: resistances and the previous
    /// high are approached from below, supports and the previous low from
    /// above.
    pub fn condition(&self) -> Option<AlertCondition> {
        match self {
            AlertKind::Manual => None,
            AlertKind::AutoHigh
            | AlertKind::AutoR1
            | AlertKind::AutoR2
            | AlertKind::AutoR3
            | AlertKind::AutoR4
            | AlertKind::AutoR5
            | AlertKind::AutoR6 => Some(AlertCondition::Above),
            AlertKind::AutoLow
            | AlertKind::AutoS1
            | AlertKind::AutoS2
            | AlertKind::AutoS3
            | AlertKind::AutoS4
            | AlertKind::AutoS5
            | AlertKind::AutoS6 => Some(AlertCondition::Below),
        }
    }

    /// Paper-trade entry side for a trigger on this level.
    ///
    /// Supports buy, resistances sell. The previous-day extremes default to
    /// mean-reversion (HIGH touched from below sells, LOW touched from above
    /// buys); `breakout` inverts the extremes only.
    pub fn entry_side(&self, breakout: bool) -> Option<Side> {
        match self {
            AlertKind::Manual => None,
            AlertKind::AutoHigh => Some(if breakout { Side::Buy } else { Side::Sell }),
            AlertKind::AutoLow => Some(if breakout { Side::Sell } else { Side::Buy }),
            AlertKind::AutoR1
            | AlertKind::AutoR2
            | AlertKind::AutoR3
            | AlertKind::AutoR4
            | AlertKind::AutoR5
            | AlertKind::AutoR6 => Some(Side::Sell),
            AlertKind::AutoS1
            | AlertKind::AutoS2
            | AlertKind::AutoS3
            | AlertKind::AutoS4
            | AlertKind::AutoS5
            | AlertKind::AutoS6 => Some(Side::Buy),
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A price-level alert rule.
///
/// Fires at most once: `armed` drops on the first trigger and the alert moves
/// from the active set into the session's alert log.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Alert {
    pub id: AlertId,
    pub instrument: Instrument,
    pub condition: AlertCondition,
    pub price: Decimal,
    pub kind: AlertKind,
    pub armed: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        instrument: Instrument,
        condition: AlertCondition,
        price: Decimal,
        kind: AlertKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::random(),
            instrument,
            condition,
            price,
            kind,
            armed: true,
            created_at,
        }
    }

    pub fn market_id(&self) -> MarketId {
        self.instrument.market_id()
    }
}

/// Record of a fired alert, appended to the session's bounded log.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct AlertLogEntry {
    pub alert: Alert,
    pub triggered_at: DateTime<Utc>,
    pub price_observed: Decimal,
}

/// A session's alert state: armed alerts in creation order, the bounded log of
/// fired ones, and the pause flag.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertBook {
    pub active: IndexMap<AlertId, Alert>,
    pub log: VecDeque<AlertLogEntry>,
    pub paused: bool,
    log_cap: usize,
}

impl AlertBook {
    pub fn new(log_cap: usize) -> Self {
        Self {
            active: IndexMap::new(),
            log: VecDeque::new(),
            paused: false,
            log_cap,
        }
    }

    pub fn insert(&mut self, alert: Alert) -> &Alert {
        let id = alert.id;
        self.active.insert(id, alert);
        &self.active[&id]
    }

    pub fn remove(&mut self, id: AlertId) -> Option<Alert> {
        self.active.shift_remove(&id)
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.active.len();
        self.active.clear();
        removed
    }

    /// Armed alerts for `market`, in creation order.
    pub fn armed_for(&self, market: MarketId) -> impl Iterator<Item = &Alert> {
        self.active
            .values()
            .filter(move |alert| alert.armed && alert.market_id() == market)
    }

    /// Idempotently replace the armed auto alerts for `market` with `alerts`.
    pub fn replace_auto(&mut self, market: MarketId, alerts: Vec<Alert>) -> Vec<Alert> {
        self.active
            .retain(|_, alert| !(alert.kind.is_auto() && alert.market_id() == market));

        alerts
            .into_iter()
            .map(|alert| self.insert(alert).clone())
            .collect()
    }

    /// Move a fired alert into the log ring.
    pub fn record_fired(&mut self, mut alert: Alert, triggered_at: DateTime<Utc>, price_observed: Decimal) -> AlertLogEntry {
        alert.armed = false;
        self.active.shift_remove(&alert.id);

        let entry = AlertLogEntry::new(alert, triggered_at, price_observed);
        self.log.push_back(entry.clone());
        while self.log.len() > self.log_cap {
            self.log.pop_front();
        }
        entry
    }

    pub fn log_cap(&self) -> usize {
        self.log_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use levelwatch_instrument::{exchange::Exchange, instrument::InstrumentToken};
    use rust_decimal_macros::dec;

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Nse, InstrumentToken(2885), "RELIANCE")
    }

    #[test]
    fn test_alert_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&AlertKind::AutoR1).unwrap(),
            r#""AUTO_R1""#
        );
        assert_eq!(
            serde_json::to_string(&AlertKind::Manual).unwrap(),
            r#""MANUAL""#
        );
        assert_eq!(
            serde_json::from_str::<AlertKind>(r#""AUTO_S6""#).unwrap(),
            AlertKind::AutoS6
        );
    }

    #[test]
    fn test_entry_side_mapping() {
        // Mean-reversion defaults
        assert_eq!(AlertKind::AutoHigh.entry_side(false), Some(Side::Sell));
        assert_eq!(AlertKind::AutoLow.entry_side(false), Some(Side::Buy));
        // Breakout flips the extremes only
        assert_eq!(AlertKind::AutoHigh.entry_side(true), Some(Side::Buy));
        assert_eq!(AlertKind::AutoR3.entry_side(true), Some(Side::Sell));
        assert_eq!(AlertKind::AutoS2.entry_side(true), Some(Side::Buy));
        assert_eq!(AlertKind::Manual.entry_side(false), None);
    }

    #[test]
    fn test_log_ring_is_bounded() {
        let mut book = AlertBook::new(3);
        for price in 1..=5i64 {
            let alert = Alert::new(
                instrument(),
                AlertCondition::Above,
                Decimal::from(price),
                AlertKind::Manual,
                Utc::now(),
            );
            book.record_fired(alert, Utc::now(), Decimal::from(price));
        }

        assert_eq!(book.log.len(), 3);
        assert_eq!(book.log.front().unwrap().price_observed, dec!(3));
        assert_eq!(book.log.back().unwrap().price_observed, dec!(5));
    }

    #[test]
    fn test_replace_auto_is_idempotent_and_keeps_manual() {
        let mut book = AlertBook::new(10);
        let manual = Alert::new(
            instrument(),
            AlertCondition::Above,
            dec!(2500),
            AlertKind::Manual,
            Utc::now(),
        );
        book.insert(manual.clone());

        let auto = |kind, price| Alert::new(instrument(), AlertCondition::Above, price, kind, Utc::now());

        let first = book.replace_auto(
            instrument().market_id(),
            vec![auto(AlertKind::AutoR1, dec!(2520)), auto(AlertKind::AutoR2, dec!(2540))],
        );
        assert_eq!(first.len(), 2);
        assert_eq!(book.active.len(), 3);

        let second = book.replace_auto(
            instrument().market_id(),
            vec![auto(AlertKind::AutoR1, dec!(2520)), auto(AlertKind::AutoR2, dec!(2540))],
        );
        assert_eq!(second.len(), 2);
        // Same count as before - the previous auto set was dropped, manual kept
        assert_eq!(book.active.len(), 3);
        assert!(book.active.contains_key(&manual.id));
    }
}
