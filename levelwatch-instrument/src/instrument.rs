use crate::exchange::Exchange;
use chrono::NaiveDate;
use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};

/// Numeric instrument token assigned by the broker scrip master.
///
/// Tokens are only meaningful within an [`Exchange`] segment - see [`MarketId`]
/// for the globally unique identity.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Constructor,
)]
#[serde(transparent)]
pub struct InstrumentToken(pub u32);

impl InstrumentToken {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Display for InstrumentToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstrumentToken {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Globally unique instrument identity: `(exchange, token)`.
///
/// Used as the key of the subscription ledger, the per-session tick mailbox and
/// every watchlist / alert / trade lookup.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Constructor,
)]
pub struct MarketId {
    pub exchange: Exchange,
    pub token: InstrumentToken,
}

impl Display for MarketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.token)
    }
}

/// Tradeable instrument resolved from the broker scrip master.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub token: InstrumentToken,
    pub symbol: SmolStr,
}

impl Instrument {
    pub fn new<S>(exchange: Exchange, token: InstrumentToken, symbol: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self {
            exchange,
            token,
            symbol: symbol.into(),
        }
    }

    pub fn market_id(&self) -> MarketId {
        MarketId::new(self.exchange, self.token)
    }
}

impl Display for Instrument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Previous-day OHLC for an instrument, cached per market day.
///
/// Seeds the alert evaluator's first "previous observation" (via `close`) and the
/// auto-generated support/resistance levels.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct DayOhlc {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_id_display() {
        let market = MarketId::new(Exchange::Nse, InstrumentToken(2885));
        assert_eq!(market.to_string(), "NSE:2885");
    }

    #[test]
    fn test_instrument_serde_round_trip() {
        let instrument = Instrument::new(Exchange::Nse, InstrumentToken(2885), "RELIANCE");
        let json = serde_json::to_string(&instrument).unwrap();
        let actual = serde_json::from_str::<Instrument>(&json).unwrap();
        assert_eq!(actual, instrument);
    }

    #[test]
    fn test_day_ohlc_serde() {
        let ohlc = DayOhlc::new(
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            dec!(2450.0),
            dec!(2520.5),
            dec!(2440.0),
            dec!(2500.0),
        );
        let json = serde_json::to_string(&ohlc).unwrap();
        assert_eq!(serde_json::from_str::<DayOhlc>(&json).unwrap(), ohlc);
    }
}
