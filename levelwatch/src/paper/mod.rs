use crate::alert::AlertKind;
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use levelwatch_instrument::{Side, instrument::Instrument, instrument::MarketId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod engine;

/// Opaque paper-trade identifier.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
#[serde(transparent)]
pub struct TradeId(pub Uuid);

impl TradeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Whether the trade was opened fresh or grew by averaging into an existing
/// open position.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeMode {
    New,
    Averaged,
}

/// A simulated position. No real capital moves.
///
/// Closed trades are immutable; `pnl` is always derived, never stored.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct PaperTrade {
    pub id: TradeId,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    pub status: TradeStatus,
    /// The alert kind that opened the trade.
    pub trigger_level: AlertKind,
    pub mode: TradeMode,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PaperTrade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn market_id(&self) -> MarketId {
        self.instrument.market_id()
    }

    /// Margin debited from the virtual balance at entry.
    pub fn notional(&self) -> Decimal {
        self.entry_price * Decimal::from(self.quantity)
    }

    /// Mark-to-market P&L of an open trade at `ltp`.
    pub fn unrealised_pnl(&self, ltp: Decimal) -> Decimal {
        let quantity = Decimal::from(self.quantity);
        match self.side {
            Side::Buy => (ltp - self.entry_price) * quantity,
            Side::Sell => (self.entry_price - ltp) * quantity,
        }
    }

    /// P&L locked in at close; `None` while the trade is open.
    pub fn realised_pnl(&self) -> Option<Decimal> {
        self.exit_price.map(|exit| self.unrealised_pnl(exit))
    }
}

/// A session's paper-trading state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaperBook {
    pub trades: Vec<PaperTrade>,
    pub virtual_balance: Decimal,
    pub auto_enabled: bool,
    pub allow_averaging: bool,
}

impl PaperBook {
    pub fn new(virtual_balance: Decimal, allow_averaging: bool) -> Self {
        Self {
            trades: Vec::new(),
            virtual_balance,
            auto_enabled: false,
            allow_averaging,
        }
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &PaperTrade> {
        self.trades.iter().filter(|trade| trade.is_open())
    }

    pub fn trade(&self, id: TradeId) -> Option<&PaperTrade> {
        self.trades.iter().find(|trade| trade.id == id)
    }

    pub(crate) fn trade_mut(&mut self, id: TradeId) -> Option<&mut PaperTrade> {
        self.trades.iter_mut().find(|trade| trade.id == id)
    }

    pub(crate) fn open_trade_mut(
        &mut self,
        market: MarketId,
        side: Side,
    ) -> Option<&mut PaperTrade> {
        self.trades
            .iter_mut()
            .find(|trade| trade.is_open() && trade.market_id() == market && trade.side == side)
    }
}

/// Paper-engine failures, surfaced as command-reply errors.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PaperError {
    #[error("virtual balance {balance} cannot fund the entry")]
    InsufficientBalance { balance: Decimal },

    #[error("an open {side} trade already exists for {market}")]
    DuplicateOpenTrade { market: MarketId, side: Side },

    #[error("unknown trade: {0}")]
    UnknownTrade(TradeId),

    #[error("trade already closed: {0}")]
    TradeAlreadyClosed(TradeId),

    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("no price observed yet for {0}")]
    NoMarketPrice(MarketId),
}

/// Aggregate view of the book pushed with `trade_update` frames and the paper
/// summary endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaperSummary {
    pub open_trades: usize,
    pub closed_trades: usize,
    pub realised_pnl: Decimal,
    pub unrealised_pnl: Decimal,
    pub virtual_balance: Decimal,
    pub auto_enabled: bool,
}
