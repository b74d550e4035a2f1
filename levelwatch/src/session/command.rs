use crate::{
    alert::{Alert, AlertCondition, AlertId, AlertLogEntry},
    channel::manager::{ChannelHandle, ChannelId},
    paper::{PaperError, PaperSummary, PaperTrade, TradeId},
    session::{SessionId, UserId, WatchlistItem},
};
use chrono::NaiveDate;
use levelwatch_feed::Tick;
use levelwatch_instrument::{Side, instrument::Instrument, instrument::MarketId};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

/// Reply slot of a command: the submitter awaits the session loop's verdict.
pub type Replier<T> = oneshot::Sender<Result<T, SessionError>>;

/// Everything a session's command loop can be asked to do.
///
/// Commands are processed strictly in submission order by the single consumer
/// that owns the state; producers never touch session fields directly.
/// `Tick` and the timer probes are fire-and-forget, everything else replies.
#[derive(Debug)]
pub enum Command {
    AddToWatchlist {
        instrument: Instrument,
        reply: Replier<WatchlistItem>,
    },
    RemoveFromWatchlist {
        market: MarketId,
        reply: Replier<()>,
    },
    /// Re-resolve the previous-day OHLC cache for every watched instrument.
    RefreshWatchlist {
        reply: Replier<Vec<WatchlistItem>>,
    },
    SetReferenceDate {
        date: Option<NaiveDate>,
        reply: Replier<Option<NaiveDate>>,
    },
    CreateAlert {
        market: MarketId,
        condition: AlertCondition,
        price: Decimal,
        reply: Replier<Alert>,
    },
    DeleteAlert {
        id: AlertId,
        reply: Replier<()>,
    },
    DeleteAlerts {
        ids: Vec<AlertId>,
        reply: Replier<usize>,
    },
    ClearAlerts {
        reply: Replier<usize>,
    },
    PauseAlerts {
        paused: bool,
        reply: Replier<bool>,
    },
    GenerateAutoAlerts {
        market: MarketId,
        reply: Replier<Vec<Alert>>,
    },
    SetPaperEnabled {
        enabled: bool,
        reply: Replier<bool>,
    },
    SetVirtualBalance {
        balance: Decimal,
        reply: Replier<Decimal>,
    },
    SetStopLoss {
        trade_id: TradeId,
        stop_loss: Option<Decimal>,
        reply: Replier<PaperTrade>,
    },
    SetTarget {
        trade_id: TradeId,
        target: Option<Decimal>,
        reply: Replier<PaperTrade>,
    },
    CloseTrade {
        trade_id: TradeId,
        reply: Replier<PaperTrade>,
    },
    ManualTrade {
        market: MarketId,
        side: Side,
        quantity: Option<u64>,
        reply: Replier<PaperTrade>,
    },
    ClearClosedTrades {
        reply: Replier<usize>,
    },
    /// Read-only aggregate for the HTTP surface.
    View {
        reply: Replier<SessionView>,
    },
    AlertLogs {
        reply: Replier<Vec<AlertLogEntry>>,
    },
    TradesCsv {
        reply: Replier<String>,
    },
    /// A conflated price observation; fire-and-forget.
    Tick(Tick),
    /// Timer probe closing open trades inside the square-off window even when
    /// the instrument is silent.
    SquareOffCheck,
    BindChannel {
        channel: ChannelHandle,
        reply: Replier<SessionId>,
    },
    /// Channel-side teardown; `clean` reflects the close-code policy.
    UnbindChannel {
        channel_id: ChannelId,
        clean: bool,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// User-visible session failures, delivered as command replies and converted
/// to HTTP responses / `error` frames at the edge.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SessionError {
    #[error("already on the watchlist: {0}")]
    DuplicateWatchlistEntry(MarketId),

    #[error("not on the watchlist: {0}")]
    NotOnWatchlist(MarketId),

    #[error("unknown instrument: {0}")]
    UnknownInstrument(MarketId),

    #[error("unknown alert: {0}")]
    UnknownAlert(AlertId),

    #[error("alert price must be positive, got {0}")]
    InvalidAlertPrice(Decimal),

    #[error("no reference-day OHLC available for {0}")]
    NoReferenceOhlc(MarketId),

    #[error(transparent)]
    Paper(#[from] PaperError),

    #[error("session is quarantined")]
    Quarantined,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Stable reason code carried by `error` frames and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::DuplicateWatchlistEntry(_) => "watchlist_duplicate",
            SessionError::NotOnWatchlist(_) => "watchlist_missing",
            SessionError::UnknownInstrument(_) => "instrument_unknown",
            SessionError::UnknownAlert(_) => "alert_unknown",
            SessionError::InvalidAlertPrice(_) => "alert_price_invalid",
            SessionError::NoReferenceOhlc(_) => "ohlc_unavailable",
            SessionError::Paper(PaperError::InsufficientBalance { .. }) => "balance_insufficient",
            SessionError::Paper(PaperError::DuplicateOpenTrade { .. }) => "trade_duplicate",
            SessionError::Paper(PaperError::UnknownTrade(_)) => "trade_unknown",
            SessionError::Paper(PaperError::TradeAlreadyClosed(_)) => "trade_closed",
            SessionError::Paper(PaperError::InvalidPrice(_)) => "price_invalid",
            SessionError::Paper(PaperError::NoMarketPrice(_)) => "price_unavailable",
            SessionError::Quarantined => "session_quarantined",
            SessionError::Internal(_) => "internal",
        }
    }
}

/// Submission-level failures, distinct from in-session errors: the command
/// never reached the loop.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CommandError {
    /// The bounded command queue is full; the producer should retry.
    #[error("session command queue is full, retry")]
    QueueFull,

    #[error("session not found")]
    SessionGone,

    /// The loop dropped the reply slot (shutdown raced the command).
    #[error("session stopped before replying")]
    ReplyDropped,
}

/// Read-only aggregate of a session, served to the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub watchlist: Vec<WatchlistItem>,
    pub active_alerts: Vec<Alert>,
    pub alerts_paused: bool,
    pub reference_date: Option<NaiveDate>,
    pub trades: Vec<PaperTrade>,
    pub paper: PaperSummary,
}
