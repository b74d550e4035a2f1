use crate::{
    alert::AlertKind,
    paper::{PaperBook, PaperError, PaperSummary, PaperTrade, TradeId, TradeMode, TradeStatus},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use levelwatch_instrument::{Side, instrument::Instrument, instrument::MarketId};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;
use tracing::{debug, info};

/// An entry request derived from an alert trigger or placed manually.
#[derive(Debug, Clone)]
pub struct EntrySignal {
    pub instrument: Instrument,
    pub side: Side,
    pub entry_price: Decimal,
    pub trigger_level: AlertKind,
    /// Explicit size for manual trades; auto entries size off the balance cap.
    pub quantity: Option<u64>,
}

/// Open a position (or average into one) for `signal`.
///
/// Sizing: `quantity × entry_price ≤ virtual_balance × per_trade_cap`. The
/// notional is debited from the balance as margin and credited back, plus
/// realised P&L, at close.
pub fn enter(
    book: &mut PaperBook,
    signal: EntrySignal,
    per_trade_cap: Decimal,
    now: DateTime<Utc>,
) -> Result<PaperTrade, PaperError> {
    if signal.entry_price <= Decimal::ZERO {
        return Err(PaperError::InvalidPrice(signal.entry_price));
    }
    if book.virtual_balance <= Decimal::ZERO {
        debug!(
            balance = %book.virtual_balance,
            instrument = %signal.instrument,
            "entry refused: exhausted virtual balance"
        );
        return Err(PaperError::InsufficientBalance {
            balance: book.virtual_balance,
        });
    }

    let funds = book.virtual_balance * per_trade_cap;
    let quantity = match signal.quantity {
        Some(quantity) => quantity,
        None => (funds / signal.entry_price)
            .floor()
            .to_u64()
            .unwrap_or(0),
    };

    if quantity == 0 || Decimal::from(quantity) * signal.entry_price > funds {
        return Err(PaperError::InsufficientBalance {
            balance: book.virtual_balance,
        });
    }

    let market = signal.instrument.market_id();
    let cost = Decimal::from(quantity) * signal.entry_price;

    if book.open_trade_mut(market, signal.side).is_some() && !book.allow_averaging {
        return Err(PaperError::DuplicateOpenTrade {
            market,
            side: signal.side,
        });
    }

    if let Some(existing) = book.open_trade_mut(market, signal.side) {
        // Size-weighted average entry; quantity accumulates
        let held = Decimal::from(existing.quantity);
        let added = Decimal::from(quantity);
        existing.entry_price =
            (existing.entry_price * held + signal.entry_price * added) / (held + added);
        existing.quantity += quantity;
        existing.mode = TradeMode::Averaged;
        let updated = existing.clone();

        book.virtual_balance -= cost;
        info!(trade = %updated.id, quantity, "averaged into open paper trade");
        return Ok(updated);
    }

    let trade = PaperTrade {
        id: TradeId::random(),
        instrument: signal.instrument,
        side: signal.side,
        quantity,
        entry_price: signal.entry_price,
        exit_price: None,
        stop_loss: None,
        target: None,
        status: TradeStatus::Open,
        trigger_level: signal.trigger_level,
        mode: TradeMode::New,
        opened_at: now,
        closed_at: None,
    };

    book.virtual_balance -= cost;
    info!(
        trade = %trade.id,
        instrument = %trade.instrument,
        side = %trade.side,
        quantity,
        entry = %trade.entry_price,
        "opened paper trade"
    );
    book.trades.push(trade.clone());
    Ok(trade)
}

/// Mark open trades of `market` to `ltp`, closing any that breach their
/// stop-loss or target, and all of them when `square_off` holds.
///
/// Returns the trades closed by this tick.
pub fn mark_tick(
    book: &mut PaperBook,
    market: MarketId,
    ltp: Decimal,
    square_off: bool,
    now: DateTime<Utc>,
) -> Vec<PaperTrade> {
    let exits: Vec<TradeId> = book
        .open_trades()
        .filter(|trade| trade.market_id() == market)
        .filter(|trade| square_off || exit_breached(trade, ltp))
        .map(|trade| trade.id)
        .collect();

    exits
        .into_iter()
        .filter_map(|id| close(book, id, ltp, now).ok())
        .collect()
}

fn exit_breached(trade: &PaperTrade, ltp: Decimal) -> bool {
    let stop_hit = trade.stop_loss.is_some_and(|stop| match trade.side {
        Side::Buy => ltp <= stop,
        Side::Sell => ltp >= stop,
    });
    let target_hit = trade.target.is_some_and(|target| match trade.side {
        Side::Buy => ltp >= target,
        Side::Sell => ltp <= target,
    });
    stop_hit || target_hit
}

/// Close every open trade at its last observed price. Trades whose market has
/// produced no tick yet stay open.
pub fn square_off_all(
    book: &mut PaperBook,
    last_ltp: &FnvHashMap<MarketId, Decimal>,
    now: DateTime<Utc>,
) -> Vec<PaperTrade> {
    let exits: Vec<(TradeId, Decimal)> = book
        .open_trades()
        .filter_map(|trade| {
            last_ltp
                .get(&trade.market_id())
                .map(|ltp| (trade.id, *ltp))
        })
        .collect();

    exits
        .into_iter()
        .filter_map(|(id, ltp)| close(book, id, ltp, now).ok())
        .collect()
}

/// Close `id` at `exit_price`, crediting margin plus realised P&L back to the
/// balance.
pub fn close(
    book: &mut PaperBook,
    id: TradeId,
    exit_price: Decimal,
    now: DateTime<Utc>,
) -> Result<PaperTrade, PaperError> {
    let trade = book.trade_mut(id).ok_or(PaperError::UnknownTrade(id))?;
    if !trade.is_open() {
        return Err(PaperError::TradeAlreadyClosed(id));
    }

    trade.exit_price = Some(exit_price);
    trade.status = TradeStatus::Closed;
    trade.closed_at = Some(now);
    let closed = trade.clone();

    let pnl = closed.realised_pnl().unwrap_or(Decimal::ZERO);
    book.virtual_balance += closed.notional() + pnl;
    info!(trade = %closed.id, exit = %exit_price, %pnl, "closed paper trade");
    Ok(closed)
}

pub fn set_stop_loss(
    book: &mut PaperBook,
    id: TradeId,
    stop_loss: Option<Decimal>,
) -> Result<PaperTrade, PaperError> {
    if let Some(price) = stop_loss
        && price <= Decimal::ZERO
    {
        return Err(PaperError::InvalidPrice(price));
    }
    let trade = book.trade_mut(id).ok_or(PaperError::UnknownTrade(id))?;
    if !trade.is_open() {
        return Err(PaperError::TradeAlreadyClosed(id));
    }
    trade.stop_loss = stop_loss;
    Ok(trade.clone())
}

pub fn set_target(
    book: &mut PaperBook,
    id: TradeId,
    target: Option<Decimal>,
) -> Result<PaperTrade, PaperError> {
    if let Some(price) = target
        && price <= Decimal::ZERO
    {
        return Err(PaperError::InvalidPrice(price));
    }
    let trade = book.trade_mut(id).ok_or(PaperError::UnknownTrade(id))?;
    if !trade.is_open() {
        return Err(PaperError::TradeAlreadyClosed(id));
    }
    trade.target = target;
    Ok(trade.clone())
}

/// Drop closed trades from the book. Open trades are untouched.
pub fn clear_closed(book: &mut PaperBook) -> usize {
    let before = book.trades.len();
    book.trades.retain(PaperTrade::is_open);
    before - book.trades.len()
}

/// Aggregate the book at the given last-observed prices.
pub fn summary(book: &PaperBook, last_ltp: &FnvHashMap<MarketId, Decimal>) -> PaperSummary {
    let realised_pnl = book
        .trades
        .iter()
        .filter_map(PaperTrade::realised_pnl)
        .sum();

    let unrealised_pnl = book
        .open_trades()
        .filter_map(|trade| {
            last_ltp
                .get(&trade.market_id())
                .map(|ltp| trade.unrealised_pnl(*ltp))
        })
        .sum();

    PaperSummary {
        open_trades: book.open_trades().count(),
        closed_trades: book.trades.iter().filter(|t| !t.is_open()).count(),
        realised_pnl,
        unrealised_pnl,
        virtual_balance: book.virtual_balance,
        auto_enabled: book.auto_enabled,
    }
}

#[derive(Debug, Serialize)]
struct TradeCsvRecord<'a> {
    id: String,
    exchange: &'a str,
    symbol: &'a str,
    side: String,
    quantity: u64,
    entry_price: Decimal,
    exit_price: Option<Decimal>,
    stop_loss: Option<Decimal>,
    target: Option<Decimal>,
    status: &'a str,
    trigger_level: String,
    opened_at: String,
    closed_at: Option<String>,
    pnl: Option<Decimal>,
}

/// Render the trade book as CSV for the export endpoint.
pub fn trades_csv(trades: &[PaperTrade]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for trade in trades {
        writer.serialize(TradeCsvRecord {
            id: trade.id.to_string(),
            exchange: trade.instrument.exchange.as_str(),
            symbol: &trade.instrument.symbol,
            side: trade.side.to_string(),
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            stop_loss: trade.stop_loss,
            target: trade.target,
            status: match trade.status {
                TradeStatus::Open => "OPEN",
                TradeStatus::Closed => "CLOSED",
            },
            trigger_level: trade.trigger_level.to_string(),
            opened_at: trade.opened_at.to_rfc3339(),
            closed_at: trade.closed_at.map(|at| at.to_rfc3339()),
            pnl: trade.realised_pnl(),
        })?;
    }

    let bytes = writer.into_inner().unwrap_or_default();
    Ok(String::from_utf8(bytes).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use levelwatch_instrument::{exchange::Exchange, instrument::InstrumentToken};
    use rust_decimal_macros::dec;

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Nse, InstrumentToken(2885), "RELIANCE")
    }

    fn market() -> MarketId {
        instrument().market_id()
    }

    fn signal(side: Side, entry: Decimal) -> EntrySignal {
        EntrySignal {
            instrument: instrument(),
            side,
            entry_price: entry,
            trigger_level: AlertKind::AutoS1,
            quantity: None,
        }
    }

    fn book() -> PaperBook {
        PaperBook::new(dec!(100000), false)
    }

    #[test]
    fn test_entry_sizing_respects_cap_and_balance() {
        let mut book = book();

        // 100% cap: floor(100_000 / 2500) = 40 units
        let trade = enter(&mut book, signal(Side::Buy, dec!(2500)), Decimal::ONE, Utc::now()).unwrap();
        assert_eq!(trade.quantity, 40);
        assert_eq!(book.virtual_balance, Decimal::ZERO);

        // Nothing left to fund a second entry
        let refused = enter(&mut book, signal(Side::Sell, dec!(2500)), Decimal::ONE, Utc::now());
        assert_eq!(
            refused,
            Err(PaperError::InsufficientBalance {
                balance: Decimal::ZERO
            })
        );
    }

    #[test]
    fn test_half_cap_sizing() {
        let mut book = book();
        let trade = enter(
            &mut book,
            signal(Side::Buy, dec!(2500)),
            dec!(0.5),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(trade.quantity, 20);
        assert_eq!(book.virtual_balance, dec!(50000));
    }

    #[test]
    fn test_duplicate_open_trade_refused_without_averaging() {
        let mut book = book();
        enter(&mut book, signal(Side::Buy, dec!(100)), dec!(0.1), Utc::now()).unwrap();

        let refused = enter(&mut book, signal(Side::Buy, dec!(101)), dec!(0.1), Utc::now());
        assert_eq!(
            refused,
            Err(PaperError::DuplicateOpenTrade {
                market: market(),
                side: Side::Buy
            })
        );

        // The opposite side is a separate position
        assert!(enter(&mut book, signal(Side::Sell, dec!(101)), dec!(0.1), Utc::now()).is_ok());
    }

    #[test]
    fn test_averaging_adjusts_entry_to_weighted_mean() {
        let mut book = PaperBook::new(dec!(100000), true);

        let first = enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Buy, dec!(100))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();

        let averaged = enter(
            &mut book,
            EntrySignal {
                quantity: Some(30),
                ..signal(Side::Buy, dec!(120))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(averaged.id, first.id);
        assert_eq!(averaged.quantity, 40);
        // (100*10 + 120*30) / 40 = 115
        assert_eq!(averaged.entry_price, dec!(115));
        assert_eq!(averaged.mode, TradeMode::Averaged);
        assert_eq!(book.trades.len(), 1);
    }

    #[test]
    fn test_stop_loss_and_target_exits() {
        struct TestCase {
            name: &'static str,
            side: Side,
            stop_loss: Option<Decimal>,
            target: Option<Decimal>,
            ltp: Decimal,
            expect_closed: bool,
        }

        let cases = vec![
            TestCase {
                name: "buy stop-loss breached",
                side: Side::Buy,
                stop_loss: Some(dec!(95)),
                target: None,
                ltp: dec!(95),
                expect_closed: true,
            },
            TestCase {
                name: "buy stop-loss intact",
                side: Side::Buy,
                stop_loss: Some(dec!(95)),
                target: None,
                ltp: dec!(96),
                expect_closed: false,
            },
            TestCase {
                name: "buy target reached",
                side: Side::Buy,
                stop_loss: None,
                target: Some(dec!(110)),
                ltp: dec!(110),
                expect_closed: true,
            },
            TestCase {
                name: "sell stop-loss breached above entry",
                side: Side::Sell,
                stop_loss: Some(dec!(105)),
                target: None,
                ltp: dec!(106),
                expect_closed: true,
            },
            TestCase {
                name: "sell target reached below entry",
                side: Side::Sell,
                stop_loss: None,
                target: Some(dec!(90)),
                ltp: dec!(89),
                expect_closed: true,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let mut book = book();
            let trade = enter(
                &mut book,
                EntrySignal {
                    quantity: Some(10),
                    ..signal(test.side, dec!(100))
                },
                Decimal::ONE,
                Utc::now(),
            )
            .unwrap();
            set_stop_loss(&mut book, trade.id, test.stop_loss).unwrap();
            set_target(&mut book, trade.id, test.target).unwrap();

            let closed = mark_tick(&mut book, market(), test.ltp, false, Utc::now());
            assert_eq!(
                !closed.is_empty(),
                test.expect_closed,
                "TC{index} ({}) failed",
                test.name
            );
            if test.expect_closed {
                assert_eq!(closed[0].exit_price, Some(test.ltp));
            }
        }
    }

    #[test]
    fn test_square_off_closes_at_tick_price() {
        let mut book = book();
        enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Buy, dec!(2500))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();

        let closed = mark_tick(&mut book, market(), dec!(2510), true, Utc::now());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_price, Some(dec!(2510)));
        assert_eq!(closed[0].realised_pnl(), Some(dec!(100)));
    }

    #[test]
    fn test_close_credits_margin_plus_pnl() {
        let mut book = book();
        let trade = enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Buy, dec!(100))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(book.virtual_balance, dec!(99000));

        close(&mut book, trade.id, dec!(110), Utc::now()).unwrap();
        assert_eq!(book.virtual_balance, dec!(100100));

        // Closed trades are immutable
        assert_eq!(
            close(&mut book, trade.id, dec!(120), Utc::now()),
            Err(PaperError::TradeAlreadyClosed(trade.id))
        );
        assert_eq!(
            set_stop_loss(&mut book, trade.id, Some(dec!(90))),
            Err(PaperError::TradeAlreadyClosed(trade.id))
        );
    }

    #[test]
    fn test_sell_side_pnl_sign() {
        let mut book = book();
        let trade = enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Sell, dec!(100))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(book.trade(trade.id).unwrap().unrealised_pnl(dec!(90)), dec!(100));
        assert_eq!(book.trade(trade.id).unwrap().unrealised_pnl(dec!(110)), dec!(-100));
    }

    #[test]
    fn test_summary_and_clear_closed() {
        let mut book = book();
        let open = enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Buy, dec!(100))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();
        let closing = enter(
            &mut book,
            EntrySignal {
                quantity: Some(5),
                ..signal(Side::Sell, dec!(100))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();
        close(&mut book, closing.id, dec!(95), Utc::now()).unwrap();

        let mut last = FnvHashMap::default();
        last.insert(market(), dec!(105));

        let summary = summary(&book, &last);
        assert_eq!(summary.open_trades, 1);
        assert_eq!(summary.closed_trades, 1);
        assert_eq!(summary.realised_pnl, dec!(25));
        assert_eq!(summary.unrealised_pnl, dec!(50));

        assert_eq!(clear_closed(&mut book), 1);
        assert_eq!(book.trades.len(), 1);
        assert_eq!(book.trades[0].id, open.id);
    }

    #[test]
    fn test_trades_csv_has_header_and_rows() {
        let mut book = book();
        let trade = enter(
            &mut book,
            EntrySignal {
                quantity: Some(10),
                ..signal(Side::Buy, dec!(2500))
            },
            Decimal::ONE,
            Utc::now(),
        )
        .unwrap();
        close(&mut book, trade.id, dec!(2510), Utc::now()).unwrap();

        let csv = trades_csv(&book.trades).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,exchange,symbol,side"));
        let row = lines.next().unwrap();
        assert!(row.contains("RELIANCE"));
        assert!(row.contains("CLOSED"));
        assert!(row.ends_with("100"));
    }
}
