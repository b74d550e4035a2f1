use crate::{
    alert::{Alert, AlertCondition, AlertKind, AlertLogEntry, evaluator},
    channel::{
        manager::ChannelHandle,
        protocol::{ServerMessage, close_code},
    },
    clock::Clock,
    config::Config,
    paper::engine::{self, EntrySignal},
    persist::worker::FlushHandle,
    scrip::ScripDirectory,
    session::{
        SessionId, SessionState, WatchlistItem,
        command::{Command, Replier, SessionError, SessionView},
        snapshot::SessionSnapshot,
    },
};
use chrono::NaiveDate;
use levelwatch_feed::{Tick, client::FeedHandle};
use levelwatch_instrument::instrument::{DayOhlc, Instrument, MarketId};
use levelwatch_integration::channel::{ConflatingRx, TrySendError};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Collaborators handed to every session loop.
///
/// Nothing here is process-global: tests assemble the same struct from fakes.
#[derive(Debug, Clone)]
pub struct SessionDeps {
    pub clock: Arc<dyn Clock>,
    pub feed: FeedHandle<SessionId>,
    pub flush: FlushHandle,
    pub scrip: Arc<dyn ScripDirectory>,
    pub config: Arc<Config>,
}

/// The single consumer owning one session's state.
///
/// Producers submit [`Command`]s through the bounded queue; ticks arrive via
/// the conflating mailbox and are folded into `Command::Tick` here, so the
/// observable state after command `n` is a deterministic function of state
/// `n-1` and command `n`.
#[derive(Debug)]
pub struct SessionRunner {
    state: SessionState,
    deps: SessionDeps,
    channel: Option<ChannelHandle>,
}

impl SessionRunner {
    pub fn new(state: SessionState, deps: SessionDeps) -> Self {
        Self {
            state,
            deps,
            channel: None,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut ticks: ConflatingRx<MarketId, Tick>,
    ) {
        info!(session = %self.state.session_id, user = %self.state.user_id, "session loop started");

        loop {
            tokio::select! {
                // Commands take priority over conflated ticks
                biased;
                command = commands.recv() => match command {
                    None => break,
                    Some(Command::Shutdown { ack }) => {
                        self.mark_dirty();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.process(command),
                },
                (_, tick) = ticks.recv() => self.process(Command::Tick(tick)),
            }
        }

        self.deps.feed.deregister(self.state.session_id);
        if let Some(channel) = self.channel.take() {
            channel.close(close_code::GOING_AWAY);
        }
        info!(session = %self.state.session_id, "session loop stopped");
    }

    fn process(&mut self, command: Command) {
        if self.state.quarantined {
            self.process_quarantined(command);
            return;
        }

        match command {
            Command::AddToWatchlist { instrument, reply } => {
                self.respond(reply, |runner| runner.add_to_watchlist(instrument))
            }
            Command::RemoveFromWatchlist { market, reply } => {
                self.respond(reply, |runner| runner.remove_from_watchlist(market))
            }
            Command::RefreshWatchlist { reply } => {
                self.respond(reply, |runner| {
                    runner.state.ohlc_cache.clear();
                    runner.state.ohlc_cached_day = None;
                    let markets = runner.state.watched_markets();
                    for market in markets {
                        let _ = runner.reference_ohlc(market);
                    }
                    Ok(runner.state.watchlist.values().cloned().collect())
                });
            }
            Command::SetReferenceDate { date, reply } => {
                self.respond(reply, |runner| {
                    runner.state.reference_date = date;
                    runner.state.ohlc_cache.clear();
                    runner.state.ohlc_cached_day = None;
                    runner.mark_dirty();
                    Ok(runner.state.reference_date)
                });
            }
            Command::CreateAlert {
                market,
                condition,
                price,
                reply,
            } => self.respond(reply, |runner| runner.create_alert(market, condition, price)),
            Command::DeleteAlert { id, reply } => self.respond(reply, |runner| {
                runner
                    .state
                    .alerts
                    .remove(id)
                    .map(|_| runner.mark_dirty())
                    .ok_or(SessionError::UnknownAlert(id))
            }),
            Command::DeleteAlerts { ids, reply } => self.respond(reply, |runner| {
                let removed = ids
                    .into_iter()
                    .filter(|id| runner.state.alerts.remove(*id).is_some())
                    .count();
                if removed > 0 {
                    runner.mark_dirty();
                }
                Ok(removed)
            }),
            Command::ClearAlerts { reply } => self.respond(reply, |runner| {
                let removed = runner.state.alerts.clear();
                if removed > 0 {
                    runner.mark_dirty();
                }
                Ok(removed)
            }),
            Command::PauseAlerts { paused, reply } => self.respond(reply, |runner| {
                runner.state.alerts.paused = paused;
                runner.mark_dirty();
                Ok(runner.state.alerts.paused)
            }),
            Command::GenerateAutoAlerts { market, reply } => {
                self.respond(reply, |runner| runner.generate_auto_alerts(market))
            }
            Command::SetPaperEnabled { enabled, reply } => self.respond(reply, |runner| {
                runner.state.paper.auto_enabled = enabled;
                runner.mark_dirty();
                Ok(runner.state.paper.auto_enabled)
            }),
            Command::SetVirtualBalance { balance, reply } => self.respond(reply, |runner| {
                if balance < Decimal::ZERO {
                    return Err(SessionError::Paper(
                        crate::paper::PaperError::InvalidPrice(balance),
                    ));
                }
                runner.state.paper.virtual_balance = balance;
                runner.mark_dirty();
                Ok(runner.state.paper.virtual_balance)
            }),
            Command::SetStopLoss {
                trade_id,
                stop_loss,
                reply,
            } => self.respond(reply, |runner| {
                let trade = engine::set_stop_loss(&mut runner.state.paper, trade_id, stop_loss)?;
                runner.mark_dirty();
                Ok(trade)
            }),
            Command::SetTarget {
                trade_id,
                target,
                reply,
            } => self.respond(reply, |runner| {
                let trade = engine::set_target(&mut runner.state.paper, trade_id, target)?;
                runner.mark_dirty();
                Ok(trade)
            }),
            Command::CloseTrade { trade_id, reply } => {
                self.respond(reply, |runner| runner.close_trade(trade_id))
            }
            Command::ManualTrade {
                market,
                side,
                quantity,
                reply,
            } => self.respond(reply, |runner| runner.manual_trade(market, side, quantity)),
            Command::ClearClosedTrades { reply } => self.respond(reply, |runner| {
                let removed = engine::clear_closed(&mut runner.state.paper);
                if removed > 0 {
                    runner.mark_dirty();
                    runner.push_trade_update();
                }
                Ok(removed)
            }),
            Command::View { reply } => self.respond(reply, |runner| Ok(runner.view())),
            Command::AlertLogs { reply } => self.respond(reply, |runner| {
                Ok(runner.state.alerts.log.iter().cloned().collect())
            }),
            Command::TradesCsv { reply } => self.respond(reply, |runner| {
                engine::trades_csv(&runner.state.paper.trades)
                    .map_err(|error| SessionError::Internal(error.to_string()))
            }),
            Command::Tick(tick) => self.on_tick(tick),
            Command::SquareOffCheck => self.on_square_off_check(),
            Command::BindChannel { channel, reply } => {
                let result = self.bind_channel(channel);
                let _ = reply.send(result);
            }
            Command::UnbindChannel { channel_id, clean } => {
                self.process_unbind(channel_id, clean);
            }
            Command::Shutdown { ack } => {
                // Handled in the loop; unreachable here but ack regardless
                let _ = ack.send(());
            }
        }
    }

    /// While quarantined only teardown commands are honoured; everything else
    /// is refused with a distinct reason code.
    fn process_quarantined(&mut self, command: Command) {
        match command {
            Command::UnbindChannel { channel_id, clean } => {
                self.process_unbind(channel_id, clean);
            }
            Command::Shutdown { ack } => {
                let _ = ack.send(());
            }
            Command::BindChannel { channel, reply } => {
                channel.close(close_code::QUARANTINED);
                let _ = reply.send(Err(SessionError::Quarantined));
            }
            command => fail_reply(command),
        }
    }

    fn process_unbind(&mut self, channel_id: crate::channel::manager::ChannelId, clean: bool) {
        if self
            .channel
            .as_ref()
            .is_some_and(|channel| channel.id == channel_id)
        {
            debug!(session = %self.state.session_id, %channel_id, clean, "channel unbound");
            self.channel = None;
        }
    }

    fn respond<T>(
        &mut self,
        reply: Replier<T>,
        handler: impl FnOnce(&mut Self) -> Result<T, SessionError>,
    ) {
        let result = handler(self);
        if let Err(error) = &result {
            debug!(session = %self.state.session_id, %error, "command refused");
        }
        let _ = reply.send(result);
    }

    // ------------------------------------------------------------------
    // watchlist
    // ------------------------------------------------------------------

    fn add_to_watchlist(&mut self, instrument: Instrument) -> Result<WatchlistItem, SessionError> {
        let market = instrument.market_id();
        if self.state.watchlist.contains_key(&market) {
            return Err(SessionError::DuplicateWatchlistEntry(market));
        }

        let item = WatchlistItem {
            instrument,
            ltp: None,
            added_at: self.deps.clock.now_wall(),
        };
        self.state.watchlist.insert(market, item.clone());

        // Seed the previous-day cache so the first tick has an observation base
        let _ = self.reference_ohlc(market);

        self.deps.feed.subscribe(self.state.session_id, &[market]);
        self.mark_dirty();
        Ok(item)
    }

    fn remove_from_watchlist(&mut self, market: MarketId) -> Result<(), SessionError> {
        if self.state.watchlist.shift_remove(&market).is_none() {
            return Err(SessionError::NotOnWatchlist(market));
        }
        self.deps.feed.unsubscribe(self.state.session_id, &[market]);
        self.mark_dirty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // alerts
    // ------------------------------------------------------------------

    fn create_alert(
        &mut self,
        market: MarketId,
        condition: AlertCondition,
        price: Decimal,
    ) -> Result<Alert, SessionError> {
        if price <= Decimal::ZERO {
            return Err(SessionError::InvalidAlertPrice(price));
        }
        let instrument = self.instrument_for(market)?;
        let alert = Alert::new(
            instrument,
            condition,
            price,
            AlertKind::Manual,
            self.deps.clock.now_wall(),
        );
        let created = self.state.alerts.insert(alert).clone();
        self.mark_dirty();
        Ok(created)
    }

    fn generate_auto_alerts(&mut self, market: MarketId) -> Result<Vec<Alert>, SessionError> {
        let instrument = self.instrument_for(market)?;
        let ohlc = self
            .reference_ohlc(market)
            .ok_or(SessionError::NoReferenceOhlc(market))?;

        let generated = evaluator::auto_alerts(&instrument, &ohlc, self.deps.clock.now_wall());
        let installed = self.state.alerts.replace_auto(market, generated);
        self.mark_dirty();
        Ok(installed)
    }

    // ------------------------------------------------------------------
    // paper
    // ------------------------------------------------------------------

    fn close_trade(&mut self, trade_id: crate::paper::TradeId) -> Result<crate::paper::PaperTrade, SessionError> {
        let trade = self
            .state
            .paper
            .trade(trade_id)
            .ok_or(crate::paper::PaperError::UnknownTrade(trade_id))?;

        // Manual close exits at the last observed price, falling back to the
        // entry when the instrument has not ticked yet
        let exit = self
            .state
            .last_ltp
            .get(&trade.market_id())
            .copied()
            .unwrap_or(trade.entry_price);

        let closed = engine::close(
            &mut self.state.paper,
            trade_id,
            exit,
            self.deps.clock.now_wall(),
        )?;
        self.push_trade_update();
        self.mark_dirty();
        Ok(closed)
    }

    fn manual_trade(
        &mut self,
        market: MarketId,
        side: levelwatch_instrument::Side,
        quantity: Option<u64>,
    ) -> Result<crate::paper::PaperTrade, SessionError> {
        let instrument = self.instrument_for(market)?;
        let entry_price = self
            .state
            .last_ltp
            .get(&market)
            .copied()
            .ok_or(crate::paper::PaperError::NoMarketPrice(market))?;

        let trade = engine::enter(
            &mut self.state.paper,
            EntrySignal {
                instrument,
                side,
                entry_price,
                trigger_level: AlertKind::Manual,
                quantity,
            },
            self.deps.config.paper.per_trade_cap,
            self.deps.clock.now_wall(),
        )?;
        self.check_invariants();
        self.push_trade_update();
        self.mark_dirty();
        Ok(trade)
    }

    // ------------------------------------------------------------------
    // ticks and timers
    // ------------------------------------------------------------------

    fn on_tick(&mut self, tick: Tick) {
        let market = tick.market;
        // A tick can race a watchlist removal through the mailbox
        if !self.state.watchlist.contains_key(&market) {
            return;
        }

        let now = self.deps.clock.now_wall();
        let prev = self
            .state
            .last_ltp
            .get(&market)
            .copied()
            .or_else(|| self.reference_ohlc(market).map(|ohlc| ohlc.close));

        let fired = evaluator::evaluate_tick(&mut self.state.alerts, market, tick.ltp, prev, now);

        // The observation updates even when paused or nothing fired
        self.state.last_ltp.insert(market, tick.ltp);
        if let Some(item) = self.state.watchlist.get_mut(&market) {
            item.ltp = Some(tick.ltp);
        }

        let mut dirty = false;
        for entry in &fired {
            self.push_frame(ServerMessage::AlertTriggered {
                alert: entry.alert.clone(),
                log: entry.clone(),
            });
            dirty = true;
        }
        let mut trades_changed = self.open_auto_entries(&fired, tick.ltp, now);
        if trades_changed {
            self.check_invariants();
        }

        let square_off = self.deps.config.paper.auto_square_off
            && self.deps.clock.is_square_off_window(now);
        let closed = engine::mark_tick(&mut self.state.paper, market, tick.ltp, square_off, now);
        trades_changed |= !closed.is_empty();

        if trades_changed {
            self.push_trade_update();
            dirty = true;
        }

        if let Some(item) = self.state.watchlist.get(&market) {
            self.push_frame(ServerMessage::PriceUpdate {
                token: market.token,
                symbol: item.instrument.symbol.clone(),
                ltp: tick.ltp,
            });
        }

        if dirty {
            self.mark_dirty();
        }
    }

    /// Feed fired alerts into the paper engine when auto trading is on.
    /// Returns whether the trade book changed.
    fn open_auto_entries(
        &mut self,
        fired: &[AlertLogEntry],
        ltp: Decimal,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        if !self.state.paper.auto_enabled || fired.is_empty() {
            return false;
        }

        let breakout = self.deps.config.paper.breakout_entries;
        let mut changed = false;
        for entry in fired {
            let Some(side) = entry.alert.kind.entry_side(breakout) else {
                continue;
            };
            match engine::enter(
                &mut self.state.paper,
                EntrySignal {
                    instrument: entry.alert.instrument.clone(),
                    side,
                    entry_price: ltp,
                    trigger_level: entry.alert.kind,
                    quantity: None,
                },
                self.deps.config.paper.per_trade_cap,
                now,
            ) {
                Ok(_) => changed = true,
                Err(error) => {
                    debug!(session = %self.state.session_id, %error, "auto entry refused")
                }
            }
        }
        changed
    }

    fn on_square_off_check(&mut self) {
        let now = self.deps.clock.now_wall();
        if !self.deps.config.paper.auto_square_off || !self.deps.clock.is_square_off_window(now) {
            return;
        }

        let closed = engine::square_off_all(&mut self.state.paper, &self.state.last_ltp, now);
        if !closed.is_empty() {
            info!(session = %self.state.session_id, count = closed.len(), "square-off closed open trades");
            self.push_trade_update();
            self.mark_dirty();
        }
    }

    // ------------------------------------------------------------------
    // channel
    // ------------------------------------------------------------------

    fn bind_channel(&mut self, channel: ChannelHandle) -> Result<SessionId, SessionError> {
        if let Some(previous) = self.channel.replace(channel) {
            // A reconnect superseded the old transport
            previous.close(close_code::GOING_AWAY);
        }

        self.push_frame(ServerMessage::Connected {
            session_id: self.state.session_id,
        });
        if !self.state.paper.trades.is_empty() {
            self.push_trade_update();
        }
        Ok(self.state.session_id)
    }

    fn push_trade_update(&mut self) {
        let summary = engine::summary(&self.state.paper, &self.state.last_ltp);
        self.push_frame(ServerMessage::TradeUpdate {
            trades: self.state.paper.trades.clone(),
            summary,
        });
    }

    fn push_frame(&mut self, message: ServerMessage) {
        let Some(channel) = &self.channel else {
            return;
        };

        match channel.send(message) {
            Ok(()) => {}
            Err(TrySendError::Full) => {
                warn!(
                    session = %self.state.session_id,
                    channel = %channel.id,
                    "send queue overflow, closing slow consumer"
                );
                channel.close(close_code::SLOW_CONSUMER);
                self.channel = None;
            }
            Err(TrySendError::Closed) => {
                self.channel = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // shared helpers
    // ------------------------------------------------------------------

    fn instrument_for(&self, market: MarketId) -> Result<Instrument, SessionError> {
        if let Some(item) = self.state.watchlist.get(&market) {
            return Ok(item.instrument.clone());
        }
        self.deps
            .scrip
            .resolve(market.exchange, market.token)
            .ok_or(SessionError::UnknownInstrument(market))
    }

    /// Previous-day OHLC for `market`, re-cached on the first access of each
    /// new market day. Honors the session's reference date when set.
    fn reference_ohlc(&mut self, market: MarketId) -> Option<DayOhlc> {
        let today = self
            .deps
            .clock
            .market_day_for(self.deps.clock.now_wall());
        if self.state.ohlc_cached_day != Some(today) {
            self.state.ohlc_cache.clear();
            self.state.ohlc_cached_day = Some(today);
        }

        if let Some(ohlc) = self.state.ohlc_cache.get(&market) {
            return Some(*ohlc);
        }

        let anchor: NaiveDate = match self.state.reference_date {
            Some(date) => date,
            None => today.pred_opt()?,
        };
        let ohlc = self.deps.scrip.day_ohlc(market, anchor)?;
        self.state.ohlc_cache.insert(market, ohlc);
        Some(ohlc)
    }

    /// Verify the invariants the paper book promises. A violation is a
    /// programmer error: the session is quarantined rather than allowed to
    /// keep corrupting its durable state.
    fn check_invariants(&mut self) {
        if self.state.quarantined || self.state.paper.allow_averaging {
            return;
        }

        let mut seen = std::collections::HashSet::new();
        let duplicated = self
            .state
            .paper
            .open_trades()
            .any(|trade| !seen.insert((trade.market_id(), trade.side)));

        if duplicated {
            self.quarantine("duplicate open trade per (token, side)");
        }
    }

    fn quarantine(&mut self, reason: &str) {
        tracing::error!(
            session = %self.state.session_id,
            user = %self.state.user_id,
            reason,
            "invariant violated; quarantining session"
        );
        self.state.quarantined = true;
        self.deps.flush.archive(self.state.user_id.clone());
        if let Some(channel) = self.channel.take() {
            channel.close(close_code::QUARANTINED);
        }
    }

    fn mark_dirty(&mut self) {
        let snapshot = SessionSnapshot::capture(
            &self.state,
            self.deps.config.session.closed_trade_cap,
            self.deps.clock.now_wall(),
        );
        self.deps.flush.submit(snapshot);
    }

    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.state.session_id,
            user_id: self.state.user_id.clone(),
            watchlist: self.state.watchlist.values().cloned().collect(),
            active_alerts: self.state.alerts.active.values().cloned().collect(),
            alerts_paused: self.state.alerts.paused,
            reference_date: self.state.reference_date,
            trades: self.state.paper.trades.clone(),
            paper: engine::summary(&self.state.paper, &self.state.last_ltp),
        }
    }
}

/// Fail the reply slot of a refused command with [`SessionError::Quarantined`].
fn fail_reply(command: Command) {
    match command {
        Command::AddToWatchlist { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::RemoveFromWatchlist { reply, .. } => {
            drop(reply.send(Err(SessionError::Quarantined)))
        }
        Command::RefreshWatchlist { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::SetReferenceDate { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::CreateAlert { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::DeleteAlert { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::DeleteAlerts { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::ClearAlerts { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::PauseAlerts { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::GenerateAutoAlerts { reply, .. } => {
            drop(reply.send(Err(SessionError::Quarantined)))
        }
        Command::SetPaperEnabled { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::SetVirtualBalance { reply, .. } => {
            drop(reply.send(Err(SessionError::Quarantined)))
        }
        Command::SetStopLoss { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::SetTarget { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::CloseTrade { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::ManualTrade { reply, .. } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::ClearClosedTrades { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::View { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::AlertLogs { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::TradesCsv { reply } => drop(reply.send(Err(SessionError::Quarantined))),
        Command::Tick(_) | Command::SquareOffCheck => {}
        Command::BindChannel { .. } | Command::UnbindChannel { .. } | Command::Shutdown { .. } => {}
    }
}
