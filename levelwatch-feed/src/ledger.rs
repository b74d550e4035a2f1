use crate::Tick;
use fnv::{FnvHashMap, FnvHashSet};
use levelwatch_instrument::instrument::MarketId;
use levelwatch_integration::channel::ConflatingTx;
use std::hash::Hash;
use tracing::warn;

/// Transmitter for delivering ticks into a session's conflating mailbox.
pub type TickTx = ConflatingTx<MarketId, Tick>;

/// Authoritative mapping from instrument to the sessions subscribed to it.
///
/// The upstream connection holds exactly the union of all per-session sets as
/// its live subscription set. Invariant: a market key exists in `markets` iff
/// its subscriber set is non-empty.
#[derive(Debug)]
pub struct Ledger<Id> {
    routes: FnvHashMap<Id, Route>,
    markets: FnvHashMap<MarketId, FnvHashSet<Id>>,
}

#[derive(Debug)]
struct Route {
    mailbox: TickTx,
    markets: FnvHashSet<MarketId>,
}

impl<Id> Default for Ledger<Id> {
    fn default() -> Self {
        Self {
            routes: FnvHashMap::default(),
            markets: FnvHashMap::default(),
        }
    }
}

impl<Id> Ledger<Id>
where
    Id: Copy + Eq + Hash + std::fmt::Debug,
{
    /// Register a subscriber and the mailbox its ticks are delivered into.
    ///
    /// Re-registering an id replaces the mailbox and keeps its subscriptions,
    /// which is what a rehydrated session under the same id wants.
    pub fn register(&mut self, id: Id, mailbox: TickTx) {
        self.routes
            .entry(id)
            .and_modify(|route| route.mailbox = mailbox.clone())
            .or_insert(Route {
                mailbox,
                markets: FnvHashSet::default(),
            });
    }

    /// Remove a subscriber entirely. Returns markets that left the effective set.
    pub fn deregister(&mut self, id: Id) -> Vec<MarketId> {
        let Some(route) = self.routes.remove(&id) else {
            return Vec::new();
        };

        route
            .markets
            .into_iter()
            .filter(|market| self.remove_subscriber(*market, id))
            .collect()
    }

    /// Add subscriptions for `id`. Returns markets that joined the effective set.
    pub fn subscribe(&mut self, id: Id, markets: &[MarketId]) -> Vec<MarketId> {
        let Some(route) = self.routes.get_mut(&id) else {
            warn!(?id, "subscribe for unregistered subscriber ignored");
            return Vec::new();
        };

        let mut added = Vec::new();
        for market in markets {
            if !route.markets.insert(*market) {
                continue;
            }
            let subscribers = self.markets.entry(*market).or_default();
            if subscribers.is_empty() {
                added.push(*market);
            }
            subscribers.insert(id);
        }
        added
    }

    /// Remove subscriptions for `id`. Returns markets that left the effective set.
    pub fn unsubscribe(&mut self, id: Id, markets: &[MarketId]) -> Vec<MarketId> {
        let Some(route) = self.routes.get_mut(&id) else {
            warn!(?id, "unsubscribe for unregistered subscriber ignored");
            return Vec::new();
        };

        let mut left_route = Vec::new();
        for market in markets {
            if route.markets.remove(market) {
                left_route.push(*market);
            }
        }

        let mut removed = Vec::new();
        for market in left_route {
            if self.remove_subscriber(market, id) {
                removed.push(market);
            }
        }
        removed
    }

    /// Deliver a tick to every subscribed mailbox. Returns the delivery count.
    pub fn dispatch(&self, tick: Tick) -> usize {
        let Some(subscribers) = self.markets.get(&tick.market) else {
            return 0;
        };

        subscribers
            .iter()
            .filter_map(|id| self.routes.get(id))
            .map(|route| route.mailbox.send(tick.market, tick))
            .count()
    }

    /// The full live subscription set.
    pub fn effective(&self) -> Vec<MarketId> {
        self.markets.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Number of sessions subscribed to `market`.
    pub fn subscriber_count(&self, market: MarketId) -> usize {
        self.markets.get(&market).map_or(0, FnvHashSet::len)
    }

    /// Whether `id` is subscribed to `market`.
    pub fn is_subscribed(&self, id: Id, market: MarketId) -> bool {
        self.markets
            .get(&market)
            .is_some_and(|subscribers| subscribers.contains(&id))
    }

    fn remove_subscriber(&mut self, market: MarketId, id: Id) -> bool {
        let Some(subscribers) = self.markets.get_mut(&market) else {
            return false;
        };
        subscribers.remove(&id);
        if subscribers.is_empty() {
            self.markets.remove(&market);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use levelwatch_instrument::{exchange::Exchange, instrument::InstrumentToken};
    use levelwatch_integration::channel::conflating;
    use rust_decimal_macros::dec;

    fn market(token: u32) -> MarketId {
        MarketId::new(Exchange::Nse, InstrumentToken(token))
    }

    fn tick(token: u32) -> Tick {
        Tick::new(market(token), dec!(100.0), Utc::now())
    }

    #[test]
    fn test_effective_set_is_union_of_subscriber_sets() {
        let mut ledger = Ledger::<u8>::default();
        let (tx_a, _rx_a) = conflating();
        let (tx_b, _rx_b) = conflating();
        ledger.register(1, tx_a);
        ledger.register(2, tx_b);

        // First subscriber makes the market effective
        assert_eq!(ledger.subscribe(1, &[market(2885)]), vec![market(2885)]);
        // Second subscriber does not change the effective set
        assert_eq!(ledger.subscribe(2, &[market(2885)]), Vec::new());
        assert_eq!(ledger.subscriber_count(market(2885)), 2);

        // Removing one subscriber keeps the market live
        assert_eq!(ledger.unsubscribe(1, &[market(2885)]), Vec::new());
        // Removing the last subscriber retires it
        assert_eq!(ledger.unsubscribe(2, &[market(2885)]), vec![market(2885)]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_deregister_releases_markets() {
        let mut ledger = Ledger::<u8>::default();
        let (tx, _rx) = conflating();
        ledger.register(1, tx);
        ledger.subscribe(1, &[market(2885), market(11536)]);

        let mut released = ledger.deregister(1);
        released.sort();
        assert_eq!(released, vec![market(2885), market(11536)]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_dispatch_reaches_subscribed_mailboxes_only() {
        let mut ledger = Ledger::<u8>::default();
        let (tx_a, mut rx_a) = conflating();
        let (tx_b, mut rx_b) = conflating();
        ledger.register(1, tx_a);
        ledger.register(2, tx_b);
        ledger.subscribe(1, &[market(2885)]);
        ledger.subscribe(2, &[market(11536)]);

        assert_eq!(ledger.dispatch(tick(2885)), 1);
        assert_eq!(ledger.dispatch(tick(404)), 0);

        assert!(rx_a.try_recv().is_some());
        assert!(rx_b.try_recv().is_none());
    }

    #[test]
    fn test_subscribe_unknown_subscriber_is_noop() {
        let mut ledger = Ledger::<u8>::default();
        assert_eq!(ledger.subscribe(9, &[market(2885)]), Vec::new());
        assert!(ledger.is_empty());
    }
}
