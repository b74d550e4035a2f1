use chrono::NaiveDate;
use fnv::FnvHashMap;
use levelwatch_instrument::{
    exchange::Exchange,
    instrument::{DayOhlc, Instrument, InstrumentToken, MarketId},
};
use parking_lot::RwLock;
use std::fmt::Debug;

/// Token / symbol / exchange resolution and previous-day OHLC lookup.
///
/// The scrip-master download and historical candle fetch live outside this
/// process; the server only consumes resolved instruments and cached daily
/// bars through this seam.
pub trait ScripDirectory
where
    Self: Debug + Send + Sync,
{
    fn resolve(&self, exchange: Exchange, token: InstrumentToken) -> Option<Instrument>;

    /// Case-insensitive symbol prefix search.
    fn search(&self, prefix: &str, limit: usize) -> Vec<Instrument>;

    /// Daily OHLC for the most recent trading day at or before `on_or_before`.
    fn day_ohlc(&self, market: MarketId, on_or_before: NaiveDate) -> Option<DayOhlc>;
}

/// In-memory [`ScripDirectory`] seeded at startup (and by tests).
#[derive(Debug, Default)]
pub struct InMemoryScripDirectory {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    instruments: FnvHashMap<MarketId, Instrument>,
    bars: FnvHashMap<MarketId, Vec<DayOhlc>>,
}

impl InMemoryScripDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_instrument(&self, instrument: Instrument) {
        self.inner
            .write()
            .instruments
            .insert(instrument.market_id(), instrument);
    }

    pub fn insert_ohlc(&self, market: MarketId, ohlc: DayOhlc) {
        let mut inner = self.inner.write();
        let bars = inner.bars.entry(market).or_default();
        bars.retain(|bar| bar.date != ohlc.date);
        bars.push(ohlc);
        bars.sort_by_key(|bar| bar.date);
    }
}

impl ScripDirectory for InMemoryScripDirectory {
    fn resolve(&self, exchange: Exchange, token: InstrumentToken) -> Option<Instrument> {
        self.inner
            .read()
            .instruments
            .get(&MarketId::new(exchange, token))
            .cloned()
    }

    fn search(&self, prefix: &str, limit: usize) -> Vec<Instrument> {
        let prefix = prefix.to_uppercase();
        let inner = self.inner.read();
        let mut matches: Vec<Instrument> = inner
            .instruments
            .values()
            .filter(|instrument| instrument.symbol.to_uppercase().starts_with(&prefix))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        matches.truncate(limit);
        matches
    }

    fn day_ohlc(&self, market: MarketId, on_or_before: NaiveDate) -> Option<DayOhlc> {
        self.inner
            .read()
            .bars
            .get(&market)
            .and_then(|bars| {
                bars.iter()
                    .rev()
                    .find(|bar| bar.date <= on_or_before)
                    .copied()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn directory() -> InMemoryScripDirectory {
        let directory = InMemoryScripDirectory::new();
        directory.insert_instrument(Instrument::new(
            Exchange::Nse,
            InstrumentToken(2885),
            "RELIANCE",
        ));
        directory.insert_instrument(Instrument::new(
            Exchange::Nse,
            InstrumentToken(4987),
            "RELAXO",
        ));
        directory
    }

    #[test]
    fn test_prefix_search_is_case_insensitive_and_ordered() {
        let matches = directory().search("rel", 10);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].symbol, "RELAXO");
        assert_eq!(matches[1].symbol, "RELIANCE");

        assert_eq!(directory().search("rel", 1).len(), 1);
        assert!(directory().search("TCS", 10).is_empty());
    }

    #[test]
    fn test_day_ohlc_returns_most_recent_at_or_before() {
        let directory = directory();
        let market = MarketId::new(Exchange::Nse, InstrumentToken(2885));
        let day = |d: u32| NaiveDate::from_ymd_opt(2025, 6, d).unwrap();

        directory.insert_ohlc(
            market,
            DayOhlc::new(day(2), dec!(2450), dec!(2520), dec!(2440), dec!(2500)),
        );
        directory.insert_ohlc(
            market,
            DayOhlc::new(day(3), dec!(2500), dec!(2560), dec!(2490), dec!(2550)),
        );

        // Holiday on the 4th: fall back to the 3rd
        let bar = directory.day_ohlc(market, day(4)).unwrap();
        assert_eq!(bar.date, day(3));

        let earlier = directory.day_ohlc(market, day(2)).unwrap();
        assert_eq!(earlier.close, dec!(2500));

        assert!(directory.day_ohlc(market, day(1)).is_none());
    }
}
