use crate::alert::{
    Alert, AlertBook, AlertCondition, AlertKind, AlertLogEntry, pivots::PivotLevels,
};
use chrono::{DateTime, Utc};
use levelwatch_instrument::instrument::{DayOhlc, Instrument, MarketId};
use rust_decimal::Decimal;

/// Evaluate every armed alert for `market` against one tick.
///
/// Edge-trigger contract: an alert fires only on a true crossing of its level,
/// judged against `prev` - the last price this session observed for the token,
/// seeded from the cached previous-day close when no tick has been seen yet
/// this market day. An alert already sitting on the "wrong side" of the quote
/// at startup therefore stays armed until the price comes back across, and a
/// price oscillating exactly on the boundary cannot re-fire.
///
/// When the book is paused nothing fires; the caller still records the
/// observation so that un-pausing does not replay historical crossings.
///
/// Alerts are evaluated in creation order, each at most once per tick. Fired
/// alerts are disarmed, removed from the active set and appended to the log.
pub fn evaluate_tick(
    book: &mut AlertBook,
    market: MarketId,
    ltp: Decimal,
    prev: Option<Decimal>,
    now: DateTime<Utc>,
) -> Vec<AlertLogEntry> {
    if book.paused {
        return Vec::new();
    }

    let Some(prev) = prev else {
        return Vec::new();
    };

    let crossed: Vec<Alert> = book
        .armed_for(market)
        .filter(|alert| crossing(alert.condition, alert.price, prev, ltp))
        .cloned()
        .collect();

    crossed
        .into_iter()
        .map(|alert| book.record_fired(alert, now, ltp))
        .collect()
}

fn crossing(condition: AlertCondition, price: Decimal, prev: Decimal, ltp: Decimal) -> bool {
    match condition {
        AlertCondition::Above => prev < price && ltp >= price,
        AlertCondition::Below => prev > price && ltp <= price,
    }
}

/// The canonical auto-alert set for an instrument from its reference-day OHLC:
/// the literal previous-day extremes plus the six-level pivot grid.
pub fn auto_alerts(instrument: &Instrument, ohlc: &DayOhlc, now: DateTime<Utc>) -> Vec<Alert> {
    let levels = PivotLevels::from_ohlc(ohlc);

    let kinds_r = [
        AlertKind::AutoR1,
        AlertKind::AutoR2,
        AlertKind::AutoR3,
        AlertKind::AutoR4,
        AlertKind::AutoR5,
        AlertKind::AutoR6,
    ];
    let kinds_s = [
        AlertKind::AutoS1,
        AlertKind::AutoS2,
        AlertKind::AutoS3,
        AlertKind::AutoS4,
        AlertKind::AutoS5,
        AlertKind::AutoS6,
    ];

    let mut alerts = Vec::with_capacity(14);
    alerts.push(Alert::new(
        instrument.clone(),
        AlertCondition::Above,
        ohlc.high,
        AlertKind::AutoHigh,
        now,
    ));
    alerts.push(Alert::new(
        instrument.clone(),
        AlertCondition::Below,
        ohlc.low,
        AlertKind::AutoLow,
        now,
    ));

    for (kind, price) in kinds_r.into_iter().zip(levels.resistances) {
        alerts.push(Alert::new(
            instrument.clone(),
            AlertCondition::Above,
            price,
            kind,
            now,
        ));
    }
    for (kind, price) in kinds_s.into_iter().zip(levels.supports) {
        alerts.push(Alert::new(
            instrument.clone(),
            AlertCondition::Below,
            price,
            kind,
            now,
        ));
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use levelwatch_instrument::{exchange::Exchange, instrument::InstrumentToken};
    use rust_decimal_macros::dec;

    fn instrument() -> Instrument {
        Instrument::new(Exchange::Nse, InstrumentToken(2885), "RELIANCE")
    }

    fn market() -> MarketId {
        instrument().market_id()
    }

    fn alert_above(price: Decimal) -> Alert {
        Alert::new(
            instrument(),
            AlertCondition::Above,
            price,
            AlertKind::Manual,
            Utc::now(),
        )
    }

    fn alert_below(price: Decimal) -> Alert {
        Alert::new(
            instrument(),
            AlertCondition::Below,
            price,
            AlertKind::Manual,
            Utc::now(),
        )
    }

    #[test]
    fn test_edge_trigger_fires_on_crossing_tick_only() {
        let mut book = AlertBook::new(500);
        book.insert(alert_above(dec!(2500)));

        // 2498 -> 2499 -> 2500 -> 2501 with PDC-seeded prev of 2490
        let prices = [dec!(2498), dec!(2499), dec!(2500), dec!(2501)];
        let mut prev = Some(dec!(2490));
        let mut fired = Vec::new();
        for ltp in prices {
            fired.extend(evaluate_tick(&mut book, market(), ltp, prev, Utc::now()));
            prev = Some(ltp);
        }

        // Exactly one trigger, on the tick that reached the level
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].price_observed, dec!(2500));
        assert!(book.active.is_empty());
        assert_eq!(book.log.len(), 1);
        assert!(!book.log[0].alert.armed);
    }

    #[test]
    fn test_boundary_requires_strictly_less_previous() {
        struct TestCase {
            name: &'static str,
            prev: Decimal,
            ltp: Decimal,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                name: "prev strictly below, ltp on level",
                prev: dec!(2499.95),
                ltp: dec!(2500),
                expected: true,
            },
            TestCase {
                name: "prev on level, ltp above",
                prev: dec!(2500),
                ltp: dec!(2501),
                expected: false,
            },
            TestCase {
                name: "prev above, ltp above",
                prev: dec!(2500.05),
                ltp: dec!(2502),
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let mut book = AlertBook::new(500);
            book.insert(alert_above(dec!(2500)));
            let fired = evaluate_tick(&mut book, market(), test.ltp, Some(test.prev), Utc::now());
            assert_eq!(
                !fired.is_empty(),
                test.expected,
                "TC{index} ({}) failed",
                test.name
            );
        }
    }

    #[test]
    fn test_wrong_side_at_startup_does_not_fire() {
        let mut book = AlertBook::new(500);
        book.insert(alert_above(dec!(2500)));

        // PDC already above the level: first tick must not fire
        let fired = evaluate_tick(&mut book, market(), dec!(2601), Some(dec!(2600)), Utc::now());
        assert!(fired.is_empty());
        assert_eq!(book.active.len(), 1);
    }

    #[test]
    fn test_below_condition_is_symmetric() {
        let mut book = AlertBook::new(500);
        book.insert(alert_below(dec!(2400)));

        assert!(evaluate_tick(&mut book, market(), dec!(2401), Some(dec!(2410)), Utc::now()).is_empty());
        let fired = evaluate_tick(&mut book, market(), dec!(2400), Some(dec!(2401)), Utc::now());
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_no_previous_observation_never_fires() {
        let mut book = AlertBook::new(500);
        book.insert(alert_above(dec!(2500)));

        let fired = evaluate_tick(&mut book, market(), dec!(2550), None, Utc::now());
        assert!(fired.is_empty());
    }

    #[test]
    fn test_paused_book_does_not_fire() {
        let mut book = AlertBook::new(500);
        book.insert(alert_above(dec!(2500)));
        book.paused = true;

        let fired = evaluate_tick(&mut book, market(), dec!(2500), Some(dec!(2499)), Utc::now());
        assert!(fired.is_empty());
        assert_eq!(book.active.len(), 1);
    }

    #[test]
    fn test_alerts_fire_in_creation_order() {
        let mut book = AlertBook::new(500);
        let first = book.insert(alert_above(dec!(2500))).id;
        let second = book.insert(alert_above(dec!(2495))).id;

        let fired = evaluate_tick(&mut book, market(), dec!(2501), Some(dec!(2490)), Utc::now());
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].alert.id, first);
        assert_eq!(fired[1].alert.id, second);
    }

    #[test]
    fn test_auto_alert_set_shape() {
        let ohlc = DayOhlc::new(
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            dec!(2450),
            dec!(2520),
            dec!(2440),
            dec!(2500),
        );

        let alerts = auto_alerts(&instrument(), &ohlc, Utc::now());
        assert_eq!(alerts.len(), 14);

        assert_eq!(alerts[0].kind, AlertKind::AutoHigh);
        assert_eq!(alerts[0].price, dec!(2520));
        assert_eq!(alerts[0].condition, AlertCondition::Above);
        assert_eq!(alerts[1].kind, AlertKind::AutoLow);
        assert_eq!(alerts[1].price, dec!(2440));
        assert_eq!(alerts[1].condition, AlertCondition::Below);

        assert!(alerts.iter().all(|alert| alert.armed));
        assert_eq!(
            alerts
                .iter()
                .filter(|alert| alert.condition == AlertCondition::Above)
                .count(),
            7
        );
    }
}
