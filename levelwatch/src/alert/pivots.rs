use levelwatch_instrument::instrument::DayOhlc;
use rust_decimal::Decimal;

/// Classic floor-trader pivot grid extended to six levels each side.
///
/// `P = (H + L + C) / 3`, then:
/// `R1 = 2P - L`, `S1 = 2P - H`, `R2 = P + (H - L)`, `S2 = P - (H - L)`,
/// `R3 = H + 2(P - L)`, `S3 = L - 2(H - P)`; levels beyond the third step by
/// the previous-day range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PivotLevels {
    pub pivot: Decimal,
    pub resistances: [Decimal; 6],
    pub supports: [Decimal; 6],
}

impl PivotLevels {
    pub fn from_ohlc(ohlc: &DayOhlc) -> Self {
        let DayOhlc {
            high, low, close, ..
        } = *ohlc;

        let two = Decimal::TWO;
        let pivot = (high + low + close) / Decimal::from(3);
        let range = high - low;

        let r1 = two * pivot - low;
        let s1 = two * pivot - high;
        let r2 = pivot + range;
        let s2 = pivot - range;
        let r3 = high + two * (pivot - low);
        let s3 = low - two * (high - pivot);
        let r4 = r3 + range;
        let s4 = s3 - range;
        let r5 = r4 + range;
        let s5 = s4 - range;
        let r6 = r5 + range;
        let s6 = s5 - range;

        Self {
            pivot,
            resistances: [r1, r2, r3, r4, r5, r6],
            supports: [s1, s2, s3, s4, s5, s6],
        }
    }
}
