use crate::{BrokerCredentials, Tick, error::CodecError};
use bytes::{Buf, BufMut, BytesMut};
use chrono::DateTime;
use levelwatch_instrument::{
    exchange::Exchange,
    instrument::{InstrumentToken, MarketId},
};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

/// Byte length of one binary quote packet:
/// `[segment u8][token u32][ltp_paise i64][ts_epoch_ms i64]`, big-endian.
pub const PACKET_LEN: usize = 1 + 4 + 8 + 8;

/// Byte length of the frame header: `[packet_count u16]`, big-endian.
pub const HEADER_LEN: usize = 2;

/// Decode one binary broker frame into its quote packets.
///
/// Packets with an unknown segment code fail the whole frame: the broker never
/// mixes valid and invalid segments within a frame, so a bad code means the
/// stream is desynchronised.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Tick>, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN,
            found: frame.len(),
        });
    }

    let mut buf = frame;
    let count = buf.get_u16();

    let expected = HEADER_LEN + usize::from(count) * PACKET_LEN;
    if frame.len() != expected {
        return Err(CodecError::CountMismatch {
            count,
            len: frame.len(),
        });
    }

    (0..count)
        .map(|_| {
            let segment = buf.get_u8();
            let token = buf.get_u32();
            let ltp_paise = buf.get_i64();
            let ts_ms = buf.get_i64();

            let exchange =
                Exchange::from_segment_code(segment).ok_or(CodecError::UnknownSegment(segment))?;

            let ts_server = DateTime::from_timestamp_millis(ts_ms)
                .ok_or(CodecError::TimestampOutOfRange(ts_ms))?;

            Ok(Tick {
                market: MarketId::new(exchange, InstrumentToken(token)),
                ltp: Decimal::new(ltp_paise, 2),
                ts_server,
            })
        })
        .collect()
}

/// Encode quote packets into one binary broker frame.
///
/// The server only decodes; this encoder drives the fake broker used in tests.
pub fn encode_frame(ticks: &[Tick]) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + ticks.len() * PACKET_LEN);
    buf.put_u16(ticks.len() as u16);

    for tick in ticks {
        let ltp_paise = (tick.ltp * Decimal::ONE_HUNDRED)
            .round()
            .to_i64()
            .ok_or_else(|| CodecError::PriceOutOfRange(i64::MAX))?;

        buf.put_u8(tick.market.exchange.segment_code());
        buf.put_u32(tick.market.token.value());
        buf.put_i64(ltp_paise);
        buf.put_i64(tick.ts_server.timestamp_millis());
    }

    Ok(buf.to_vec())
}

/// Text commands the client sends to the broker socket.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "a", rename_all = "snake_case")]
pub enum BrokerRequest {
    Auth {
        api_key: smol_str::SmolStr,
        access_token: smol_str::SmolStr,
    },
    Subscribe {
        v: Vec<(u8, u32)>,
    },
    Unsubscribe {
        v: Vec<(u8, u32)>,
    },
}

impl BrokerRequest {
    pub fn auth(credentials: &BrokerCredentials) -> Self {
        Self::Auth {
            api_key: credentials.api_key.clone(),
            access_token: credentials.access_token.clone(),
        }
    }

    pub fn subscribe(markets: impl IntoIterator<Item = MarketId>) -> Self {
        Self::Subscribe {
            v: Self::encode_markets(markets),
        }
    }

    pub fn unsubscribe(markets: impl IntoIterator<Item = MarketId>) -> Self {
        Self::Unsubscribe {
            v: Self::encode_markets(markets),
        }
    }

    fn encode_markets(markets: impl IntoIterator<Item = MarketId>) -> Vec<(u8, u32)> {
        markets
            .into_iter()
            .map(|market| (market.exchange.segment_code(), market.token.value()))
            .collect()
    }
}

/// Text responses the broker socket sends to the client.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum BrokerResponse {
    AuthAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        reason: String,
    },
}
