use crate::{
    alert::{Alert, AlertLogEntry},
    paper::{PaperSummary, PaperTrade},
    session::SessionId,
};
use chrono::{DateTime, Utc};
use levelwatch_instrument::instrument::InstrumentToken;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Frames the server emits to a client channel.
///
/// Serialises to the wire shape `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake confirmation carrying the bound session identity.
    Connected { session_id: SessionId },
    /// Conflated price push.
    PriceUpdate {
        token: InstrumentToken,
        symbol: SmolStr,
        ltp: Decimal,
    },
    /// Edge crossing with the matched log snapshot.
    AlertTriggered { alert: Alert, log: AlertLogEntry },
    /// The paper engine's state has changed.
    TradeUpdate {
        trades: Vec<PaperTrade>,
        summary: PaperSummary,
    },
    /// Server liveness.
    Heartbeat { ts: DateTime<Utc> },
    /// Response to a client `ping`.
    Pong { ts: DateTime<Utc> },
    /// Miscellaneous notices.
    Status { message: String },
    /// Recoverable error surfaced to the client.
    Error { code: String, detail: String },
}

impl ServerMessage {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames the server accepts from a client channel. Anything unrecognised is
/// reserved and ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
}

impl ClientMessage {
    /// Tolerant parse: a bare `{"type": "ping"}` without a data object is
    /// accepted, unknown types yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(message) = serde_json::from_str::<Self>(raw) {
            return Some(message);
        }

        let value = serde_json::from_str::<serde_json::Value>(raw).ok()?;
        match value.get("type").and_then(serde_json::Value::as_str) {
            Some("ping") => Some(ClientMessage::Ping { ts: None }),
            _ => None,
        }
    }
}

/// Close-code policy for downstream channels.
///
/// `1000` / `1001` are clean closes: the server does not rebind and does not
/// touch the session. Everything else is a transport failure and leaves the
/// session warm for the reconnect window.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;

    /// Send queue overflowed its bound.
    pub const SLOW_CONSUMER: u16 = 4008;
    /// Neither `session_id` nor `user_id` located a session.
    pub const SESSION_UNKNOWN: u16 = 4004;
    /// The bound session refused commands after an invariant violation.
    pub const QUARANTINED: u16 = 4009;
    /// Downstream write missed its deadline.
    pub const SEND_DEADLINE: u16 = 4010;
    /// The session's command queue was full at bind time; reconnect shortly.
    pub const TRY_AGAIN: u16 = 1013;

    pub fn is_clean(code: u16) -> bool {
        matches!(code, NORMAL | GOING_AWAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_server_message_wire_shape() {
        let message = ServerMessage::PriceUpdate {
            token: InstrumentToken(2885),
            symbol: "RELIANCE".into(),
            ltp: dec!(2500.45),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["data"]["token"], 2885);
        assert_eq!(json["data"]["symbol"], "RELIANCE");

        let round = serde_json::from_value::<ServerMessage>(json).unwrap();
        assert_eq!(round, message);
    }

    #[test]
    fn test_heartbeat_frame_shape() {
        let message = ServerMessage::Heartbeat { ts: Utc::now() };
        let frame = message.to_frame().unwrap();
        assert!(frame.starts_with(r#"{"type":"heartbeat","data":{"ts":"#));
    }

    #[test]
    fn test_client_message_parse() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#),
            Some(ClientMessage::Ping { ts: None })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping","data":{"ts":17}}"#),
            Some(ClientMessage::Ping { ts: Some(17) })
        );
        // Reserved / unknown types are ignored
        assert_eq!(ClientMessage::parse(r#"{"type":"subscribe"}"#), None);
        assert_eq!(ClientMessage::parse("not json"), None);
    }

    #[test]
    fn test_close_code_policy() {
        assert!(close_code::is_clean(close_code::NORMAL));
        assert!(close_code::is_clean(close_code::GOING_AWAY));
        assert!(!close_code::is_clean(1006));
        assert!(!close_code::is_clean(close_code::SLOW_CONSUMER));
    }
}
