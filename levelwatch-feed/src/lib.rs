#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Levelwatch-Feed
//! Client for the broker's streaming quote endpoint. The server process holds
//! exactly one live upstream connection on behalf of all logged-in sessions: the
//! [`client::FeedClient`] supervises the connection lifecycle, the
//! [`ledger::Ledger`] tracks which session wants which instrument, and decoded
//! [`Tick`]s are fanned out through conflating per-session mailboxes so a slow
//! session can never stall the decoder.

use chrono::{DateTime, Utc};
use derive_more::Constructor;
use levelwatch_instrument::instrument::MarketId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Reconnection backoff policy with jitter.
pub mod backoff;

/// Supervisor for the upstream connection: state machine, authentication,
/// subscription delta batching and tick dispatch.
pub mod client;

/// Binary quote-packet codec and the text command protocol.
pub mod codec;

/// All errors generated in `levelwatch-feed`.
pub mod error;

/// Authoritative mapping from instrument to subscribed sessions.
pub mod ledger;

/// Read-only connection counters driving health probes.
pub mod metrics;

/// In-memory broker doubles for tests.
pub mod test_util;

/// A single decoded price observation for one instrument.
///
/// Ephemeral: ticks are dispatched, evaluated and dropped - never persisted.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct Tick {
    pub market: MarketId,
    pub ltp: Decimal,
    pub ts_server: DateTime<Utc>,
}

/// Broker credentials delegated from a logged-in session.
///
/// The upstream socket authenticates with whichever credentials are at the front
/// of the pool; a rejected set is rotated to the back and the next one tried.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct BrokerCredentials {
    pub api_key: smol_str::SmolStr,
    pub access_token: smol_str::SmolStr,
}
