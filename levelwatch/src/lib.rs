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

//! # Levelwatch
//! Real-time market-data and alert-evaluation server. Per logged-in user the
//! server maintains a watchlist, multiplexes its tick subscriptions over one
//! upstream broker connection, evaluates edge-triggered price-level alerts on
//! every tick, simulates paper trades derived from those alerts, and pushes
//! price / alert / trade updates to the user's browser over a long-lived
//! websocket channel.
//!
//! Architecture: every [`session`](session) runs a serial command loop that
//! exclusively owns its state; producers (HTTP handlers, channel readers, the
//! tick dispatcher, timers) only ever enqueue commands. The
//! [`feed`](levelwatch_feed) crate owns the upstream connection, the
//! [`channel`](channel) module owns the downstream ones, and the
//! [`persist`](persist) module writes coalesced session snapshots behind the
//! scenes so a user's state survives process restarts.

/// Price-level alerts: types, edge-triggered evaluation and auto-generated
/// support/resistance levels.
pub mod alert;

/// Downstream duplex channels: wire protocol frames and the per-client channel
/// manager with heartbeat and slow-consumer handling.
pub mod channel;

/// Wall/monotonic clock indirection with market-timezone awareness.
pub mod clock;

/// Operator configuration.
pub mod config;

/// Structured logging initialisation.
pub mod logging;

/// Paper trading: virtual positions derived from alert triggers.
pub mod paper;

/// Durable session snapshots: store abstraction and the write-behind flusher.
pub mod persist;

/// Instrument resolution and previous-day OHLC lookup.
pub mod scrip;

/// Axum server: websocket stream endpoint, REST command producers, health.
pub mod server;

/// Sessions: state, commands, the per-session command loop and the registry.
pub mod session;
