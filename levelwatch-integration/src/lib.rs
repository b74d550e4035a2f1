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

//! # Levelwatch-Integration
//! Low-level channel and socket plumbing shared by the levelwatch server tasks.
//!
//! Tasks in the server communicate exclusively through the primitives defined
//! here: bounded / unbounded transmitters behind the [`channel::Tx`] trait, the
//! conflating latest-value mailbox used for tick delivery, and thin websocket
//! helpers over `tokio-tungstenite`.

/// Channel primitives: [`Tx`](channel::Tx) abstraction, bounded and unbounded
/// transmitters, and the conflating mailbox.
pub mod channel;

/// All socket IO related errors.
pub mod error;

/// Websocket protocol helpers.
pub mod protocol;
