use crate::{
    channel::manager::ChannelManager, config::Config, scrip::ScripDirectory,
    session::SessionId, session::registry::SessionRegistry,
};
use axum::{
    Router,
    routing::{delete, get, post},
};
use levelwatch_feed::client::FeedHandle;
use std::sync::Arc;

pub mod api;
pub mod stream;

/// Shared state of the axum edge. Everything is a cloneable handle; the edge
/// owns no session state of its own.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub manager: Arc<ChannelManager>,
    pub feed: FeedHandle<SessionId>,
    pub scrip: Arc<dyn ScripDirectory>,
    pub config: Arc<Config>,
}

/// The full HTTP surface: the duplex stream endpoint plus the CRUD command
/// producers the front-end drives the core with.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{session_id}", get(stream::stream_handler))
        .route("/healthz", get(api::healthz))
        .route("/api/session/login", post(api::login))
        .route("/api/session/logout", post(api::logout))
        .route("/api/session/verify/{session_id}", get(api::verify))
        .route("/api/scrips", get(api::search_scrips))
        .route(
            "/api/watchlist/{session_id}",
            get(api::watchlist).post(api::add_watchlist),
        )
        .route(
            "/api/watchlist/{session_id}/{exchange}/{token}",
            delete(api::remove_watchlist),
        )
        .route("/api/watchlist/{session_id}/refresh", post(api::refresh_watchlist))
        .route(
            "/api/watchlist/{session_id}/reference-date",
            post(api::set_reference_date),
        )
        .route(
            "/api/alerts/{session_id}",
            get(api::alerts).post(api::create_alert),
        )
        .route("/api/alerts/{session_id}/{alert_id}", delete(api::delete_alert))
        .route("/api/alerts/{session_id}/generate", post(api::generate_alerts))
        .route(
            "/api/alerts/{session_id}/generate-bulk",
            post(api::generate_alerts_bulk),
        )
        .route("/api/alerts/{session_id}/delete-many", post(api::delete_alerts))
        .route("/api/alerts/{session_id}/clear", post(api::clear_alerts))
        .route("/api/alerts/{session_id}/pause", post(api::pause_alerts))
        .route("/api/alerts/{session_id}/logs", get(api::alert_logs))
        .route("/api/paper/{session_id}", get(api::paper_summary))
        .route("/api/paper/{session_id}/toggle", post(api::toggle_paper))
        .route("/api/paper/{session_id}/close", post(api::close_trade))
        .route("/api/paper/{session_id}/clear", post(api::clear_trades))
        .route("/api/paper/{session_id}/balance", post(api::set_balance))
        .route("/api/paper/{session_id}/stop-loss", post(api::set_stop_loss))
        .route("/api/paper/{session_id}/target", post(api::set_target))
        .route("/api/paper/{session_id}/trade", post(api::manual_trade))
        .route("/api/paper/{session_id}/export", get(api::export_trades))
        .with_state(state)
}
