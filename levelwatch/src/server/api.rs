use crate::{
    alert::{Alert, AlertCondition, AlertId, AlertLogEntry},
    paper::{PaperSummary, PaperTrade, TradeId},
    server::AppState,
    session::{
        SessionId, UserId, WatchlistItem,
        command::{Command, CommandError, SessionError, SessionView},
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use levelwatch_feed::{BrokerCredentials, client::ConnectionState, metrics::FeedMetricsSnapshot};
use levelwatch_instrument::{
    Side,
    exchange::Exchange,
    instrument::{Instrument, InstrumentToken, MarketId},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error envelope every endpoint shares: `{code, detail, retriable}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
    retriable: bool,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "session_unknown",
            detail: "no session for the presented identity".to_string(),
            retriable: false,
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            detail: detail.into(),
            retriable: false,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        let status = match &error {
            SessionError::Quarantined => StatusCode::LOCKED,
            SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            code: error.code(),
            detail: error.to_string(),
            retriable: false,
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::QueueFull => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "queue_full",
                detail: error.to_string(),
                retriable: true,
            },
            CommandError::SessionGone | CommandError::ReplyDropped => Self {
                status: StatusCode::NOT_FOUND,
                code: "session_unknown",
                detail: error.to_string(),
                retriable: false,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code,
            "detail": self.detail,
            "retriable": self.retriable,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Locate the session and run one command through its loop.
async fn command<T>(
    state: &AppState,
    session_id: Uuid,
    make: impl FnOnce(tokio::sync::oneshot::Sender<Result<T, SessionError>>) -> Command,
) -> Result<T, ApiError> {
    let handle = state
        .registry
        .get(SessionId(session_id))
        .ok_or_else(ApiError::not_found)?;
    match handle.request(make).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.into()),
        Err(error) => Err(error.into()),
    }
}

fn market_of(exchange: &str, token: u32) -> Result<MarketId, ApiError> {
    let exchange: Exchange = exchange
        .parse()
        .map_err(|error| ApiError::bad_request(format!("{error}")))?;
    Ok(MarketId::new(exchange, InstrumentToken(token)))
}

// ---------------------------------------------------------------------------
// session
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub session_id: SessionId,
    pub user_id: UserId,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id must not be empty"));
    }

    let credentials = match (request.api_key, request.access_token) {
        (Some(api_key), Some(access_token)) => Some(BrokerCredentials::new(
            api_key.into(),
            access_token.into(),
        )),
        _ => None,
    };

    let handle = state
        .registry
        .login(UserId::new(request.user_id), credentials)
        .await;
    Ok(Json(LoginResponse {
        session_id: handle.session_id,
        user_id: handle.user_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub session_id: Uuid,
}

pub async fn logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> ApiResult<serde_json::Value> {
    let removed = state.registry.logout(SessionId(request.session_id)).await;
    Ok(Json(serde_json::json!({ "logged_out": removed })))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<LoginResponse> {
    let handle = state
        .registry
        .get(SessionId(session_id))
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(LoginResponse {
        session_id: handle.session_id,
        user_id: handle.user_id,
    }))
}

// ---------------------------------------------------------------------------
// scrips
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ScripQuery {
    pub q: String,
    pub limit: Option<usize>,
}

pub async fn search_scrips(
    State(state): State<AppState>,
    Query(query): Query<ScripQuery>,
) -> ApiResult<Vec<Instrument>> {
    Ok(Json(state.scrip.search(&query.q, query.limit.unwrap_or(20))))
}

// ---------------------------------------------------------------------------
// watchlist
// ---------------------------------------------------------------------------

pub async fn watchlist(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Vec<WatchlistItem>> {
    let view: SessionView = command(&state, session_id, |reply| Command::View { reply }).await?;
    Ok(Json(view.watchlist))
}

#[derive(Debug, Deserialize)]
pub struct AddWatchlistRequest {
    pub exchange: String,
    pub token: u32,
    pub symbol: Option<String>,
}

pub async fn add_watchlist(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<AddWatchlistRequest>,
) -> ApiResult<WatchlistItem> {
    let market = market_of(&request.exchange, request.token)?;
    let instrument = state
        .scrip
        .resolve(market.exchange, market.token)
        .or_else(|| {
            request
                .symbol
                .map(|symbol| Instrument::new(market.exchange, market.token, symbol))
        })
        .ok_or_else(|| ApiError::bad_request(format!("unknown instrument {market}")))?;

    let item = command(&state, session_id, |reply| Command::AddToWatchlist {
        instrument,
        reply,
    })
    .await?;
    Ok(Json(item))
}

pub async fn remove_watchlist(
    State(state): State<AppState>,
    Path((session_id, exchange, token)): Path<(Uuid, String, u32)>,
) -> ApiResult<serde_json::Value> {
    let market = market_of(&exchange, token)?;
    command(&state, session_id, |reply| Command::RemoveFromWatchlist {
        market,
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "removed": market.to_string() })))
}

pub async fn refresh_watchlist(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Vec<WatchlistItem>> {
    let items = command(&state, session_id, |reply| Command::RefreshWatchlist { reply }).await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct ReferenceDateRequest {
    pub date: Option<NaiveDate>,
}

pub async fn set_reference_date(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<ReferenceDateRequest>,
) -> ApiResult<serde_json::Value> {
    let date = command(&state, session_id, |reply| Command::SetReferenceDate {
        date: request.date,
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "reference_date": date })))
}

// ---------------------------------------------------------------------------
// alerts
// ---------------------------------------------------------------------------

pub async fn alerts(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Vec<Alert>> {
    let view: SessionView = command(&state, session_id, |reply| Command::View { reply }).await?;
    Ok(Json(view.active_alerts))
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub exchange: String,
    pub token: u32,
    pub condition: AlertCondition,
    pub price: Decimal,
}

pub async fn create_alert(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CreateAlertRequest>,
) -> ApiResult<Alert> {
    let market = market_of(&request.exchange, request.token)?;
    let alert = command(&state, session_id, |reply| Command::CreateAlert {
        market,
        condition: request.condition,
        price: request.price,
        reply,
    })
    .await?;
    Ok(Json(alert))
}

pub async fn delete_alert(
    State(state): State<AppState>,
    Path((session_id, alert_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<serde_json::Value> {
    command(&state, session_id, |reply| Command::DeleteAlert {
        id: AlertId(alert_id),
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": alert_id })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateAlertsRequest {
    pub exchange: String,
    pub token: u32,
}

pub async fn generate_alerts(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<GenerateAlertsRequest>,
) -> ApiResult<Vec<Alert>> {
    let market = market_of(&request.exchange, request.token)?;
    let alerts = command(&state, session_id, |reply| Command::GenerateAutoAlerts {
        market,
        reply,
    })
    .await?;
    Ok(Json(alerts))
}

/// Bulk generation is iterative per symbol under the hood; instruments without
/// reference OHLC are reported, not fatal.
pub async fn generate_alerts_bulk(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let view: SessionView = command(&state, session_id, |reply| Command::View { reply }).await?;

    let mut generated = 0usize;
    let mut skipped: Vec<String> = Vec::new();
    for item in view.watchlist {
        let market = item.instrument.market_id();
        match command(&state, session_id, |reply| Command::GenerateAutoAlerts {
            market,
            reply,
        })
        .await
        {
            Ok(alerts) => generated += alerts.len(),
            Err(_) => skipped.push(market.to_string()),
        }
    }

    Ok(Json(serde_json::json!({
        "generated": generated,
        "skipped": skipped,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteAlertsRequest {
    pub ids: Vec<Uuid>,
}

pub async fn delete_alerts(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<DeleteAlertsRequest>,
) -> ApiResult<serde_json::Value> {
    let removed = command(&state, session_id, |reply| Command::DeleteAlerts {
        ids: request.ids.into_iter().map(AlertId).collect(),
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "deleted": removed })))
}

pub async fn clear_alerts(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let removed = command(&state, session_id, |reply| Command::ClearAlerts { reply }).await?;
    Ok(Json(serde_json::json!({ "deleted": removed })))
}

#[derive(Debug, Deserialize)]
pub struct PauseAlertsRequest {
    pub paused: bool,
}

pub async fn pause_alerts(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<PauseAlertsRequest>,
) -> ApiResult<serde_json::Value> {
    let paused = command(&state, session_id, |reply| Command::PauseAlerts {
        paused: request.paused,
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "paused": paused })))
}

pub async fn alert_logs(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Vec<AlertLogEntry>> {
    let logs = command(&state, session_id, |reply| Command::AlertLogs { reply }).await?;
    Ok(Json(logs))
}

// ---------------------------------------------------------------------------
// paper
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PaperView {
    pub summary: PaperSummary,
    pub trades: Vec<PaperTrade>,
}

pub async fn paper_summary(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<PaperView> {
    let view: SessionView = command(&state, session_id, |reply| Command::View { reply }).await?;
    Ok(Json(PaperView {
        summary: view.paper,
        trades: view.trades,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TogglePaperRequest {
    pub enabled: bool,
}

pub async fn toggle_paper(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<TogglePaperRequest>,
) -> ApiResult<serde_json::Value> {
    let enabled = command(&state, session_id, |reply| Command::SetPaperEnabled {
        enabled: request.enabled,
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "auto_paper_enabled": enabled })))
}

#[derive(Debug, Deserialize)]
pub struct CloseTradeRequest {
    pub trade_id: Uuid,
}

pub async fn close_trade(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CloseTradeRequest>,
) -> ApiResult<PaperTrade> {
    let trade = command(&state, session_id, |reply| Command::CloseTrade {
        trade_id: TradeId(request.trade_id),
        reply,
    })
    .await?;
    Ok(Json(trade))
}

pub async fn clear_trades(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let removed =
        command(&state, session_id, |reply| Command::ClearClosedTrades { reply }).await?;
    Ok(Json(serde_json::json!({ "cleared": removed })))
}

#[derive(Debug, Deserialize)]
pub struct SetBalanceRequest {
    pub balance: Decimal,
}

pub async fn set_balance(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SetBalanceRequest>,
) -> ApiResult<serde_json::Value> {
    let balance = command(&state, session_id, |reply| Command::SetVirtualBalance {
        balance: request.balance,
        reply,
    })
    .await?;
    Ok(Json(serde_json::json!({ "virtual_balance": balance })))
}

#[derive(Debug, Deserialize)]
pub struct SetStopRequest {
    pub trade_id: Uuid,
    pub price: Option<Decimal>,
}

pub async fn set_stop_loss(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SetStopRequest>,
) -> ApiResult<PaperTrade> {
    let trade = command(&state, session_id, |reply| Command::SetStopLoss {
        trade_id: TradeId(request.trade_id),
        stop_loss: request.price,
        reply,
    })
    .await?;
    Ok(Json(trade))
}

pub async fn set_target(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SetStopRequest>,
) -> ApiResult<PaperTrade> {
    let trade = command(&state, session_id, |reply| Command::SetTarget {
        trade_id: TradeId(request.trade_id),
        target: request.price,
        reply,
    })
    .await?;
    Ok(Json(trade))
}

#[derive(Debug, Deserialize)]
pub struct ManualTradeRequest {
    pub exchange: String,
    pub token: u32,
    pub side: Side,
    pub quantity: Option<u64>,
}

pub async fn manual_trade(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<ManualTradeRequest>,
) -> ApiResult<PaperTrade> {
    let market = market_of(&request.exchange, request.token)?;
    let trade = command(&state, session_id, |reply| Command::ManualTrade {
        market,
        side: request.side,
        quantity: request.quantity,
        reply,
    })
    .await?;
    Ok(Json(trade))
}

pub async fn export_trades(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let csv = command(&state, session_id, |reply| Command::TradesCsv { reply }).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"paper_trades.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub sessions: usize,
    pub channels: usize,
    pub feed_state: ConnectionState,
    pub feed: FeedMetricsSnapshot,
}

pub async fn healthz(State(state): State<AppState>) -> Json<Health> {
    let feed_state = *state.feed.state().borrow();
    Json(Health {
        status: "ok",
        sessions: state.registry.session_count(),
        channels: state.manager.len(),
        feed_state,
        feed: state.feed.metrics(),
    })
}
