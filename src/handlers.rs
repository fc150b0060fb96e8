// region:    --- Imports
use crate::error::TradeError;
use crate::inventory::{InventoryManager, Item};
use crate::notification::Notification;
use crate::query;
use crate::trade::commands::{ActOnTradeCommand, ProposeTradeCommand, RateTradeCommand};
use crate::trade::model::{CompletionStatus, Trade, TradeDetails, TradeEvent, TradeRating};
use crate::trade::TradeEngine;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

// endregion: --- Imports

// region:    --- App State
#[derive(Clone)]
pub struct AppState {
    pub trade_engine: Arc<TradeEngine>,
    pub inventory: Arc<InventoryManager>,
}

type ApiResult<T> = Result<Json<T>, TradeError>;

/// 라우터 설정
pub fn router(state: AppState) -> Router {
    // 테스트 페이지를 위한 cors 설정
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/trades", post(handle_propose_trade))
        .route("/trades/:id", get(handle_get_trade))
        .route("/trades/:id/actions", post(handle_trade_action))
        .route("/trades/:id/completion", get(handle_get_completion_status))
        .route("/trades/:id/events", get(handle_get_trade_history))
        .route("/trades/:id/ratings", post(handle_rate_trade))
        .route("/items/:id", get(handle_get_item))
        .route("/items/:id/reserve", post(handle_reserve_item))
        .route("/items/:id/purchase", post(handle_purchase_item))
        .route("/users/:id/notifications", get(handle_get_notifications))
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
// endregion: --- App State

// region:    --- Error Response
impl TradeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TradeError::NotFound { .. } => StatusCode::NOT_FOUND,
            TradeError::Forbidden(_) => StatusCode::FORBIDDEN,
            TradeError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TradeError::Conflict(_) => StatusCode::CONFLICT,
            TradeError::Validation(_) => StatusCode::BAD_REQUEST,
            TradeError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TradeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // 내부 오류는 로그에만 남기고 응답에는 노출하지 않는다
            TradeError::Database { .. } => {
                error!("{:<12} --> {:?}", "Handler", self);
                "내부 오류가 발생했습니다.".to_string()
            }
            _ => self.to_string(),
        };
        (
            status,
            Json(serde_json::json!({
                "error": message,
                "code": self.code(),
            })),
        )
            .into_response()
    }
}
// endregion: --- Error Response

// region:    --- Command Handlers

/// 거래 제안
pub async fn handle_propose_trade(
    State(state): State<AppState>,
    Json(cmd): Json<ProposeTradeCommand>,
) -> Result<(StatusCode, Json<TradeDetails>), TradeError> {
    info!("{:<12} --> 거래 제안 요청: {:?}", "Command", cmd);
    let details = state.trade_engine.propose_trade(cmd).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

/// 거래 액션 (수락/거절/역제안/완료/취소)
pub async fn handle_trade_action(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
    Json(cmd): Json<ActOnTradeCommand>,
) -> ApiResult<Trade> {
    info!(
        "{:<12} --> 거래 액션 요청 id: {}, {:?}",
        "Command", trade_id, cmd
    );
    Ok(Json(state.trade_engine.act_on_trade(trade_id, cmd).await?))
}

/// 거래 평가
pub async fn handle_rate_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
    Json(cmd): Json<RateTradeCommand>,
) -> Result<(StatusCode, Json<TradeRating>), TradeError> {
    info!("{:<12} --> 거래 평가 요청 id: {}", "Command", trade_id);
    let rating = state.trade_engine.rate_trade(trade_id, cmd).await?;
    Ok((StatusCode::CREATED, Json(rating)))
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub user_id: i64,
    pub duration_minutes: i64,
}

/// 상품 예약
pub async fn handle_reserve_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
    Json(req): Json<ReserveRequest>,
) -> ApiResult<Item> {
    Ok(Json(
        state
            .inventory
            .reserve(item_id, req.user_id, req.duration_minutes)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub buyer_id: i64,
}

/// 즉시 구매
pub async fn handle_purchase_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<Item> {
    Ok(Json(
        state.inventory.complete_sale(item_id, req.buyer_id).await?,
    ))
}

// endregion: --- Command Handlers

// region:    --- Query Handlers

/// 거래 조회
pub async fn handle_get_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<TradeDetails> {
    info!("{:<12} --> 거래 조회 id: {}", "HandlerQuery", trade_id);
    Ok(Json(state.trade_engine.get_trade(trade_id).await?))
}

/// 완료 확인 상태 조회
pub async fn handle_get_completion_status(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<CompletionStatus> {
    info!(
        "{:<12} --> 완료 상태 조회 id: {}",
        "HandlerQuery", trade_id
    );
    Ok(Json(
        state.trade_engine.get_completion_status(trade_id).await?,
    ))
}

/// 거래 이력 조회
pub async fn handle_get_trade_history(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<Vec<TradeEvent>> {
    Ok(Json(state.trade_engine.trade_history(trade_id).await?))
}

/// 상품 조회
pub async fn handle_get_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> ApiResult<Item> {
    info!("{:<12} --> 상품 조회 id: {}", "HandlerQuery", item_id);
    Ok(Json(
        query::handlers::get_item(state.trade_engine.db_manager(), item_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub limit: Option<i64>,
}

/// 사용자 알림 조회
pub async fn handle_get_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<NotificationParams>,
) -> ApiResult<Vec<Notification>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(
        query::handlers::get_user_notifications(state.trade_engine.db_manager(), user_id, limit)
            .await?,
    ))
}

// endregion: --- Query Handlers
