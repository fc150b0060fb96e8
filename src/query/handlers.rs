// region:    --- Imports
use super::queries;
use crate::database::DatabaseManager;
use crate::error::{DbResultExt, TradeError, TradeResult};
use crate::inventory::Item;
use crate::notification::Notification;
use crate::trade::model::{Trade, TradeEvent, TradeItem, TradeRating};
use chrono::{DateTime, Utc};
use tracing::info;
// endregion: --- Imports

// region:    --- Query Handlers

/// 상품 조회
pub async fn get_item(db_manager: &DatabaseManager, item_id: i64) -> TradeResult<Item> {
    info!("{:<12} --> 상품 조회 id: {}", "Query", item_id);
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, Item>(queries::GET_ITEM)
                    .bind(item_id)
                    .fetch_optional(&mut **tx)
                    .await
                    .db_context("get_item", item_id)
                    .and_then(|item| item.ok_or_else(|| TradeError::not_found("item", item_id)))
            })
        })
        .await
}

/// 거래 조회
pub async fn get_trade(db_manager: &DatabaseManager, trade_id: i64) -> TradeResult<Trade> {
    info!("{:<12} --> 거래 조회 id: {}", "Query", trade_id);
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, Trade>(queries::GET_TRADE)
                    .bind(trade_id)
                    .fetch_optional(&mut **tx)
                    .await
                    .db_context("get_trade", trade_id)
                    .and_then(|trade| {
                        trade.ok_or_else(|| TradeError::not_found("trade", trade_id))
                    })
            })
        })
        .await
}

/// 거래 상품 조회
pub async fn get_trade_items(
    db_manager: &DatabaseManager,
    trade_id: i64,
) -> TradeResult<Vec<TradeItem>> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, TradeItem>(queries::GET_TRADE_ITEMS)
                    .bind(trade_id)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_trade_items", trade_id)
            })
        })
        .await
}

/// 거래 감사 로그 조회
pub async fn get_trade_events(
    db_manager: &DatabaseManager,
    trade_id: i64,
) -> TradeResult<Vec<TradeEvent>> {
    info!("{:<12} --> 거래 이력 조회 id: {}", "Query", trade_id);
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, TradeEvent>(queries::GET_TRADE_EVENTS)
                    .bind(trade_id)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_trade_events", trade_id)
            })
        })
        .await
}

/// 거래 평가 조회
pub async fn get_trade_ratings(
    db_manager: &DatabaseManager,
    trade_id: i64,
) -> TradeResult<Vec<TradeRating>> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, TradeRating>(queries::GET_TRADE_RATINGS)
                    .bind(trade_id)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_trade_ratings", trade_id)
            })
        })
        .await
}

/// 사용자 알림 조회 (최신순)
pub async fn get_user_notifications(
    db_manager: &DatabaseManager,
    user_id: i64,
    limit: i64,
) -> TradeResult<Vec<Notification>> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, Notification>(queries::GET_USER_NOTIFICATIONS)
                    .bind(user_id)
                    .bind(limit)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_user_notifications", user_id)
            })
        })
        .await
}

/// 진행 중인 거래 간선 조회
pub async fn get_live_trade_edges(db_manager: &DatabaseManager) -> TradeResult<Vec<(i64, i64)>> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, (i64, i64)>(queries::GET_LIVE_TRADE_EDGES)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_live_trade_edges", 0)
            })
        })
        .await
}

/// 자동 완료 대상 거래 id 조회
pub async fn get_stalled_trade_ids(
    db_manager: &DatabaseManager,
    cutoff: DateTime<Utc>,
) -> TradeResult<Vec<i64>> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_scalar::<_, i64>(queries::GET_STALLED_TRADE_IDS)
                    .bind(cutoff)
                    .fetch_all(&mut **tx)
                    .await
                    .db_context("get_stalled_trade_ids", 0)
            })
        })
        .await
}

// endregion: --- Query Handlers
