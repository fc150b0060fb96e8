/// 상품 재고 상태 관리
/// available -> reserved/locked -> traded
// region:    --- Imports
use crate::database::DatabaseManager;
use crate::error::TradeResult;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
// endregion: --- Imports

pub mod commands;
pub mod model;

pub use model::{Item, ItemStatus, TransferOutcome};

// region:    --- Inventory Manager
/// 단독 트랜잭션으로 상품 커맨드를 실행한다.
/// 거래 흐름 안에서는 commands 의 함수를 같은 트랜잭션으로 직접 호출한다.
pub struct InventoryManager {
    db_manager: Arc<DatabaseManager>,
}

impl InventoryManager {
    pub fn new(db_manager: Arc<DatabaseManager>) -> Self {
        Self { db_manager }
    }

    /// 상품 예약
    pub async fn reserve(
        &self,
        item_id: i64,
        user_id: i64,
        duration_minutes: i64,
    ) -> TradeResult<Item> {
        info!(
            "{:<12} --> 예약 요청: item={} user={} minutes={}",
            "Inventory", item_id, user_id, duration_minutes
        );
        let mut tx = self.db_manager.pool().begin().await?;
        let item =
            commands::reserve(&mut tx, item_id, user_id, duration_minutes, Utc::now()).await?;
        tx.commit().await?;
        Ok(item)
    }

    /// 즉시 판매
    pub async fn complete_sale(&self, item_id: i64, buyer_id: i64) -> TradeResult<Item> {
        info!(
            "{:<12} --> 판매 요청: item={} buyer={}",
            "Inventory", item_id, buyer_id
        );
        let mut tx = self.db_manager.pool().begin().await?;
        let item = commands::complete_sale(&mut tx, item_id, buyer_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(item)
    }

    /// 만료 예약 정리
    pub async fn cleanup_expired_reservations(&self) -> TradeResult<u64> {
        let mut tx = self.db_manager.pool().begin().await?;
        let cleared = commands::cleanup_expired_reservations(&mut tx, Utc::now()).await?;
        tx.commit().await?;
        if cleared > 0 {
            info!(
                "{:<12} --> 만료 예약 {}건 정리",
                "Inventory", cleared
            );
        }
        Ok(cleared)
    }
}
// endregion: --- Inventory Manager
