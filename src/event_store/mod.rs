// region:    --- Imports
use crate::error::{DbResultExt, TradeResult};
use crate::trade::model::{TradeEvent, TradeStatus};
use sqlx::PgConnection;
use tracing::debug;
// endregion: --- Imports

// region:    --- Trade Event Store
/// 거래 감사 로그 기록
/// trade_events 는 추가만 하고 수정/삭제하지 않는다.
#[derive(Debug, Clone)]
pub struct NewTradeEvent {
    pub trade_id: i64,
    /// 시스템 처리(자동 완료 등)는 None
    pub actor_id: Option<i64>,
    /// 생성 이벤트는 None
    pub from_status: Option<TradeStatus>,
    pub to_status: TradeStatus,
    pub note: Option<String>,
}

/// 전이와 같은 트랜잭션 안에서 감사 로그 추가
pub async fn append(conn: &mut PgConnection, event: NewTradeEvent) -> TradeResult<TradeEvent> {
    let stored = sqlx::query_as::<_, TradeEvent>(
        "INSERT INTO trade_events (trade_id, actor_id, from_status, to_status, note)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(event.trade_id)
    .bind(event.actor_id)
    .bind(event.from_status.map(|s| s.as_str()))
    .bind(event.to_status.as_str())
    .bind(event.note.as_deref())
    .fetch_one(&mut *conn)
    .await
    .db_context("append_trade_event", event.trade_id)?;

    debug!(
        "{:<12} --> 감사 로그: trade={} {:?} -> {}",
        "EventStore", stored.trade_id, event.from_status, stored.to_status
    );
    Ok(stored)
}
// endregion: --- Trade Event Store
