/// 거래 완료 트랜잭션
/// 거래를 완료/자동완료 상태로 옮기고 mark_transferred 를 호출하는 유일한 경로.
/// 1. 거래 행 잠금 후 완료 조건 재확인 (동시 호출 방어)
/// 2. 대상 상품 + 거래 상품 수집
/// 3. 상품별 mark_transferred (같은 트랜잭션)
/// 4. 거래 상태 변경 및 시각 기록
/// 5. 커밋 (호출자) - 중간 실패 시 전체 롤백, 재시도 안전
// region:    --- Imports
use super::commands::{involved_item_ids, lock_trade};
use super::model::{Trade, TradeStatus};
use crate::database::DatabaseManager;
use crate::error::{DbResultExt, TradeError, TradeResult};
use crate::event_store::{self, NewTradeEvent};
use crate::inventory::commands::mark_transferred;
use crate::inventory::{Item, TransferOutcome};
use crate::notification::{self, NewNotification, Notification, NotificationKind};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use tracing::info;
// endregion: --- Imports

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// 양쪽 모두 완료 확인
    Dual { actor_id: i64 },
    /// 한쪽만 확인한 채 유예 시간이 지남
    Auto { grace: Duration },
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub trade: Trade,
    pub transferred: Vec<Item>,
    /// 이미 다른 흐름에서 옮겨져 건너뛴 상품
    pub skipped: Vec<i64>,
    pub notifications: Vec<Notification>,
}

/// 1. 완료 조건 확인
pub fn verify(trade: &Trade, mode: CompletionMode, now: DateTime<Utc>) -> TradeResult<()> {
    if trade.status.is_success() {
        return Err(TradeError::Conflict(format!(
            "거래 {}은(는) 이미 완료되었습니다.",
            trade.id
        )));
    }

    let ready = match mode {
        CompletionMode::Dual { .. } => {
            matches!(
                trade.status,
                TradeStatus::Active | TradeStatus::Accepted | TradeStatus::AwaitingConfirmation
            ) && trade.both_completed()
        }
        CompletionMode::Auto { grace } => {
            trade.status == TradeStatus::AwaitingConfirmation
                && trade.one_sided_completion()
                && trade
                    .awaiting_confirmation_since
                    .is_some_and(|since| since <= now - grace)
        }
    };

    if ready {
        Ok(())
    } else {
        Err(TradeError::InvalidState(format!(
            "거래 {} ({})은(는) 완료 조건을 만족하지 않습니다.",
            trade.id, trade.status
        )))
    }
}

/// 호출자가 연 트랜잭션 안에서 완료 처리
pub async fn complete_trade(
    conn: &mut PgConnection,
    trade_id: i64,
    mode: CompletionMode,
    now: DateTime<Utc>,
) -> TradeResult<CompletionOutcome> {
    // 1. 잠금 + 재확인
    let trade = lock_trade(conn, trade_id).await?;
    verify(&trade, mode, now)?;

    // 2. 상품 수집
    let item_ids = involved_item_ids(conn, &trade).await?;

    // 3. 상품 이전
    let mut transferred = Vec::with_capacity(item_ids.len());
    let mut skipped = Vec::new();
    for item_id in item_ids {
        match mark_transferred(conn, item_id, trade.id, now).await? {
            TransferOutcome::Transferred(item) => transferred.push(item),
            TransferOutcome::Skipped { item_id, .. } => skipped.push(item_id),
        }
    }

    // 4. 거래 상태 변경
    let (sql, kind, actor_id, note) = match mode {
        CompletionMode::Dual { actor_id } => (
            "UPDATE trades
             SET status = 'completed', completed_at = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
            NotificationKind::TradeCompleted,
            Some(actor_id),
            None,
        ),
        CompletionMode::Auto { grace } => (
            "UPDATE trades
             SET status = 'auto_completed', auto_completed_at = $2, completed_at = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
            NotificationKind::TradeAutoCompleted,
            None,
            Some(format!(
                "유예 시간 {}시간 경과로 자동 완료",
                grace.num_hours()
            )),
        ),
    };
    let completed = sqlx::query_as::<_, Trade>(sql)
        .bind(trade.id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .db_context("complete_trade", trade.id)?;

    event_store::append(
        conn,
        NewTradeEvent {
            trade_id: trade.id,
            actor_id,
            from_status: Some(trade.status),
            to_status: completed.status,
            note,
        },
    )
    .await?;

    let transferred_ids: Vec<i64> = transferred.iter().map(|item| item.id).collect();
    let message = match mode {
        CompletionMode::Dual { .. } => format!("거래 {}이(가) 완료되었습니다.", trade.id),
        CompletionMode::Auto { .. } => format!(
            "확인 대기 시간이 지나 거래 {}이(가) 자동 완료되었습니다.",
            trade.id
        ),
    };
    let mut notifications = Vec::with_capacity(2);
    for user_id in completed.participants() {
        notifications.push(
            notification::insert(
                conn,
                NewNotification {
                    user_id,
                    trade_id: Some(trade.id),
                    kind,
                    message: message.clone(),
                    payload: serde_json::json!({
                        "trade_id": trade.id,
                        "status": completed.status,
                        "transferred_item_ids": transferred_ids,
                        "skipped_item_ids": skipped,
                    }),
                },
            )
            .await?,
        );
    }

    info!(
        "{:<12} --> 거래 완료: trade={} status={} transferred={:?} skipped={:?}",
        "Completion", trade.id, completed.status, transferred_ids, skipped
    );

    Ok(CompletionOutcome {
        trade: completed,
        transferred,
        skipped,
        notifications,
    })
}

// region:    --- Trade Completion
/// 단독 트랜잭션으로 완료 처리 (스케줄러 등)
pub struct TradeCompletion;

impl TradeCompletion {
    pub async fn run(
        db_manager: &DatabaseManager,
        trade_id: i64,
        mode: CompletionMode,
    ) -> TradeResult<CompletionOutcome> {
        let mut tx = db_manager.pool().begin().await?;
        let outcome = complete_trade(&mut tx, trade_id, mode, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}
// endregion: --- Trade Completion
