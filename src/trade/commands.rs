/// 거래 관련 커맨드 처리
/// 모든 커맨드는 호출자가 연 트랜잭션 안에서 실행되고, 커밋 후 발행할 알림을 돌려준다.
/// 1. 거래 제안
/// 2. 거래 액션 (수락/거절/역제안/완료/취소)
/// 3. 거래 평가
// region:    --- Imports
use super::completion::{self, CompletionMode};
use super::model::{Party, Trade, TradeAction, TradeDetails, TradeItem, TradeRating, TradeStatus};
use super::rules::{self, Transition};
use crate::error::{DbResultExt, TradeError, TradeResult};
use crate::event_store::{self, NewTradeEvent};
use crate::inventory::commands as inventory;
use crate::inventory::Item;
use crate::notification::{self, NewNotification, Notification, NotificationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use tracing::info;
// endregion: --- Imports

// region:    --- Commands
/// 거래 제안 명령
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProposeTradeCommand {
    pub initiator_id: i64,
    pub target_item_id: i64,
    pub offered_item_ids: Vec<i64>,
    #[serde(default)]
    pub cash_amount: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 액션별 추가 데이터 (역제안 상품/금액, 메모)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ActionPayload {
    #[serde(default)]
    pub offered_item_ids: Vec<i64>,
    #[serde(default)]
    pub cash_amount: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
}

/// 거래 액션 명령
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActOnTradeCommand {
    pub actor_id: i64,
    pub action: TradeAction,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

/// 거래 평가 명령
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateTradeCommand {
    pub rater_id: i64,
    pub score: i16,
    #[serde(default)]
    pub comment: Option<String>,
}

/// 커맨드 결과: 변경된 거래와 커밋 후 발행할 알림
#[derive(Debug, Clone)]
pub struct CommandOutcome<T> {
    pub value: T,
    pub notifications: Vec<Notification>,
}
// endregion: --- Commands

// region:    --- Shared Helpers
/// 거래 행 잠금 후 조회
pub(crate) async fn lock_trade(conn: &mut PgConnection, trade_id: i64) -> TradeResult<Trade> {
    sqlx::query_as::<_, Trade>("SELECT * FROM trades WHERE id = $1 FOR UPDATE")
        .bind(trade_id)
        .fetch_optional(&mut *conn)
        .await
        .db_context("lock_trade", trade_id)?
        .ok_or_else(|| TradeError::not_found("trade", trade_id))
}

/// 거래에 걸린 모든 상품 id (대상 상품 포함, 오름차순)
pub(crate) async fn involved_item_ids(
    conn: &mut PgConnection,
    trade: &Trade,
) -> TradeResult<Vec<i64>> {
    let mut ids =
        sqlx::query_scalar::<_, i64>("SELECT item_id FROM trade_items WHERE trade_id = $1")
            .bind(trade.id)
            .fetch_all(&mut *conn)
            .await
            .db_context("list_trade_items", trade.id)?;
    ids.push(trade.target_item_id);
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

async fn load_trade_items(conn: &mut PgConnection, trade_id: i64) -> TradeResult<Vec<TradeItem>> {
    sqlx::query_as::<_, TradeItem>(
        "SELECT trade_id, item_id, offered_by FROM trade_items WHERE trade_id = $1 ORDER BY item_id",
    )
    .bind(trade_id)
    .fetch_all(&mut *conn)
    .await
    .db_context("list_trade_items", trade_id)
}

async fn insert_trade_items(
    conn: &mut PgConnection,
    trade_id: i64,
    items: &[(i64, Party)],
) -> TradeResult<()> {
    for (item_id, offered_by) in items {
        sqlx::query("INSERT INTO trade_items (trade_id, item_id, offered_by) VALUES ($1, $2, $3)")
            .bind(trade_id)
            .bind(item_id)
            .bind(offered_by.as_str())
            .execute(&mut *conn)
            .await
            .db_context("insert_trade_item", trade_id)?;
    }
    Ok(())
}

/// 제안/역제안 상품 목록 형식 검증 (DB 조회 전)
fn validate_offer(
    target_item_id: i64,
    offered_item_ids: &[i64],
    cash_amount: Option<i64>,
) -> TradeResult<()> {
    if offered_item_ids.is_empty() {
        return Err(TradeError::Validation(
            "제안 상품이 비어 있습니다.".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(offered_item_ids.len());
    if !offered_item_ids.iter().all(|id| seen.insert(*id)) {
        return Err(TradeError::Validation(
            "제안 상품이 중복되었습니다.".to_string(),
        ));
    }
    if offered_item_ids.contains(&target_item_id) {
        return Err(TradeError::Validation(
            "대상 상품을 제안 상품으로 넣을 수 없습니다.".to_string(),
        ));
    }
    if cash_amount.is_some_and(|amount| amount < 0) {
        return Err(TradeError::Validation(
            "제안 금액은 0 이상이어야 합니다.".to_string(),
        ));
    }
    Ok(())
}

fn ensure_available(item: &Item, now: DateTime<Utc>) -> TradeResult<()> {
    if item.is_available(now) {
        Ok(())
    } else {
        Err(TradeError::InvalidState(format!(
            "상품 {}은(는) 거래할 수 없는 상태입니다: {}",
            item.id, item.status
        )))
    }
}

/// 상대방에게 보낼 알림 내용
struct Notice {
    recipient: i64,
    kind: NotificationKind,
    message: String,
}

/// 감사 로그 + 상대방 알림 기록
async fn record_transition(
    conn: &mut PgConnection,
    trade: &Trade,
    actor_id: i64,
    from: Option<TradeStatus>,
    note: Option<String>,
    notice: Notice,
) -> TradeResult<Notification> {
    event_store::append(
        conn,
        NewTradeEvent {
            trade_id: trade.id,
            actor_id: Some(actor_id),
            from_status: from,
            to_status: trade.status,
            note,
        },
    )
    .await?;

    notification::insert(
        conn,
        NewNotification {
            user_id: notice.recipient,
            trade_id: Some(trade.id),
            kind: notice.kind,
            message: notice.message,
            payload: serde_json::json!({
                "trade_id": trade.id,
                "status": trade.status,
                "actor_id": actor_id,
            }),
        },
    )
    .await
}
// endregion: --- Shared Helpers

// region:    --- 1. Propose
/// 1. 거래 제안
pub async fn propose(
    conn: &mut PgConnection,
    cmd: ProposeTradeCommand,
    now: DateTime<Utc>,
) -> TradeResult<CommandOutcome<TradeDetails>> {
    validate_offer(cmd.target_item_id, &cmd.offered_item_ids, cmd.cash_amount)?;

    let mut all_ids = cmd.offered_item_ids.clone();
    all_ids.push(cmd.target_item_id);
    let items: HashMap<i64, Item> = inventory::lock_existing_items(conn, &all_ids)
        .await?
        .into_iter()
        .map(|item| (item.id, item))
        .collect();

    // 대상 상품: 존재 -> 거래 가능 -> 자기 상품 여부 순으로 확인
    let target = items
        .get(&cmd.target_item_id)
        .ok_or_else(|| TradeError::not_found("item", cmd.target_item_id))?;
    ensure_available(target, now)?;
    if target.owner_id == cmd.initiator_id {
        return Err(TradeError::Validation(
            "자신의 상품에는 거래를 제안할 수 없습니다.".to_string(),
        ));
    }

    for item_id in &cmd.offered_item_ids {
        let item = items
            .get(item_id)
            .ok_or_else(|| TradeError::not_found("item", *item_id))?;
        if item.owner_id != cmd.initiator_id {
            return Err(TradeError::Forbidden(format!(
                "상품 {}은(는) 제안자의 상품이 아닙니다.",
                item_id
            )));
        }
        ensure_available(item, now)?;
    }

    let counterparty_id = target.owner_id;
    let trade = sqlx::query_as::<_, Trade>(
        "INSERT INTO trades
            (initiator_id, counterparty_id, target_item_id, status, offered_cash_amount, message, awaiting_response_from)
         VALUES ($1, $2, $3, 'pending', $4, $5, $2)
         RETURNING *",
    )
    .bind(cmd.initiator_id)
    .bind(counterparty_id)
    .bind(cmd.target_item_id)
    .bind(cmd.cash_amount)
    .bind(cmd.message.as_deref())
    .fetch_one(&mut *conn)
    .await
    .db_context("insert_trade", cmd.target_item_id)?;

    let offered: Vec<(i64, Party)> = cmd
        .offered_item_ids
        .iter()
        .map(|id| (*id, Party::Initiator))
        .collect();
    insert_trade_items(conn, trade.id, &offered).await?;

    let notification = record_transition(
        conn,
        &trade,
        cmd.initiator_id,
        None,
        cmd.message.clone(),
        Notice {
            recipient: counterparty_id,
            kind: NotificationKind::TradeProposed,
            message: format!("상품 {}에 새 거래 제안이 도착했습니다.", cmd.target_item_id),
        },
    )
    .await?;

    info!(
        "{:<12} --> 거래 제안 저장: trade={} initiator={} target={} offered={:?}",
        "Command", trade.id, cmd.initiator_id, cmd.target_item_id, cmd.offered_item_ids
    );

    let items = load_trade_items(conn, trade.id).await?;
    Ok(CommandOutcome {
        value: TradeDetails { trade, items },
        notifications: vec![notification],
    })
}
// endregion: --- 1. Propose

// region:    --- 2. Act
/// 2. 거래 액션
pub async fn act(
    conn: &mut PgConnection,
    trade_id: i64,
    cmd: ActOnTradeCommand,
    now: DateTime<Utc>,
) -> TradeResult<CommandOutcome<Trade>> {
    let trade = lock_trade(conn, trade_id).await?;
    let transition = rules::plan(&trade, cmd.actor_id, cmd.action)?;
    info!(
        "{:<12} --> 거래 액션: trade={} actor={} {} ({} -> {})",
        "Command", trade_id, cmd.actor_id, cmd.action, transition.from, transition.to
    );

    if transition.finalizes() {
        return finish_dual_completion(conn, &trade, &transition, cmd.actor_id, now).await;
    }

    let other = trade.other_party(cmd.actor_id);
    let (updated, kind, message) = match cmd.action {
        TradeAction::Accept => {
            for item_id in involved_item_ids(conn, &trade).await? {
                inventory::lock_for_trade(conn, item_id, trade.id, now).await?;
            }
            let updated = update_status(conn, &trade, TradeStatus::Active).await?;
            (
                updated,
                NotificationKind::TradeAccepted,
                format!("거래 {}이(가) 수락되었습니다.", trade.id),
            )
        }
        TradeAction::Decline => {
            release_locks(conn, &trade).await?;
            let updated = update_status(conn, &trade, TradeStatus::Declined).await?;
            (
                updated,
                NotificationKind::TradeDeclined,
                format!("거래 {}이(가) 거절되었습니다.", trade.id),
            )
        }
        TradeAction::Cancel => {
            release_locks(conn, &trade).await?;
            let updated = update_status(conn, &trade, TradeStatus::Cancelled).await?;
            (
                updated,
                NotificationKind::TradeCancelled,
                format!("거래 {}이(가) 취소되었습니다.", trade.id),
            )
        }
        TradeAction::Counter => {
            let updated = counter(conn, &trade, cmd.actor_id, &cmd.payload, now).await?;
            (
                updated,
                NotificationKind::TradeCountered,
                format!("거래 {}에 역제안이 도착했습니다.", trade.id),
            )
        }
        TradeAction::Complete => {
            let updated = request_completion(conn, &trade, transition.party, now).await?;
            (
                updated,
                NotificationKind::CompletionRequested,
                format!(
                    "상대방이 거래 {}의 완료를 확인했습니다. 완료를 확인해 주세요.",
                    trade.id
                ),
            )
        }
    };

    let notification = record_transition(
        conn,
        &updated,
        cmd.actor_id,
        Some(transition.from),
        cmd.payload.note.clone(),
        Notice {
            recipient: other,
            kind,
            message,
        },
    )
    .await?;

    Ok(CommandOutcome {
        value: updated,
        notifications: vec![notification],
    })
}

async fn update_status(
    conn: &mut PgConnection,
    trade: &Trade,
    status: TradeStatus,
) -> TradeResult<Trade> {
    sqlx::query_as::<_, Trade>(
        "UPDATE trades SET status = $2, awaiting_response_from = NULL, updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(trade.id)
    .bind(status.as_str())
    .fetch_one(&mut *conn)
    .await
    .db_context("update_trade_status", trade.id)
}

/// 거래가 잡은 상품 잠금 해제 (협상 중이면 잠금이 없어 아무 일도 없다)
async fn release_locks(conn: &mut PgConnection, trade: &Trade) -> TradeResult<()> {
    for item_id in involved_item_ids(conn, trade).await? {
        inventory::release_trade_lock(conn, item_id, trade.id).await?;
    }
    Ok(())
}

/// 역제안: 거래 상품 목록과 금액을 교체하고 응답 차례를 넘긴다.
async fn counter(
    conn: &mut PgConnection,
    trade: &Trade,
    actor_id: i64,
    payload: &ActionPayload,
    now: DateTime<Utc>,
) -> TradeResult<Trade> {
    validate_offer(
        trade.target_item_id,
        &payload.offered_item_ids,
        payload.cash_amount,
    )?;

    let mut offered = Vec::with_capacity(payload.offered_item_ids.len());
    for item in inventory::lock_items(conn, &payload.offered_item_ids).await? {
        let offered_by = if item.owner_id == trade.initiator_id {
            Party::Initiator
        } else if item.owner_id == trade.counterparty_id {
            Party::Counterparty
        } else {
            return Err(TradeError::Forbidden(format!(
                "상품 {}은(는) 거래 당사자의 상품이 아닙니다.",
                item.id
            )));
        };
        ensure_available(&item, now)?;
        offered.push((item.id, offered_by));
    }

    sqlx::query("DELETE FROM trade_items WHERE trade_id = $1")
        .bind(trade.id)
        .execute(&mut *conn)
        .await
        .db_context("replace_trade_items", trade.id)?;
    insert_trade_items(conn, trade.id, &offered).await?;

    sqlx::query_as::<_, Trade>(
        "UPDATE trades
         SET status = 'countered', offered_cash_amount = $2, awaiting_response_from = $3, updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(trade.id)
    .bind(payload.cash_amount)
    .bind(trade.other_party(actor_id))
    .fetch_one(&mut *conn)
    .await
    .db_context("counter_trade", trade.id)
}

async fn set_completion_flag(
    conn: &mut PgConnection,
    trade: &Trade,
    party: Party,
    now: DateTime<Utc>,
) -> TradeResult<Trade> {
    let sql = match party {
        Party::Initiator => {
            "UPDATE trades
             SET initiator_completed = TRUE,
                 first_completion_at = COALESCE(first_completion_at, $2),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *"
        }
        Party::Counterparty => {
            "UPDATE trades
             SET counterparty_completed = TRUE,
                 first_completion_at = COALESCE(first_completion_at, $2),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *"
        }
    };
    sqlx::query_as::<_, Trade>(sql)
        .bind(trade.id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .db_context("set_completion_flag", trade.id)
}

/// 첫 번째 완료 요청: 확인 대기 상태로 전환
async fn request_completion(
    conn: &mut PgConnection,
    trade: &Trade,
    party: Party,
    now: DateTime<Utc>,
) -> TradeResult<Trade> {
    set_completion_flag(conn, trade, party, now).await?;
    sqlx::query_as::<_, Trade>(
        "UPDATE trades
         SET status = 'awaiting_confirmation',
             awaiting_confirmation_since = COALESCE(awaiting_confirmation_since, $2),
             updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(trade.id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .db_context("request_completion", trade.id)
}

/// 두 번째 완료 요청: 같은 트랜잭션 안에서 완료 트랜잭션 실행
async fn finish_dual_completion(
    conn: &mut PgConnection,
    trade: &Trade,
    transition: &Transition,
    actor_id: i64,
    now: DateTime<Utc>,
) -> TradeResult<CommandOutcome<Trade>> {
    set_completion_flag(conn, trade, transition.party, now).await?;
    let outcome =
        completion::complete_trade(conn, trade.id, CompletionMode::Dual { actor_id }, now).await?;
    Ok(CommandOutcome {
        value: outcome.trade,
        notifications: outcome.notifications,
    })
}
// endregion: --- 2. Act

// region:    --- 3. Rate
/// 3. 거래 평가
pub async fn rate(
    conn: &mut PgConnection,
    trade_id: i64,
    cmd: RateTradeCommand,
) -> TradeResult<TradeRating> {
    if !(1..=5).contains(&cmd.score) {
        return Err(TradeError::Validation(
            "평점은 1에서 5 사이여야 합니다.".to_string(),
        ));
    }

    let trade = sqlx::query_as::<_, Trade>("SELECT * FROM trades WHERE id = $1")
        .bind(trade_id)
        .fetch_optional(&mut *conn)
        .await
        .db_context("get_trade", trade_id)?
        .ok_or_else(|| TradeError::not_found("trade", trade_id))?;

    if trade.party_of(cmd.rater_id).is_none() {
        return Err(TradeError::Forbidden(format!(
            "사용자 {}은(는) 거래 {}의 당사자가 아닙니다.",
            cmd.rater_id, trade_id
        )));
    }
    if !trade.status.is_success() {
        return Err(TradeError::InvalidState(format!(
            "완료된 거래만 평가할 수 있습니다: {}",
            trade.status
        )));
    }

    sqlx::query_as::<_, TradeRating>(
        "INSERT INTO trade_ratings (trade_id, rater_id, ratee_id, score, comment)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (trade_id, rater_id) DO NOTHING
         RETURNING *",
    )
    .bind(trade_id)
    .bind(cmd.rater_id)
    .bind(trade.other_party(cmd.rater_id))
    .bind(cmd.score)
    .bind(cmd.comment.as_deref())
    .fetch_optional(&mut *conn)
    .await
    .db_context("insert_trade_rating", trade_id)?
    .ok_or_else(|| {
        TradeError::Conflict(format!(
            "사용자 {}은(는) 거래 {}을(를) 이미 평가했습니다.",
            cmd.rater_id, trade_id
        ))
    })
}
// endregion: --- 3. Rate
