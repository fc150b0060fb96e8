/// 상품 상태 변경 커맨드
/// 모든 커맨드는 호출자가 연 트랜잭션 안에서 실행되며, 먼저 대상 상품 행을 잠근다(FOR UPDATE).
/// 상태 변경은 잠금 시 읽은 version 으로 CAS 업데이트하고, 영향받은 행이 없으면 Conflict 로 본다.
/// 1. 예약
/// 2. 즉시 판매
/// 3. 거래 잠금 / 해제
/// 4. 거래 완료 이전
/// 5. 만료 예약 정리
// region:    --- Imports
use super::model::{Item, ItemStatus, TransferOutcome};
use crate::error::{DbResultExt, TradeError, TradeResult};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use tracing::{debug, info, warn};
// endregion: --- Imports

// region:    --- Row Lock
/// 상품 행 잠금 후 조회
pub async fn lock_item(conn: &mut PgConnection, item_id: i64) -> TradeResult<Item> {
    sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = $1 FOR UPDATE")
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await
        .db_context("lock_item", item_id)?
        .ok_or_else(|| TradeError::not_found("item", item_id))
}

/// 여러 상품을 id 오름차순으로 잠근다 (교착 방지)
pub async fn lock_items(conn: &mut PgConnection, item_ids: &[i64]) -> TradeResult<Vec<Item>> {
    let mut ids = item_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        items.push(lock_item(conn, id).await?);
    }
    Ok(items)
}

/// 존재하는 상품만 id 오름차순으로 잠근다. 없는 id 는 호출자가 판단한다.
pub async fn lock_existing_items(
    conn: &mut PgConnection,
    item_ids: &[i64],
) -> TradeResult<Vec<Item>> {
    let mut ids = item_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .db_context("lock_items", ids.first().copied().unwrap_or(0))
}

fn lost_race(item: &Item) -> TradeError {
    warn!(
        "{:<12} --> 버전 충돌: item={} version={}",
        "Inventory", item.id, item.version
    );
    TradeError::Conflict(format!(
        "상품 {}이(가) 다른 요청에 의해 변경되었습니다 (version {})",
        item.id, item.version
    ))
}
// endregion: --- Row Lock

// region:    --- Commands
/// 예약 시간 상한 (30일)
pub const MAX_RESERVATION_MINUTES: i64 = 60 * 24 * 30;

/// 예약 만료 시각 계산
fn reservation_deadline(now: DateTime<Utc>, duration_minutes: i64) -> TradeResult<DateTime<Utc>> {
    if !(1..=MAX_RESERVATION_MINUTES).contains(&duration_minutes) {
        return Err(TradeError::Validation(format!(
            "예약 시간은 1분에서 {}분 사이여야 합니다: {}",
            MAX_RESERVATION_MINUTES, duration_minutes
        )));
    }
    now.checked_add_signed(Duration::minutes(duration_minutes))
        .ok_or_else(|| TradeError::Validation("예약 만료 시각이 범위를 벗어났습니다.".to_string()))
}

/// 1. 예약
pub async fn reserve(
    conn: &mut PgConnection,
    item_id: i64,
    user_id: i64,
    duration_minutes: i64,
    now: DateTime<Utc>,
) -> TradeResult<Item> {
    let reserved_until = reservation_deadline(now, duration_minutes)?;

    let item = lock_item(conn, item_id).await?;
    if item.owner_id == user_id {
        return Err(TradeError::Validation(
            "자신의 상품은 예약할 수 없습니다.".to_string(),
        ));
    }
    if item.has_live_reservation(now) {
        return Err(TradeError::Conflict(format!(
            "상품 {}은(는) 이미 예약되어 있습니다.",
            item_id
        )));
    }
    if !item.is_available(now) {
        return Err(TradeError::InvalidState(format!(
            "상품 {}은(는) 예약할 수 없는 상태입니다: {}",
            item_id, item.status
        )));
    }

    let updated = sqlx::query_as::<_, Item>(
        "UPDATE items
         SET status = 'reserved', reserved_until = $3, reserved_by = $4,
             version = version + 1, updated_at = NOW()
         WHERE id = $1 AND version = $2 AND status IN ('available', 'reserved')
         RETURNING *",
    )
    .bind(item_id)
    .bind(item.version)
    .bind(reserved_until)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .db_context("reserve_item", item_id)?
    .ok_or_else(|| lost_race(&item))?;

    info!(
        "{:<12} --> 예약 완료: item={} user={} until={}",
        "Inventory", item_id, user_id, reserved_until
    );
    Ok(updated)
}

/// 2. 즉시 판매
/// 경쟁에 관대하지 않다: 동시에 여러 구매가 들어오면 하나만 성공한다.
pub async fn complete_sale(
    conn: &mut PgConnection,
    item_id: i64,
    buyer_id: i64,
    now: DateTime<Utc>,
) -> TradeResult<Item> {
    let item = lock_item(conn, item_id).await?;
    if item.owner_id == buyer_id {
        return Err(TradeError::Validation(
            "자신의 상품은 구매할 수 없습니다.".to_string(),
        ));
    }

    match item.status {
        ItemStatus::Traded => {
            return Err(TradeError::Conflict(format!(
                "상품 {}은(는) 이미 판매되었습니다.",
                item_id
            )))
        }
        ItemStatus::Locked => {
            return Err(TradeError::InvalidState(format!(
                "상품 {}은(는) 진행 중인 거래에 묶여 있습니다.",
                item_id
            )))
        }
        _ if item.has_live_reservation(now) && item.reserved_by != Some(buyer_id) => {
            return Err(TradeError::Conflict(format!(
                "상품 {}은(는) 다른 사용자가 예약 중입니다.",
                item_id
            )))
        }
        _ => {}
    }

    let sold = sqlx::query_as::<_, Item>(
        "UPDATE items
         SET status = 'traded', reserved_until = NULL, reserved_by = NULL,
             version = version + 1, updated_at = NOW()
         WHERE id = $1 AND version = $2 AND status IN ('available', 'reserved')
         RETURNING *",
    )
    .bind(item_id)
    .bind(item.version)
    .fetch_optional(&mut *conn)
    .await
    .db_context("complete_sale", item_id)?
    .ok_or_else(|| lost_race(&item))?;

    info!(
        "{:<12} --> 판매 완료: item={} buyer={} version={}",
        "Inventory", item_id, buyer_id, sold.version
    );
    Ok(sold)
}

/// 3-1. 거래 수락 시 상품 잠금
pub async fn lock_for_trade(
    conn: &mut PgConnection,
    item_id: i64,
    trade_id: i64,
    now: DateTime<Utc>,
) -> TradeResult<Item> {
    let item = lock_item(conn, item_id).await?;
    if item.is_locked_by(trade_id) {
        return Ok(item);
    }
    if !item.is_available(now) {
        return Err(TradeError::InvalidState(format!(
            "상품 {}은(는) 거래할 수 없는 상태입니다: {}",
            item_id, item.status
        )));
    }

    let locked = sqlx::query_as::<_, Item>(
        "UPDATE items
         SET status = 'locked', locked_by_trade_id = $3, reserved_until = NULL, reserved_by = NULL,
             version = version + 1, updated_at = NOW()
         WHERE id = $1 AND version = $2 AND status IN ('available', 'reserved')
         RETURNING *",
    )
    .bind(item_id)
    .bind(item.version)
    .bind(trade_id)
    .fetch_optional(&mut *conn)
    .await
    .db_context("lock_for_trade", item_id)?
    .ok_or_else(|| lost_race(&item))?;

    debug!(
        "{:<12} --> 거래 잠금: item={} trade={}",
        "Inventory", item_id, trade_id
    );
    Ok(locked)
}

/// 3-2. 거래 잠금 해제
/// 해당 거래가 잡은 잠금이 아니면 아무것도 하지 않는다.
pub async fn release_trade_lock(
    conn: &mut PgConnection,
    item_id: i64,
    trade_id: i64,
) -> TradeResult<Option<Item>> {
    let item = lock_item(conn, item_id).await?;
    if !item.is_locked_by(trade_id) {
        return Ok(None);
    }

    let released = sqlx::query_as::<_, Item>(
        "UPDATE items
         SET status = 'available', locked_by_trade_id = NULL,
             version = version + 1, updated_at = NOW()
         WHERE id = $1 AND version = $2 AND status = 'locked'
         RETURNING *",
    )
    .bind(item_id)
    .bind(item.version)
    .fetch_optional(&mut *conn)
    .await
    .db_context("release_trade_lock", item_id)?
    .ok_or_else(|| lost_race(&item))?;

    debug!(
        "{:<12} --> 거래 잠금 해제: item={} trade={}",
        "Inventory", item_id, trade_id
    );
    Ok(Some(released))
}

/// 4. 거래 완료 시 상품 이전
/// 이미 다른 흐름에서 옮겨진 상품은 실패가 아니라 건너뛴다 (complete_sale 과 의도적으로 다름).
pub async fn mark_transferred(
    conn: &mut PgConnection,
    item_id: i64,
    trade_id: i64,
    now: DateTime<Utc>,
) -> TradeResult<TransferOutcome> {
    let item = lock_item(conn, item_id).await?;
    if !(item.is_available(now) || item.is_locked_by(trade_id)) {
        warn!(
            "{:<12} --> 이미 이전된 상품 건너뜀: item={} status={} trade={}",
            "Inventory", item_id, item.status, trade_id
        );
        return Ok(TransferOutcome::Skipped {
            item_id,
            status: item.status,
        });
    }

    let transferred = sqlx::query_as::<_, Item>(
        "UPDATE items
         SET status = 'traded', locked_by_trade_id = NULL, reserved_until = NULL, reserved_by = NULL,
             version = version + 1, updated_at = NOW()
         WHERE id = $1 AND version = $2 AND status IN ('available', 'reserved', 'locked')
         RETURNING *",
    )
    .bind(item_id)
    .bind(item.version)
    .fetch_optional(&mut *conn)
    .await
    .db_context("mark_transferred", item_id)?
    .ok_or_else(|| lost_race(&item))?;

    Ok(TransferOutcome::Transferred(transferred))
}

/// 5. 만료 예약 정리
pub async fn cleanup_expired_reservations(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> TradeResult<u64> {
    let result = sqlx::query(
        "UPDATE items
         SET status = 'available', reserved_until = NULL, reserved_by = NULL,
             version = version + 1, updated_at = NOW()
         WHERE status = 'reserved' AND reserved_until <= $1",
    )
    .bind(now)
    .execute(&mut *conn)
    .await
    .db_context("cleanup_expired_reservations", 0)?;

    Ok(result.rows_affected())
}
// endregion: --- Commands

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_deadline_bounds() {
        let now = Utc::now();
        assert_eq!(
            reservation_deadline(now, 30).unwrap(),
            now + Duration::minutes(30)
        );
        assert!(reservation_deadline(now, MAX_RESERVATION_MINUTES).is_ok());

        for bad in [0, -1, MAX_RESERVATION_MINUTES + 1, 10_000_000_000_000, i64::MAX] {
            assert!(
                matches!(
                    reservation_deadline(now, bad),
                    Err(TradeError::Validation(_))
                ),
                "{}",
                bad
            );
        }
    }
}
