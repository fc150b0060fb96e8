/// 상품 조회
pub const GET_ITEM: &str = "SELECT * FROM items WHERE id = $1";

/// 거래 조회
pub const GET_TRADE: &str = "SELECT * FROM trades WHERE id = $1";

/// 거래 상품 조회
pub const GET_TRADE_ITEMS: &str = r#"
    SELECT trade_id, item_id, offered_by
    FROM trade_items
    WHERE trade_id = $1
    ORDER BY item_id
"#;

/// 거래 감사 로그 조회
pub const GET_TRADE_EVENTS: &str = r#"
    SELECT id, trade_id, actor_id, from_status, to_status, note, created_at
    FROM trade_events
    WHERE trade_id = $1
    ORDER BY id ASC
"#;

/// 거래 평가 조회
pub const GET_TRADE_RATINGS: &str = r#"
    SELECT trade_id, rater_id, ratee_id, score, comment, created_at
    FROM trade_ratings
    WHERE trade_id = $1
    ORDER BY created_at ASC
"#;

/// 사용자 알림 조회
pub const GET_USER_NOTIFICATIONS: &str = r#"
    SELECT id, user_id, trade_id, kind, message, payload, created_at
    FROM notifications
    WHERE user_id = $1
    ORDER BY id DESC
    LIMIT $2
"#;

/// 진행 중인 거래 간선 (제안자 -> 상대방)
pub const GET_LIVE_TRADE_EDGES: &str = r#"
    SELECT DISTINCT initiator_id, counterparty_id
    FROM trades
    WHERE status IN ('pending', 'countered', 'active')
"#;

/// 자동 완료 대상 거래
pub const GET_STALLED_TRADE_IDS: &str = r#"
    SELECT id
    FROM trades
    WHERE status = 'awaiting_confirmation'
      AND initiator_completed <> counterparty_completed
      AND awaiting_confirmation_since <= $1
    ORDER BY awaiting_confirmation_since ASC
"#;
