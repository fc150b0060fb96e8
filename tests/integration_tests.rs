use barter_service::config::AppConfig;
use barter_service::database::DatabaseManager;
use barter_service::error::TradeError;
use barter_service::handlers::{self, AppState};
use barter_service::inventory::{InventoryManager, Item, ItemStatus};
use barter_service::loop_detector::{self, LoopDetectorConfig, LoopScanner};
use barter_service::notification::{
    EventPublisher, Notification, NotificationDispatcher, NotificationHub, NotificationKind,
};
use barter_service::query;
use barter_service::scheduler::TradeScheduler;
use barter_service::trade::commands::{
    ActOnTradeCommand, ActionPayload, ProposeTradeCommand, RateTradeCommand,
};
use barter_service::trade::completion::{self, CompletionMode, TradeCompletion};
use barter_service::trade::model::{TradeAction, TradeStatus};
use barter_service::trade::TradeEngine;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::warn;

// region:    --- Test Setup

/// 트레이싱 초기화
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .without_time()
        .with_target(false)
        .with_test_writer()
        .try_init();
}

struct TestContext {
    db_manager: Arc<DatabaseManager>,
    engine: Arc<TradeEngine>,
    inventory: Arc<InventoryManager>,
    hub: NotificationHub,
    dispatcher: NotificationDispatcher,
}

/// DATABASE_URL 이 없으면 None (테스트 건너뜀). CI 에서는 실패한다.
async fn setup() -> Option<TestContext> {
    init_tracing();
    dotenvy::dotenv().ok();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            if std::env::var_os("CI").is_some() {
                panic!("CI 에서는 DB 테스트를 건너뛸 수 없음: {}", e);
            }
            warn!("{:<12} --> DB 테스트 건너뜀: {}", "Test", e);
            return None;
        }
    };

    let db_manager = Arc::new(
        DatabaseManager::new(&config)
            .await
            .expect("데이터베이스 연결 실패"),
    );
    db_manager
        .initialize_database(false)
        .await
        .expect("스키마 초기화 실패");

    let hub = NotificationHub::new();
    let dispatcher = NotificationDispatcher::spawn(Arc::new(hub.clone()));
    let engine = Arc::new(new_engine(&db_manager, dispatcher.clone()));
    let inventory = Arc::new(InventoryManager::new(Arc::clone(&db_manager)));

    Some(TestContext {
        db_manager,
        engine,
        inventory,
        hub,
        dispatcher,
    })
}

/// 워커 없이 핸들만 사용: 순환 탐지는 테스트에서 직접 실행
fn new_engine(db_manager: &Arc<DatabaseManager>, dispatcher: NotificationDispatcher) -> TradeEngine {
    let (loop_handle, _) = loop_detector::channel(8);
    TradeEngine::new(Arc::clone(db_manager), dispatcher, loop_handle)
}

/// 실행마다 겹치지 않는 사용자 id
fn new_user_id() -> i64 {
    static SEQ: AtomicI64 = AtomicI64::new(0);
    Utc::now().timestamp_micros() * 1000 + SEQ.fetch_add(1, Ordering::SeqCst) % 1000
}

/// 테스트용 상품 생성
async fn create_test_item(db_manager: &DatabaseManager, owner_id: i64, title: &str) -> Item {
    sqlx::query_as::<_, Item>("INSERT INTO items (owner_id, title) VALUES ($1, $2) RETURNING *")
        .bind(owner_id)
        .bind(title)
        .fetch_one(db_manager.pool())
        .await
        .expect("테스트 상품 생성 실패")
}

async fn get_item(db_manager: &DatabaseManager, item_id: i64) -> Item {
    query::handlers::get_item(db_manager, item_id)
        .await
        .expect("상품 조회 실패")
}

fn propose(initiator_id: i64, target_item_id: i64, offered: Vec<i64>) -> ProposeTradeCommand {
    ProposeTradeCommand {
        initiator_id,
        target_item_id,
        offered_item_ids: offered,
        cash_amount: None,
        message: None,
    }
}

fn action(actor_id: i64, action: TradeAction) -> ActOnTradeCommand {
    ActOnTradeCommand {
        actor_id,
        action,
        payload: ActionPayload::default(),
    }
}

// endregion: --- Test Setup

// region:    --- Inventory

/// 동시 판매: 하나만 성공
#[tokio::test]
async fn test_concurrent_complete_sale() {
    let Some(ctx) = setup().await else { return };
    let seller = new_user_id();
    let item = create_test_item(&ctx.db_manager, seller, "동시 판매 상품").await;

    let item_id = item.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let inventory = Arc::clone(&ctx.inventory);
        let buyer = new_user_id();
        handles.push(tokio::spawn(async move {
            inventory.complete_sale(item_id, buyer).await
        }));
    }

    let mut succeeded = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => succeeded += 1,
            Err(TradeError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("예상하지 못한 오류: {:?}", e),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(conflicts, 7);

    let sold = get_item(&ctx.db_manager, item.id).await;
    assert_eq!(sold.status, ItemStatus::Traded);
    assert_eq!(sold.version, 2);
}

/// 예약: 성공 시에만 version 증가
#[tokio::test]
async fn test_reserve_bumps_version_only_on_success() {
    let Some(ctx) = setup().await else { return };
    let owner = new_user_id();
    let item = create_test_item(&ctx.db_manager, owner, "예약 상품").await;
    assert_eq!(item.version, 1);

    // 범위를 벗어난 기간은 상품을 건드리지 않고 거부
    for minutes in [0, 10_000_000_000_000, i64::MAX] {
        let err = ctx
            .inventory
            .reserve(item.id, new_user_id(), minutes)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::Validation(_)));
    }
    assert_eq!(get_item(&ctx.db_manager, item.id).await.version, 1);

    let first = new_user_id();
    let reserved = ctx.inventory.reserve(item.id, first, 30).await.unwrap();
    assert_eq!(reserved.status, ItemStatus::Reserved);
    assert_eq!(reserved.reserved_by, Some(first));
    assert_eq!(reserved.version, 2);

    let second = new_user_id();
    let err = ctx.inventory.reserve(item.id, second, 30).await.unwrap_err();
    assert!(matches!(err, TradeError::Conflict(_)));

    // 다른 사용자는 예약 중인 상품을 살 수 없고, 예약자는 살 수 있다
    let err = ctx.inventory.complete_sale(item.id, second).await.unwrap_err();
    assert!(matches!(err, TradeError::Conflict(_)));
    assert_eq!(get_item(&ctx.db_manager, item.id).await.version, 2);

    let sold = ctx.inventory.complete_sale(item.id, first).await.unwrap();
    assert_eq!(sold.status, ItemStatus::Traded);
    assert_eq!(sold.version, 3);

    let err = ctx.inventory.reserve(item.id, second, 30).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
}

/// 만료된 예약 정리
#[tokio::test]
async fn test_expired_reservation_cleanup() {
    let Some(ctx) = setup().await else { return };
    let item = create_test_item(&ctx.db_manager, new_user_id(), "만료 예약 상품").await;
    ctx.inventory
        .reserve(item.id, new_user_id(), 10)
        .await
        .unwrap();

    sqlx::query("UPDATE items SET reserved_until = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(item.id)
        .execute(ctx.db_manager.pool())
        .await
        .unwrap();

    // 다른 테스트의 스케줄러가 먼저 정리했을 수도 있어 건수는 보지 않는다
    ctx.inventory.cleanup_expired_reservations().await.unwrap();
    let item = get_item(&ctx.db_manager, item.id).await;
    assert_eq!(item.status, ItemStatus::Available);
    assert_eq!(item.reserved_by, None);
    assert_eq!(item.version, 3);
}

// endregion: --- Inventory

// region:    --- Trade Flow

/// X(A), Y(B): B 가 X 에 Y 를 제안 -> A 수락 -> A 완료 -> B 완료
#[tokio::test]
async fn test_dual_completion_scenario() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let x = create_test_item(&ctx.db_manager, user_a, "X").await;
    let y = create_test_item(&ctx.db_manager, user_b, "Y").await;
    let mut inbox_a = ctx.hub.subscribe(user_a).await;

    let details = ctx
        .engine
        .propose_trade(propose(user_b, x.id, vec![y.id]))
        .await
        .unwrap();
    let trade_id = details.trade.id;
    assert_eq!(details.trade.status, TradeStatus::Pending);
    assert_eq!(details.trade.initiator_id, user_b);
    assert_eq!(details.trade.counterparty_id, user_a);
    assert_eq!(details.items.len(), 1);

    let proposed = inbox_a.recv().await.unwrap();
    assert_eq!(proposed.kind, NotificationKind::TradeProposed);
    assert_eq!(proposed.trade_id, Some(trade_id));

    // 제안자는 자신의 제안을 수락할 수 없다
    let err = ctx
        .engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Accept))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Forbidden(_)));

    let trade = ctx
        .engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Accept))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::Active);
    for item_id in [x.id, y.id] {
        let item = get_item(&ctx.db_manager, item_id).await;
        assert_eq!(item.status, ItemStatus::Locked);
        assert_eq!(item.locked_by_trade_id, Some(trade_id));
        assert_eq!(item.version, 2);
    }

    let trade = ctx
        .engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Complete))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::AwaitingConfirmation);
    assert!(trade.counterparty_completed);
    assert!(!trade.initiator_completed);
    assert!(trade.awaiting_confirmation_since.is_some());

    // 같은 쪽의 두 번째 완료 요청은 거부
    let err = ctx
        .engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Complete))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    let trade = ctx
        .engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Complete))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::Completed);
    assert!(trade.completed_at.is_some());
    for item_id in [x.id, y.id] {
        let item = get_item(&ctx.db_manager, item_id).await;
        assert_eq!(item.status, ItemStatus::Traded);
        assert_eq!(item.locked_by_trade_id, None);
        assert_eq!(item.version, 3);
    }

    // 완료된 거래는 더 이상 변경할 수 없다
    let err = ctx
        .engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Conflict(_)));

    let history = ctx.engine.trade_history(trade_id).await.unwrap();
    let statuses: Vec<TradeStatus> = history.iter().map(|e| e.to_status).collect();
    assert_eq!(
        statuses,
        vec![
            TradeStatus::Pending,
            TradeStatus::Active,
            TradeStatus::AwaitingConfirmation,
            TradeStatus::Completed,
        ]
    );
}

/// 거절/취소 후 상품은 모두 available
#[tokio::test]
async fn test_decline_and_cancel_release_items() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안").await;

    // pending 상태에서 거절
    let declined = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap();
    let trade = ctx
        .engine
        .act_on_trade(declined.trade.id, action(user_a, TradeAction::Decline))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::Declined);

    // active 상태에서 제안자가 취소
    let cancelled = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap();
    let trade_id = cancelled.trade.id;
    ctx.engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Accept))
        .await
        .unwrap();
    let trade = ctx
        .engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Cancel))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::Cancelled);

    for item_id in [target.id, offered.id] {
        let item = get_item(&ctx.db_manager, item_id).await;
        assert_eq!(item.status, ItemStatus::Available);
        assert_eq!(item.locked_by_trade_id, None);
        // 잠금 1회 + 해제 1회
        assert_eq!(item.version, 3);
    }

    let err = ctx
        .engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Accept))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));
}

/// 판매된 상품으로는 거래를 제안할 수 없고 거래 행도 남지 않는다
#[tokio::test]
async fn test_proposal_on_traded_item_is_rejected() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "판매된 상품").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안 상품").await;
    ctx.inventory
        .complete_sale(target.id, new_user_id())
        .await
        .unwrap();

    let err = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE target_item_id = $1")
        .bind(target.id)
        .fetch_one(ctx.db_manager.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);

    let notified: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = $1")
        .bind(user_a)
        .fetch_one(ctx.db_manager.pool())
        .await
        .unwrap();
    assert_eq!(notified, 0);

    // 대상 상품 상태가 제안 상품 존재 여부보다 먼저 검사된다
    let err = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![i64::MAX]))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    // 남의 상품을 제안 상품으로 넣을 수 없다
    let other = create_test_item(&ctx.db_manager, user_a, "다른 상품").await;
    let err = ctx
        .engine
        .propose_trade(propose(user_b, other.id, vec![target.id]))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Forbidden(_)));
}

/// 역제안은 응답 차례를 넘긴다
#[tokio::test]
async fn test_counter_flips_responder() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let first_offer = create_test_item(&ctx.db_manager, user_b, "첫 제안").await;
    let second_offer = create_test_item(&ctx.db_manager, user_b, "두 번째 제안").await;

    let details = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![first_offer.id]))
        .await
        .unwrap();
    let trade_id = details.trade.id;
    assert_eq!(details.trade.awaiting_response_from, Some(user_a));

    let counter = ActOnTradeCommand {
        actor_id: user_a,
        action: TradeAction::Counter,
        payload: ActionPayload {
            offered_item_ids: vec![first_offer.id, second_offer.id],
            cash_amount: Some(5000),
            note: Some("둘 다 주세요".to_string()),
        },
    };
    let trade = ctx.engine.act_on_trade(trade_id, counter).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Countered);
    assert_eq!(trade.awaiting_response_from, Some(user_b));
    assert_eq!(trade.offered_cash_amount, Some(5000));

    // 이제 A 는 응답할 차례가 아니다
    let err = ctx
        .engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Accept))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Forbidden(_)));

    let trade = ctx
        .engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Accept))
        .await
        .unwrap();
    assert_eq!(trade.status, TradeStatus::Active);

    let details = ctx.engine.get_trade(trade_id).await.unwrap();
    let item_ids: Vec<i64> = details.items.iter().map(|i| i.item_id).collect();
    assert_eq!(item_ids.len(), 2);
    assert!(item_ids.contains(&second_offer.id));
    assert_eq!(
        get_item(&ctx.db_manager, second_offer.id).await.status,
        ItemStatus::Locked
    );
}

// endregion: --- Trade Flow

// region:    --- Completion

/// 한쪽만 완료한 채 유예 시간이 지나면 스케줄러가 자동 완료
#[tokio::test]
async fn test_scheduler_auto_completes_stalled_trade() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안").await;

    let trade_id = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap()
        .trade
        .id;
    ctx.engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Accept))
        .await
        .unwrap();
    ctx.engine
        .act_on_trade(trade_id, action(user_b, TradeAction::Complete))
        .await
        .unwrap();

    let scheduler = TradeScheduler::new(
        Arc::clone(&ctx.db_manager),
        ctx.dispatcher.clone(),
        Duration::from_secs(60),
        chrono::Duration::hours(24),
    );

    // 유예 시간 전: 그대로
    scheduler.run_once().await.unwrap();
    let status = ctx.engine.get_completion_status(trade_id).await.unwrap();
    assert_eq!(status.status, TradeStatus::AwaitingConfirmation);
    assert!(status.ratings.is_none());

    sqlx::query(
        "UPDATE trades SET awaiting_confirmation_since = NOW() - INTERVAL '2 days' WHERE id = $1",
    )
    .bind(trade_id)
    .execute(ctx.db_manager.pool())
    .await
    .unwrap();

    let completed = scheduler.run_once().await.unwrap();
    assert!(completed >= 1);

    let status = ctx.engine.get_completion_status(trade_id).await.unwrap();
    assert_eq!(status.status, TradeStatus::AutoCompleted);
    assert!(status.initiator_completed);
    assert!(!status.counterparty_completed);
    assert_eq!(status.ratings.map(|r| r.len()), Some(0));

    for item_id in [target.id, offered.id] {
        assert_eq!(
            get_item(&ctx.db_manager, item_id).await.status,
            ItemStatus::Traded
        );
    }

    // 두 번 실행해도 다시 처리되지 않는다
    scheduler.run_once().await.unwrap();
    let history = ctx.engine.trade_history(trade_id).await.unwrap();
    let auto_events = history
        .iter()
        .filter(|e| e.to_status == TradeStatus::AutoCompleted)
        .count();
    assert_eq!(auto_events, 1);
    assert!(history.last().is_some_and(|e| e.actor_id.is_none()));
}

/// 평가는 완료된 거래의 당사자만, 한 번씩
#[tokio::test]
async fn test_rating_rules() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안").await;

    let trade_id = ctx
        .engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap()
        .trade
        .id;

    let rating = |rater_id: i64, score: i16| RateTradeCommand {
        rater_id,
        score,
        comment: None,
    };

    let err = ctx
        .engine
        .rate_trade(trade_id, rating(user_a, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::InvalidState(_)));

    for (actor, act) in [
        (user_a, TradeAction::Accept),
        (user_a, TradeAction::Complete),
        (user_b, TradeAction::Complete),
    ] {
        ctx.engine
            .act_on_trade(trade_id, action(actor, act))
            .await
            .unwrap();
    }

    let err = ctx
        .engine
        .rate_trade(trade_id, rating(user_a, 6))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    let err = ctx
        .engine
        .rate_trade(trade_id, rating(new_user_id(), 4))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Forbidden(_)));

    let stored = ctx
        .engine
        .rate_trade(trade_id, rating(user_a, 5))
        .await
        .unwrap();
    assert_eq!(stored.ratee_id, user_b);

    let err = ctx
        .engine
        .rate_trade(trade_id, rating(user_a, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Conflict(_)));

    let status = ctx.engine.get_completion_status(trade_id).await.unwrap();
    assert_eq!(status.status, TradeStatus::Completed);
    assert_eq!(status.ratings.map(|r| r.len()), Some(1));
}

/// 이미 다른 흐름에서 옮겨진 상품은 건너뛰고 나머지는 이전
#[tokio::test]
async fn test_completion_skips_already_transferred_item() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안").await;

    let trade_id = accepted_trade(&ctx, user_a, user_b, target.id, vec![offered.id]).await;
    mark_both_completed(&ctx.db_manager, trade_id).await;

    // 거래 잠금을 우회해 제안 상품이 먼저 이전된 상황
    sqlx::query("UPDATE items SET status = 'traded', locked_by_trade_id = NULL WHERE id = $1")
        .bind(offered.id)
        .execute(ctx.db_manager.pool())
        .await
        .unwrap();

    let outcome = TradeCompletion::run(
        &ctx.db_manager,
        trade_id,
        CompletionMode::Dual { actor_id: user_a },
    )
    .await
    .unwrap();
    assert_eq!(outcome.trade.status, TradeStatus::Completed);
    assert_eq!(outcome.skipped, vec![offered.id]);
    let transferred: Vec<i64> = outcome.transferred.iter().map(|item| item.id).collect();
    assert_eq!(transferred, vec![target.id]);

    let target = get_item(&ctx.db_manager, target.id).await;
    assert_eq!(target.status, ItemStatus::Traded);
    assert_eq!(target.version, 3);
    // 건너뛴 상품은 version 이 오르지 않는다
    assert_eq!(get_item(&ctx.db_manager, offered.id).await.version, 2);

    let completed = outcome
        .notifications
        .iter()
        .find(|n| n.user_id == user_b)
        .unwrap();
    assert_eq!(completed.payload["skipped_item_ids"], json!([offered.id]));
}

/// 완료 트랜잭션이 중간에 실패하면 상품 K+1 개와 거래 모두 그대로
#[tokio::test]
async fn test_failed_completion_rolls_back_every_item() {
    let Some(ctx) = setup().await else { return };
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let first = create_test_item(&ctx.db_manager, user_b, "제안 1").await;
    let second = create_test_item(&ctx.db_manager, user_b, "제안 2").await;
    let all_items = [target.id, first.id, second.id];

    let trade_id = accepted_trade(&ctx, user_a, user_b, target.id, vec![first.id, second.id]).await;
    mark_both_completed(&ctx.db_manager, trade_id).await;

    let result: Result<(), TradeError> = ctx
        .db_manager
        .transaction(|tx| {
            Box::pin(async move {
                let outcome = completion::complete_trade(
                    &mut **tx,
                    trade_id,
                    CompletionMode::Dual { actor_id: user_a },
                    Utc::now(),
                )
                .await?;
                assert_eq!(outcome.transferred.len(), 3);
                // 이전이 끝난 뒤 같은 트랜잭션의 후속 단계가 실패
                Err(TradeError::Conflict("후속 단계 실패".to_string()))
            })
        })
        .await;
    assert!(matches!(result, Err(TradeError::Conflict(_))));

    for item_id in all_items {
        let item = get_item(&ctx.db_manager, item_id).await;
        assert_eq!(item.status, ItemStatus::Locked);
        assert_eq!(item.locked_by_trade_id, Some(trade_id));
        assert_eq!(item.version, 2);
    }
    let status = ctx.engine.get_completion_status(trade_id).await.unwrap();
    assert_eq!(status.status, TradeStatus::Active);
    let history = ctx.engine.trade_history(trade_id).await.unwrap();
    assert!(history.iter().all(|e| e.to_status != TradeStatus::Completed));

    // 같은 거래는 다시 완료할 수 있다
    let outcome = TradeCompletion::run(
        &ctx.db_manager,
        trade_id,
        CompletionMode::Dual { actor_id: user_a },
    )
    .await
    .unwrap();
    assert_eq!(outcome.transferred.len(), 3);
}

/// 제안 후 수락까지 마친 거래
async fn accepted_trade(
    ctx: &TestContext,
    counterparty: i64,
    initiator: i64,
    target_item_id: i64,
    offered: Vec<i64>,
) -> i64 {
    let trade_id = ctx
        .engine
        .propose_trade(propose(initiator, target_item_id, offered))
        .await
        .unwrap()
        .trade
        .id;
    ctx.engine
        .act_on_trade(trade_id, action(counterparty, TradeAction::Accept))
        .await
        .unwrap();
    trade_id
}

/// 스케줄러 대상이 되지 않도록 양쪽 확인 플래그를 함께 세운다
async fn mark_both_completed(db_manager: &DatabaseManager, trade_id: i64) {
    sqlx::query(
        "UPDATE trades SET initiator_completed = TRUE, counterparty_completed = TRUE WHERE id = $1",
    )
    .bind(trade_id)
    .execute(db_manager.pool())
    .await
    .unwrap();
}

// endregion: --- Completion

// region:    --- Database

/// 클로저 오류는 그대로 돌려받는다
#[tokio::test]
async fn test_transaction_returns_closure_error() {
    let Some(ctx) = setup().await else { return };
    let result: Result<(), TradeError> = ctx
        .db_manager
        .transaction(|_tx| {
            Box::pin(async { Err(TradeError::Validation("잘못된 입력".to_string())) })
        })
        .await;
    match result {
        Err(TradeError::Validation(message)) => assert_eq!(message, "잘못된 입력"),
        other => panic!("예상하지 못한 결과: {:?}", other),
    }
}

// endregion: --- Database

// region:    --- Notification Delivery

struct SlowPublisher;

#[async_trait]
impl EventPublisher for SlowPublisher {
    async fn publish(&self, _notification: &Notification) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(())
    }
}

/// 느린 브로커가 요청 응답을 늦추지 않는다
#[tokio::test]
async fn test_slow_publisher_does_not_block_commands() {
    let Some(ctx) = setup().await else { return };
    let engine = new_engine(
        &ctx.db_manager,
        NotificationDispatcher::spawn(Arc::new(SlowPublisher)),
    );
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "제안").await;

    let started = Instant::now();
    let trade_id = engine
        .propose_trade(propose(user_b, target.id, vec![offered.id]))
        .await
        .unwrap()
        .trade
        .id;
    engine
        .act_on_trade(trade_id, action(user_a, TradeAction::Decline))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    // 알림은 커밋과 함께 저장되어 있다
    let notifications = query::handlers::get_user_notifications(&ctx.db_manager, user_a, 10)
        .await
        .unwrap();
    assert!(notifications
        .iter()
        .any(|n| n.kind == NotificationKind::TradeProposed));
}

// endregion: --- Notification Delivery

// region:    --- Loop Detection

/// A->B, B->C, C->A 제안이 있으면 세 명 모두 한 번씩 알림
#[tokio::test]
async fn test_three_party_loop_notifies_each_member() {
    let Some(ctx) = setup().await else { return };
    let users = [new_user_id(), new_user_id(), new_user_id()];
    let mut items = Vec::new();
    for user in users {
        items.push(create_test_item(&ctx.db_manager, user, "순환 상품").await);
    }

    // users[i] 가 users[i+1] 의 상품을 원한다
    let mut trade_ids = Vec::new();
    for i in 0..3 {
        let next = (i + 1) % 3;
        let details = ctx
            .engine
            .propose_trade(propose(users[i], items[next].id, vec![items[i].id]))
            .await
            .unwrap();
        trade_ids.push(details.trade.id);
    }

    let scanner = LoopScanner::new(
        Arc::clone(&ctx.db_manager),
        Arc::new(ctx.hub.clone()),
        LoopDetectorConfig::default(),
    );
    let loops = scanner.scan_once().await.unwrap();

    let mut expected = users.to_vec();
    expected.sort_unstable();
    let found = loops.iter().filter(|l| l.members == expected).count();
    assert_eq!(found, 1);

    for user in users {
        let notifications = query::handlers::get_user_notifications(&ctx.db_manager, user, 50)
            .await
            .unwrap();
        let loop_notes = notifications
            .iter()
            .filter(|n| n.kind == NotificationKind::TradeLoop)
            .count();
        assert_eq!(loop_notes, 1);
    }

    // 순환이 다음 실행에 남지 않도록 정리
    for (i, trade_id) in trade_ids.into_iter().enumerate() {
        ctx.engine
            .act_on_trade(trade_id, action(users[i], TradeAction::Cancel))
            .await
            .unwrap();
    }
}

// endregion: --- Loop Detection

// region:    --- HTTP

/// 라우터를 임시 포트로 띄우고 HTTP 로 호출
#[tokio::test]
async fn test_http_surface() {
    let Some(ctx) = setup().await else { return };
    let state = AppState {
        trade_engine: Arc::clone(&ctx.engine),
        inventory: Arc::clone(&ctx.inventory),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, handlers::router(state).into_make_service())
            .await
            .unwrap();
    });

    let client = Client::new();
    let user_a = new_user_id();
    let user_b = new_user_id();
    let target = create_test_item(&ctx.db_manager, user_a, "HTTP 대상").await;
    let offered = create_test_item(&ctx.db_manager, user_b, "HTTP 제안").await;

    let response = client
        .post(format!("{}/trades", base))
        .json(&json!({
            "initiator_id": user_b,
            "target_item_id": target.id,
            "offered_item_ids": [offered.id],
            "message": "교환하실래요?"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let trade_id = body["id"].as_i64().unwrap();

    // 당사자가 아닌 사용자의 액션
    let response = client
        .post(format!("{}/trades/{}/actions", base, trade_id))
        .json(&json!({ "actor_id": new_user_id(), "action": "accept" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "FORBIDDEN");

    let response = client
        .post(format!("{}/trades/{}/actions", base, trade_id))
        .json(&json!({ "actor_id": user_a, "action": "accept" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 잠긴 상품은 구매 불가
    let response = client
        .post(format!("{}/items/{}/purchase", base, target.id))
        .json(&json!({ "buyer_id": new_user_id() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = client
        .get(format!("{}/items/{}", base, target.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "locked");

    let response = client
        .get(format!("{}/trades/{}/completion", base, trade_id))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "active");
    assert!(body.get("ratings").is_none());

    let response = client
        .get(format!("{}/trades/{}/events", base, trade_id))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body.as_array().map(|events| events.len()), Some(2));

    let response = client
        .get(format!("{}/users/{}/notifications", base, user_a))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body[0]["kind"], "trade_proposed");

    let response = client
        .get(format!("{}/trades/{}", base, i64::MAX))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    let response = client
        .post(format!("{}/items/{}/reserve", base, offered.id))
        .json(&json!({ "user_id": user_a, "duration_minutes": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(format!("{}/items/{}/reserve", base, offered.id))
        .json(&json!({ "user_id": user_a, "duration_minutes": 10_000_000_000_000_i64 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// endregion: --- HTTP
