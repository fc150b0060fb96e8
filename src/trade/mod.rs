/// 물물교환 거래 엔진
/// 커맨드마다 트랜잭션 하나: 시작 -> 커맨드 실행 -> 커밋 -> 알림 큐 적재
/// 실패하면 트랜잭션이 롤백되어 거래/상품/알림 어느 것도 남지 않는다.
// region:    --- Imports
use crate::database::DatabaseManager;
use crate::error::{TradeError, TradeResult};
use crate::loop_detector::LoopDetectorHandle;
use crate::notification::NotificationDispatcher;
use crate::query;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
// endregion: --- Imports

pub mod commands;
pub mod completion;
pub mod model;
pub mod rules;

use commands::{ActOnTradeCommand, ProposeTradeCommand, RateTradeCommand};
use model::{CompletionStatus, Trade, TradeDetails, TradeEvent, TradeRating};

// region:    --- Trade Engine
pub struct TradeEngine {
    db_manager: Arc<DatabaseManager>,
    dispatcher: NotificationDispatcher,
    loop_detector: LoopDetectorHandle,
}

impl TradeEngine {
    pub fn new(
        db_manager: Arc<DatabaseManager>,
        dispatcher: NotificationDispatcher,
        loop_detector: LoopDetectorHandle,
    ) -> Self {
        Self {
            db_manager,
            dispatcher,
            loop_detector,
        }
    }

    pub fn db_manager(&self) -> &Arc<DatabaseManager> {
        &self.db_manager
    }

    /// 거래 제안. 커밋 후 순환 탐지를 요청한다.
    pub async fn propose_trade(&self, cmd: ProposeTradeCommand) -> TradeResult<TradeDetails> {
        info!(
            "{:<12} --> 거래 제안: initiator={} target={}",
            "TradeEngine", cmd.initiator_id, cmd.target_item_id
        );
        let mut tx = self.db_manager.pool().begin().await?;
        let outcome = commands::propose(&mut tx, cmd, Utc::now()).await?;
        tx.commit().await?;

        self.dispatcher.dispatch(outcome.notifications);
        self.loop_detector.trigger(outcome.value.trade.id);
        Ok(outcome.value)
    }

    /// 수락/거절/역제안/완료/취소
    pub async fn act_on_trade(&self, trade_id: i64, cmd: ActOnTradeCommand) -> TradeResult<Trade> {
        let mut tx = self.db_manager.pool().begin().await?;
        let outcome = commands::act(&mut tx, trade_id, cmd, Utc::now()).await?;
        tx.commit().await?;

        self.dispatcher.dispatch(outcome.notifications);
        Ok(outcome.value)
    }

    /// 거래 평가 (완료된 거래, 당사자당 한 번)
    pub async fn rate_trade(&self, trade_id: i64, cmd: RateTradeCommand) -> TradeResult<TradeRating> {
        let mut tx = self.db_manager.pool().begin().await?;
        let rating = commands::rate(&mut tx, trade_id, cmd).await?;
        tx.commit().await?;
        info!(
            "{:<12} --> 거래 평가 저장: trade={} rater={} score={}",
            "TradeEngine", trade_id, rating.rater_id, rating.score
        );
        Ok(rating)
    }

    pub async fn get_trade(&self, trade_id: i64) -> TradeResult<TradeDetails> {
        let trade = query::handlers::get_trade(&self.db_manager, trade_id).await?;
        let items = query::handlers::get_trade_items(&self.db_manager, trade_id).await?;
        Ok(TradeDetails { trade, items })
    }

    /// 완료 확인 상태. 완료된 거래는 평가도 함께 돌려준다.
    pub async fn get_completion_status(&self, trade_id: i64) -> TradeResult<CompletionStatus> {
        let trade = query::handlers::get_trade(&self.db_manager, trade_id).await?;
        let ratings = if trade.status.is_success() {
            Some(query::handlers::get_trade_ratings(&self.db_manager, trade_id).await?)
        } else {
            None
        };
        Ok(CompletionStatus {
            trade_id: trade.id,
            status: trade.status,
            initiator_completed: trade.initiator_completed,
            counterparty_completed: trade.counterparty_completed,
            ratings,
        })
    }

    /// 거래 감사 로그
    pub async fn trade_history(&self, trade_id: i64) -> TradeResult<Vec<TradeEvent>> {
        let events = query::handlers::get_trade_events(&self.db_manager, trade_id).await?;
        if events.is_empty() {
            // 모든 거래는 생성 이벤트를 가지므로 비어 있으면 없는 거래
            return Err(TradeError::not_found("trade", trade_id));
        }
        Ok(events)
    }
}
// endregion: --- Trade Engine
