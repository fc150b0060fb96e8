/// 거래 자동 완료 스케줄러
/// 한쪽만 완료를 확인한 채 유예 시간이 지난 거래를 auto_completed 로 옮긴다.
/// 거래마다 별도 트랜잭션이라 하나가 실패해도 나머지는 계속 처리한다.
/// 같은 주기에 만료된 상품 예약도 정리한다.
// region:    --- Imports
use crate::database::DatabaseManager;
use crate::error::TradeResult;
use crate::inventory::InventoryManager;
use crate::notification::NotificationDispatcher;
use crate::query;
use crate::trade::completion::{CompletionMode, TradeCompletion};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

// endregion: --- Imports

// region:    --- Trade Scheduler
pub struct TradeScheduler {
    db_manager: Arc<DatabaseManager>,
    dispatcher: NotificationDispatcher,
    inventory: InventoryManager,
    period: Duration,
    grace: chrono::Duration,
}

impl TradeScheduler {
    pub fn new(
        db_manager: Arc<DatabaseManager>,
        dispatcher: NotificationDispatcher,
        period: Duration,
        grace: chrono::Duration,
    ) -> Self {
        let inventory = InventoryManager::new(Arc::clone(&db_manager));
        Self {
            db_manager,
            dispatcher,
            inventory,
            period,
            grace,
        }
    }

    /// 스케줄러 시작
    pub fn start(self) -> JoinHandle<()> {
        info!(
            "{:<12} --> 스케줄러 시작: 주기 {:?}, 유예 {}시간",
            "Scheduler",
            self.period,
            self.grace.num_hours()
        );
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(
                        "{:<12} --> 자동 완료 처리 중 오류 발생: {:?}",
                        "Scheduler", e
                    );
                }
            }
        })
    }

    /// 한 번 실행. 자동 완료된 거래 수를 돌려준다.
    pub async fn run_once(&self) -> TradeResult<usize> {
        let cutoff = Utc::now() - self.grace;
        let stalled = query::handlers::get_stalled_trade_ids(&self.db_manager, cutoff).await?;

        let mut completed = 0;
        for trade_id in stalled {
            match TradeCompletion::run(
                &self.db_manager,
                trade_id,
                CompletionMode::Auto { grace: self.grace },
            )
            .await
            {
                Ok(outcome) => {
                    completed += 1;
                    self.dispatcher.dispatch(outcome.notifications);
                }
                Err(e) => error!(
                    "{:<12} --> 거래 {} 자동 완료 실패: {:?}",
                    "Scheduler", trade_id, e
                ),
            }
        }

        self.inventory.cleanup_expired_reservations().await?;

        debug!(
            "{:<12} --> 자동 완료 {}건 처리",
            "Scheduler", completed
        );
        Ok(completed)
    }
}
// endregion: --- Trade Scheduler
