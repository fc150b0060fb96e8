/// 알림 기록 및 실시간 전달
/// 1. 알림 레코드 (전이 트랜잭션 안에서 저장)
/// 2. 커밋 후 발행 (EventPublisher)
/// 3. 사용자별 실시간 구독 허브
/// 4. 발행 큐 (요청 경로는 대기하지 않는다)
// region:    --- Imports
use crate::error::{DbResultExt, TradeResult, UnknownStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, warn};
// endregion: --- Imports

// region:    --- Notification Model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TradeProposed,
    TradeAccepted,
    TradeDeclined,
    TradeCountered,
    CompletionRequested,
    TradeCompleted,
    TradeAutoCompleted,
    TradeCancelled,
    TradeLoop,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TradeProposed => "trade_proposed",
            NotificationKind::TradeAccepted => "trade_accepted",
            NotificationKind::TradeDeclined => "trade_declined",
            NotificationKind::TradeCountered => "trade_countered",
            NotificationKind::CompletionRequested => "completion_requested",
            NotificationKind::TradeCompleted => "trade_completed",
            NotificationKind::TradeAutoCompleted => "trade_auto_completed",
            NotificationKind::TradeCancelled => "trade_cancelled",
            NotificationKind::TradeLoop => "trade_loop",
        }
    }

    const ALL: [NotificationKind; 9] = [
        NotificationKind::TradeProposed,
        NotificationKind::TradeAccepted,
        NotificationKind::TradeDeclined,
        NotificationKind::TradeCountered,
        NotificationKind::CompletionRequested,
        NotificationKind::TradeCompleted,
        NotificationKind::TradeAutoCompleted,
        NotificationKind::TradeCancelled,
        NotificationKind::TradeLoop,
    ];
}

impl TryFrom<String> for NotificationKind {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(UnknownStatus(value))
    }
}

// 알림 모델
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub trade_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub kind: NotificationKind,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: i64,
    pub trade_id: Option<i64>,
    pub kind: NotificationKind,
    pub message: String,
    pub payload: serde_json::Value,
}

/// 1. 알림 레코드 저장
pub async fn insert(conn: &mut PgConnection, new: NewNotification) -> TradeResult<Notification> {
    sqlx::query_as::<_, Notification>(
        "INSERT INTO notifications (user_id, trade_id, kind, message, payload)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(new.user_id)
    .bind(new.trade_id)
    .bind(new.kind.as_str())
    .bind(&new.message)
    .bind(&new.payload)
    .fetch_one(&mut *conn)
    .await
    .db_context("insert_notification", new.user_id)
}
// endregion: --- Notification Model

// region:    --- Event Publisher
/// 2. 커밋 후 알림 발행
/// 발행은 최선 노력이며 실패해도 거래 결과에 영향을 주지 않는다.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), String>;
}

/// 여러 알림을 발행하고 실패는 로그만 남긴다.
pub async fn publish_all(publisher: &dyn EventPublisher, notifications: &[Notification]) {
    for notification in notifications {
        if let Err(e) = publisher.publish(notification).await {
            error!(
                "{:<12} --> 알림 발행 실패: user={} kind={} error={}",
                "Publisher",
                notification.user_id,
                notification.kind.as_str(),
                e
            );
        }
    }
}

/// 여러 발행자에게 같은 알림을 보낸다 (실시간 허브 + Kafka)
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, notification: &Notification) -> Result<(), String> {
        let mut errors = Vec::new();
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(notification).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}
// endregion: --- Event Publisher

// region:    --- Notification Hub
const CHANNEL_CAPACITY: usize = 64;

/// 3. 사용자별 실시간 구독 허브
/// 구독자가 없으면 이벤트는 버려진다.
#[derive(Clone, Default)]
pub struct NotificationHub {
    channels: Arc<RwLock<HashMap<i64, broadcast::Sender<Notification>>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 사용자 구독
    pub async fn subscribe(&self, user_id: i64) -> broadcast::Receiver<Notification> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// 전달되었으면 true
    pub async fn publish_to(&self, user_id: i64, event: Notification) -> bool {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(&user_id) {
                Some(sender) => sender.send(event).is_ok(),
                None => return false,
            }
        };

        if !delivered {
            // 모든 수신자가 끊긴 채널 정리
            let mut channels = self.channels.write().await;
            if channels
                .get(&user_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&user_id);
            }
            debug!(
                "{:<12} --> 구독자 없음, 이벤트 버림: user={}",
                "Hub", user_id
            );
        }
        delivered
    }

    pub async fn subscriber_count(&self, user_id: i64) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&user_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for NotificationHub {
    async fn publish(&self, notification: &Notification) -> Result<(), String> {
        self.publish_to(notification.user_id, notification.clone())
            .await;
        Ok(())
    }
}
// endregion: --- Notification Hub

// region:    --- Notification Dispatcher
const DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// 4. 커밋된 알림을 발행 워커에 넘긴다.
/// 워커 하나가 큐 순서대로 발행하므로 사용자별 순서가 유지된다.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Vec<Notification>>,
}

impl NotificationDispatcher {
    /// 발행 워커 시작 (tokio 런타임 안에서 호출)
    pub fn spawn(publisher: Arc<dyn EventPublisher>) -> Self {
        Self::with_capacity(publisher, DISPATCH_QUEUE_CAPACITY)
    }

    pub fn with_capacity(publisher: Arc<dyn EventPublisher>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Vec<Notification>>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                publish_all(publisher.as_ref(), &batch).await;
            }
            debug!("{:<12} --> 발행 워커 종료", "Dispatcher");
        });
        Self { sender }
    }

    /// 큐가 가득 차면 알림을 버린다 (DB 에는 이미 저장됨)
    pub fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        match self.sender.try_send(notifications) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => warn!(
                "{:<12} --> 발행 큐가 가득 차 알림 {}건을 버림",
                "Dispatcher",
                batch.len()
            ),
            Err(TrySendError::Closed(batch)) => warn!(
                "{:<12} --> 발행 워커가 없어 알림 {}건을 버림",
                "Dispatcher",
                batch.len()
            ),
        }
    }
}
// endregion: --- Notification Dispatcher
