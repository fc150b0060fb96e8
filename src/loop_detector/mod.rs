/// 순환 거래 탐지
/// 거래 제안이 커밋된 뒤 요청을 받아, 진행 중인 거래로 그래프를 만들고 순환을 찾는다.
/// 순환에 속한 사용자마다 참고용 알림을 남긴다. 거래/상품 상태는 절대 바꾸지 않는다.
// region:    --- Imports
use crate::database::DatabaseManager;
use crate::error::TradeResult;
use crate::notification::{self, publish_all, EventPublisher, NewNotification, NotificationKind};
use crate::query;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
// endregion: --- Imports

pub mod graph;

pub use graph::{TradeGraph, TradeLoop};

// region:    --- Loop Scanner
#[derive(Debug, Clone, Copy)]
pub struct LoopDetectorConfig {
    pub min_cycle_len: usize,
    pub max_cycle_len: usize,
    pub queue_capacity: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_cycle_len: 3,
            max_cycle_len: 6,
            queue_capacity: 64,
        }
    }
}

/// 한 번의 탐지 실행
pub struct LoopScanner {
    db_manager: Arc<DatabaseManager>,
    publisher: Arc<dyn EventPublisher>,
    config: LoopDetectorConfig,
}

impl LoopScanner {
    pub fn new(
        db_manager: Arc<DatabaseManager>,
        publisher: Arc<dyn EventPublisher>,
        config: LoopDetectorConfig,
    ) -> Self {
        Self {
            db_manager,
            publisher,
            config,
        }
    }

    /// 그래프 구성 -> 순환 탐지 -> 알림 저장(한 트랜잭션) -> 발행
    pub async fn scan_once(&self) -> TradeResult<Vec<TradeLoop>> {
        let edges = query::handlers::get_live_trade_edges(&self.db_manager).await?;
        let graph = TradeGraph::from_edges(edges);
        let loops = graph.find_cycles(self.config.min_cycle_len, self.config.max_cycle_len);
        debug!(
            "{:<12} --> 그래프 노드 {}개, 순환 {}개",
            "LoopDetect",
            graph.node_count(),
            loops.len()
        );
        if loops.is_empty() {
            return Ok(loops);
        }

        let mut tx = self.db_manager.pool().begin().await?;
        let mut notifications = Vec::new();
        for trade_loop in &loops {
            for &user_id in &trade_loop.members {
                let new = NewNotification {
                    user_id,
                    trade_id: None,
                    kind: NotificationKind::TradeLoop,
                    message: format!(
                        "회원님을 포함한 {}명이 순환 거래를 할 수 있습니다.",
                        trade_loop.members.len()
                    ),
                    payload: serde_json::json!({ "members": trade_loop.members }),
                };
                notifications.push(notification::insert(&mut tx, new).await?);
            }
        }
        tx.commit().await?;

        info!(
            "{:<12} --> 순환 거래 {}개 발견: {:?}",
            "LoopDetect",
            loops.len(),
            loops.iter().map(|l| &l.members).collect::<Vec<_>>()
        );
        publish_all(self.publisher.as_ref(), &notifications).await;
        Ok(loops)
    }
}
// endregion: --- Loop Scanner

// region:    --- Loop Detector Worker
/// 탐지 요청 (어떤 거래 제안이 계기가 되었는지)
#[derive(Debug, Clone, Copy)]
pub struct LoopScanRequest {
    pub trade_id: i64,
}

/// 요청 경로에서 쓰는 핸들. 절대 대기하지 않는다.
#[derive(Clone)]
pub struct LoopDetectorHandle {
    sender: mpsc::Sender<LoopScanRequest>,
}

impl LoopDetectorHandle {
    /// 큐가 가득 차면 요청을 버린다 (이미 대기 중인 스캔이 같은 결과를 낸다)
    pub fn trigger(&self, trade_id: i64) {
        match self.sender.try_send(LoopScanRequest { trade_id }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                "{:<12} --> 탐지 큐가 가득 차 요청을 버림: trade={}",
                "LoopDetect", trade_id
            ),
            Err(TrySendError::Closed(_)) => debug!(
                "{:<12} --> 탐지 워커가 없어 요청을 버림: trade={}",
                "LoopDetect", trade_id
            ),
        }
    }
}

/// 탐지 워커 생성
pub fn channel(capacity: usize) -> (LoopDetectorHandle, mpsc::Receiver<LoopScanRequest>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (LoopDetectorHandle { sender }, receiver)
}

/// 탐지 워커 시작. 실패는 로그만 남기고 다음 요청을 기다린다.
pub fn start(
    scanner: LoopScanner,
    mut receiver: mpsc::Receiver<LoopScanRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = receiver.recv().await {
            // 몰려온 요청은 한 번의 스캔으로 처리
            let mut coalesced = 0;
            while receiver.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!(
                "{:<12} --> 스캔 시작: trade={} (합쳐진 요청 {}건)",
                "LoopDetect", request.trade_id, coalesced
            );
            if let Err(e) = scanner.scan_once().await {
                error!("{:<12} --> 순환 탐지 실패: {:?}", "LoopDetect", e);
            }
        }
        info!("{:<12} --> 탐지 워커 종료", "LoopDetect");
    })
}
// endregion: --- Loop Detector Worker

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_never_blocks() {
        let (handle, mut receiver) = channel(1);
        handle.trigger(1);
        // 가득 찬 큐: 버려지고 패닉/대기 없음
        handle.trigger(2);
        assert_eq!(receiver.recv().await.map(|r| r.trade_id), Some(1));
        assert!(receiver.try_recv().is_err());

        drop(receiver);
        handle.trigger(3);
    }
}
