// region:    --- Imports
use barter_service::config::AppConfig;
use barter_service::database::DatabaseManager;
use barter_service::handlers::{self, AppState};
use barter_service::inventory::InventoryManager;
use barter_service::loop_detector::{self, LoopDetectorConfig, LoopScanner};
use barter_service::message_broker::{KafkaManager, TRADE_EVENTS_TOPIC};
use barter_service::notification::{
    EventPublisher, FanoutPublisher, NotificationDispatcher, NotificationHub,
};
use barter_service::scheduler::TradeScheduler;
use barter_service::trade::TradeEngine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
// endregion: --- Imports

// region:    --- Main
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // logging 초기화
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_target(false)
        .init();

    // 설정 로드 (.env 가 없어도 된다)
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    // DatabaseManager 생성
    let db_manager = Arc::new(DatabaseManager::new(&config).await?);

    // 데이터베이스 초기화
    if let Err(e) = db_manager.initialize_database(config.reset_database).await {
        error!("{:<12} --> 데이터베이스 초기화 실패: {:?}", "Main", e);
        return Err(e.into());
    }
    info!("{:<12} --> 데이터베이스 초기화 성공", "Main");

    // 알림 발행: 실시간 허브 + (설정 시) Kafka
    let hub = NotificationHub::new();
    let mut publishers: Vec<Arc<dyn EventPublisher>> = vec![Arc::new(hub.clone())];
    match &config.kafka_brokers {
        Some(brokers) => {
            let kafka_manager = KafkaManager::new(brokers)?;
            if let Err(e) = kafka_manager.create_topic(TRADE_EVENTS_TOPIC, 5, 1).await {
                warn!("{:<12} --> 토픽 생성 실패, 계속 진행: {}", "Main", e);
            }
            publishers.push(kafka_manager.get_producer());
            info!("{:<12} --> Kafka 발행 활성화", "Main");
        }
        None => info!("{:<12} --> KAFKA_BROKERS 미설정, Kafka 발행 비활성화", "Main"),
    }
    let publisher: Arc<dyn EventPublisher> = Arc::new(FanoutPublisher::new(publishers));
    let dispatcher = NotificationDispatcher::spawn(Arc::clone(&publisher));

    // 순환 거래 탐지 워커
    let loop_config = LoopDetectorConfig {
        min_cycle_len: config.loop_min_cycle_len,
        max_cycle_len: config.loop_max_cycle_len,
        queue_capacity: config.loop_queue_capacity,
    };
    let (loop_handle, loop_receiver) = loop_detector::channel(loop_config.queue_capacity);
    let scanner = LoopScanner::new(
        Arc::clone(&db_manager),
        Arc::clone(&publisher),
        loop_config,
    );
    loop_detector::start(scanner, loop_receiver);

    // 자동 완료 스케줄러
    TradeScheduler::new(
        Arc::clone(&db_manager),
        dispatcher.clone(),
        config.scheduler_interval(),
        config.auto_complete_grace(),
    )
    .start();

    let state = AppState {
        trade_engine: Arc::new(TradeEngine::new(
            Arc::clone(&db_manager),
            dispatcher,
            loop_handle,
        )),
        inventory: Arc::new(InventoryManager::new(Arc::clone(&db_manager))),
    };
    let routes_all = handlers::router(state);

    // 리스너 생성
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(
        "{:<12} --> Web Server: Listening on {}",
        "Main",
        listener.local_addr()?
    );

    // 서버 실행
    if let Err(err) = axum::serve(listener, routes_all.into_make_service()).await {
        error!("{:<12} --> Server error: {}", "Main", err);
    }
    Ok(())
}
// endregion: --- Main
