/// 서비스 설정
/// 환경 변수(.env 포함)에서 읽는다.
// region:    --- Imports
use serde::{Deserialize, Serialize};
use std::time::Duration;
// endregion: --- Imports

// region:    --- App Config
/// 자동 완료 유예 시간 상한 (1년)
const MAX_GRACE_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL 접속 URL
    pub database_url: String,
    /// 최대 커넥션 수
    pub max_connections: u32,
    /// 웹 서버 바인드 주소
    pub bind_addr: String,
    /// Kafka 브로커 (없으면 Kafka 발행 비활성화)
    pub kafka_brokers: Option<String>,
    /// 스케줄러 실행 주기(초)
    pub scheduler_interval_secs: u64,
    /// 자동 완료 유예 시간(시간)
    pub auto_complete_grace_hours: i64,
    pub loop_min_cycle_len: usize,
    pub loop_max_cycle_len: usize,
    /// 루프 탐지 요청 큐 크기
    pub loop_queue_capacity: usize,
    /// 시작 시 스키마를 지우고 다시 만들지 여부
    pub reset_database: bool,
}

impl AppConfig {
    /// 환경 변수에서 설정 생성
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 키 조회 함수로부터 설정 생성
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        let config = Self {
            database_url,
            max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            kafka_brokers: lookup("KAFKA_BROKERS").filter(|s| !s.trim().is_empty()),
            scheduler_interval_secs: parse_or(&lookup, "SCHEDULER_INTERVAL_SECS", 60)?,
            auto_complete_grace_hours: parse_or(&lookup, "AUTO_COMPLETE_GRACE_HOURS", 24)?,
            loop_min_cycle_len: parse_or(&lookup, "LOOP_MIN_CYCLE_LEN", 3)?,
            loop_max_cycle_len: parse_or(&lookup, "LOOP_MAX_CYCLE_LEN", 6)?,
            loop_queue_capacity: parse_or(&lookup, "LOOP_QUEUE_CAPACITY", 64)?,
            reset_database: parse_or(&lookup, "RESET_DATABASE", false)?,
        };

        if config.loop_min_cycle_len < 2 || config.loop_min_cycle_len > config.loop_max_cycle_len {
            return Err(format!(
                "invalid loop cycle bounds: {}..={}",
                config.loop_min_cycle_len, config.loop_max_cycle_len
            ));
        }
        if !(1..=MAX_GRACE_HOURS).contains(&config.auto_complete_grace_hours) {
            return Err(format!(
                "AUTO_COMPLETE_GRACE_HOURS must be within 1..={}: {}",
                MAX_GRACE_HOURS, config.auto_complete_grace_hours
            ));
        }
        if config.scheduler_interval_secs == 0 || config.loop_queue_capacity == 0 {
            return Err("SCHEDULER_INTERVAL_SECS and LOOP_QUEUE_CAPACITY must be positive".into());
        }

        Ok(config)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn auto_complete_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.auto_complete_grace_hours)
    }

    /// 로그 출력용 (비밀번호 마스킹)
    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn mask_url(url: &str) -> String {
    if let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) {
        if at_pos < scheme_end + 3 {
            return url.to_string();
        }
        let user_pass = &url[scheme_end + 3..at_pos];
        if let Some(colon_pos) = user_pass.find(':') {
            return format!(
                "{}{}:***{}",
                &url[..scheme_end + 3],
                &user_pass[..colon_pos],
                &url[at_pos..]
            );
        }
    }
    url.to_string()
}
// endregion: --- App Config
