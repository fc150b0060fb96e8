/// 거래 엔진 오류 타입
// region:    --- Imports
use thiserror::Error;
// endregion: --- Imports

// region:    --- Trade Error
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("{entity} {id}을(를) 찾을 수 없습니다.")]
    NotFound { entity: &'static str, id: i64 },

    #[error("권한이 없습니다: {0}")]
    Forbidden(String),

    #[error("현재 상태에서 허용되지 않는 요청입니다: {0}")]
    InvalidState(String),

    #[error("동시 요청과 충돌했습니다: {0}")]
    Conflict(String),

    #[error("잘못된 요청입니다: {0}")]
    Validation(String),

    #[error("데이터베이스 오류 ({operation}, id={id}): {source}")]
    Database {
        operation: &'static str,
        id: i64,
        #[source]
        source: sqlx::Error,
    },
}

pub type TradeResult<T> = Result<T, TradeError>;

/// DB 에 저장된 상태 문자열을 해석할 수 없을 때
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("알 수 없는 상태 값: {0}")]
pub struct UnknownStatus(pub String);

impl TradeError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        TradeError::NotFound { entity, id }
    }

    /// 응답용 오류 코드
    pub fn code(&self) -> &'static str {
        match self {
            TradeError::NotFound { .. } => "NOT_FOUND",
            TradeError::Forbidden(_) => "FORBIDDEN",
            TradeError::InvalidState(_) => "INVALID_STATE",
            TradeError::Conflict(_) => "CONFLICT",
            TradeError::Validation(_) => "VALIDATION_ERROR",
            TradeError::Database { .. } => "INTERNAL_ERROR",
        }
    }
}

/// 트랜잭션 시작/커밋 오류
impl From<sqlx::Error> for TradeError {
    fn from(source: sqlx::Error) -> Self {
        TradeError::Database {
            operation: "transaction",
            id: 0,
            source,
        }
    }
}

/// sqlx 오류에 작업명과 대상 id를 붙인다.
pub trait DbResultExt<T> {
    fn db_context(self, operation: &'static str, id: i64) -> TradeResult<T>;
}

impl<T> DbResultExt<T> for Result<T, sqlx::Error> {
    fn db_context(self, operation: &'static str, id: i64) -> TradeResult<T> {
        self.map_err(|source| TradeError::Database {
            operation,
            id,
            source,
        })
    }
}
// endregion: --- Trade Error
