// region:    --- Imports
use crate::config::AppConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info};
// endregion: --- Imports

/// 스키마 초기화를 직렬화하는 advisory lock 키
const SCHEMA_LOCK_KEY: i64 = 0x6261_7274_6572;

pub struct DatabaseManager {
    pub pool: Arc<PgPool>,
}

impl DatabaseManager {
    /// 데이터베이스 매니저 생성
    pub async fn new(config: &AppConfig) -> Result<Self, sqlx::Error> {
        info!(
            "{:<12} --> 데이터베이스 연결: {}",
            "Database",
            config.database_url_masked()
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 트랜잭션 실행
    pub async fn transaction<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: for<'c> FnOnce(
            &'c mut sqlx::Transaction<'_, sqlx::Postgres>,
        ) -> Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'c>>,
        E: From<sqlx::Error>,
    {
        let mut tx = self.pool.begin().await?;
        let result = f(&mut tx).await;
        match result {
            Ok(r) => {
                tx.commit().await?;
                Ok(r)
            }
            Err(e) => {
                // 롤백 실패는 로그만 남기고 원래 오류를 돌려준다
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        "{:<12} --> 롤백 실패: {:?}",
                        "Database", rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// 데이터베이스 초기화
    /// reset 이 true 이면 기존 테이블을 모두 지우고 다시 만든다.
    pub async fn initialize_database(&self, reset: bool) -> Result<(), sqlx::Error> {
        // 여러 프로세스(테스트 포함)가 동시에 스키마를 만들지 않도록 잠금
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = async {
            if reset {
                info!("{:<12} --> 기존 스키마 삭제", "Database");
                let recreate_db_sql = include_str!("../sql/00-recreate-db.sql");
                Self::execute_multi_query(&mut *conn, recreate_db_sql).await?;
            }
            let create_schema_sql = include_str!("../sql/01-create-schema.sql");
            Self::execute_multi_query(&mut *conn, create_schema_sql).await
        }
        .await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    /// 여러 쿼리 실행
    async fn execute_multi_query(
        conn: &mut sqlx::PgConnection,
        sql: &str,
    ) -> Result<(), sqlx::Error> {
        for query in sql.split(';') {
            let query = query.trim();
            if !query.is_empty() {
                sqlx::query(query).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }
}
