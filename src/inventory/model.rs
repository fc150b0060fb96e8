use crate::error::UnknownStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 상품 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Reserved,
    Locked,
    Traded,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Locked => "locked",
            ItemStatus::Traded => "traded",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ItemStatus::Available),
            "reserved" => Ok(ItemStatus::Reserved),
            "locked" => Ok(ItemStatus::Locked),
            // 이전 데이터 호환
            "traded" | "sold" => Ok(ItemStatus::Traded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for ItemStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// 상품 모델
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    #[sqlx(try_from = "String")]
    pub status: ItemStatus,
    pub version: i64,
    pub reserved_until: Option<DateTime<Utc>>,
    pub reserved_by: Option<i64>,
    pub locked_by_trade_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// 예약이 아직 유효한지
    pub fn has_live_reservation(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Reserved && self.reserved_until.is_some_and(|until| until > now)
    }

    /// 거래/판매 가능 여부 (만료된 예약은 가능으로 본다)
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ItemStatus::Available => true,
            ItemStatus::Reserved => !self.has_live_reservation(now),
            ItemStatus::Locked | ItemStatus::Traded => false,
        }
    }

    pub fn is_locked_by(&self, trade_id: i64) -> bool {
        self.status == ItemStatus::Locked && self.locked_by_trade_id == Some(trade_id)
    }
}

/// 거래 완료 시 상품 이전 결과
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Transferred(Item),
    /// 이미 다른 흐름에서 옮겨진 상품
    Skipped { item_id: i64, status: ItemStatus },
}
