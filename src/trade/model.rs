use crate::error::UnknownStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// region:    --- Trade Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Accepted,
    Countered,
    Active,
    AwaitingConfirmation,
    Completed,
    AutoCompleted,
    Declined,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Accepted => "accepted",
            TradeStatus::Countered => "countered",
            TradeStatus::Active => "active",
            TradeStatus::AwaitingConfirmation => "awaiting_confirmation",
            TradeStatus::Completed => "completed",
            TradeStatus::AutoCompleted => "auto_completed",
            TradeStatus::Declined => "declined",
            TradeStatus::Cancelled => "cancelled",
        }
    }

    /// 더 이상 변경할 수 없는 상태
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Completed
                | TradeStatus::AutoCompleted
                | TradeStatus::Declined
                | TradeStatus::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::AutoCompleted)
    }

    /// 협상 중 (수락/거절/역제안 가능)
    pub fn is_negotiating(&self) -> bool {
        matches!(self, TradeStatus::Pending | TradeStatus::Countered)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "accepted" => Ok(TradeStatus::Accepted),
            "countered" => Ok(TradeStatus::Countered),
            "active" => Ok(TradeStatus::Active),
            "awaiting_confirmation" => Ok(TradeStatus::AwaitingConfirmation),
            "completed" => Ok(TradeStatus::Completed),
            "auto_completed" => Ok(TradeStatus::AutoCompleted),
            "declined" => Ok(TradeStatus::Declined),
            "cancelled" => Ok(TradeStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for TradeStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 감사 로그의 nullable 상태 컬럼용
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaybeStatus(pub Option<TradeStatus>);

impl TryFrom<Option<String>> for MaybeStatus {
    type Error = UnknownStatus;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        value
            .map(|s| s.parse())
            .transpose()
            .map(MaybeStatus)
    }
}
// endregion: --- Trade Status

// region:    --- Trade Action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Accept,
    Decline,
    Counter,
    Complete,
    Cancel,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Accept => "accept",
            TradeAction::Decline => "decline",
            TradeAction::Counter => "counter",
            TradeAction::Complete => "complete",
            TradeAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 거래 당사자 구분
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Initiator,
    Counterparty,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Initiator => "initiator",
            Party::Counterparty => "counterparty",
        }
    }
}

impl TryFrom<String> for Party {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "initiator" => Ok(Party::Initiator),
            "counterparty" => Ok(Party::Counterparty),
            _ => Err(UnknownStatus(value)),
        }
    }
}
// endregion: --- Trade Action

// region:    --- Models
// 거래 모델
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub id: i64,
    pub initiator_id: i64,
    pub counterparty_id: i64,
    pub target_item_id: i64,
    #[sqlx(try_from = "String")]
    pub status: TradeStatus,
    pub initiator_completed: bool,
    pub counterparty_completed: bool,
    pub first_completion_at: Option<DateTime<Utc>>,
    pub awaiting_confirmation_since: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub auto_completed_at: Option<DateTime<Utc>>,
    pub offered_cash_amount: Option<i64>,
    pub message: Option<String>,
    pub awaiting_response_from: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// 사용자가 이 거래에서 어느 쪽인지
    pub fn party_of(&self, user_id: i64) -> Option<Party> {
        if user_id == self.initiator_id {
            Some(Party::Initiator)
        } else if user_id == self.counterparty_id {
            Some(Party::Counterparty)
        } else {
            None
        }
    }

    pub fn other_party(&self, user_id: i64) -> i64 {
        if user_id == self.initiator_id {
            self.counterparty_id
        } else {
            self.initiator_id
        }
    }

    pub fn has_completed(&self, party: Party) -> bool {
        match party {
            Party::Initiator => self.initiator_completed,
            Party::Counterparty => self.counterparty_completed,
        }
    }

    pub fn both_completed(&self) -> bool {
        self.initiator_completed && self.counterparty_completed
    }

    /// 한쪽만 완료를 누른 상태
    pub fn one_sided_completion(&self) -> bool {
        self.initiator_completed != self.counterparty_completed
    }

    pub fn participants(&self) -> [i64; 2] {
        [self.initiator_id, self.counterparty_id]
    }
}

// 거래 상품 모델
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeItem {
    pub trade_id: i64,
    pub item_id: i64,
    #[sqlx(try_from = "String")]
    pub offered_by: Party,
}

// 거래 감사 로그 모델 (추가 전용)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeEvent {
    pub id: i64,
    pub trade_id: i64,
    pub actor_id: Option<i64>,
    #[sqlx(try_from = "Option<String>")]
    pub from_status: MaybeStatus,
    #[sqlx(try_from = "String")]
    pub to_status: TradeStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// 거래 평가 모델
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeRating {
    pub trade_id: i64,
    pub rater_id: i64,
    pub ratee_id: i64,
    pub score: i16,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 거래 + 포함 상품
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDetails {
    #[serde(flatten)]
    pub trade: Trade,
    pub items: Vec<TradeItem>,
}

/// 완료 확인 상태
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub trade_id: i64,
    pub status: TradeStatus,
    pub initiator_completed: bool,
    pub counterparty_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratings: Option<Vec<TradeRating>>,
}
// endregion: --- Models
