/// 거래 상태 전이 규칙
/// DB 를 건드리지 않고 (현재 거래, 행위자, 액션) 으로 다음 상태를 결정한다.
// region:    --- Imports
use super::model::{Party, Trade, TradeAction, TradeStatus};
use crate::error::{TradeError, TradeResult};
// endregion: --- Imports

/// 검증을 통과한 전이
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: TradeAction,
    pub party: Party,
    pub from: TradeStatus,
    pub to: TradeStatus,
}

impl Transition {
    /// 두 번째 완료 요청이라 완료 트랜잭션을 실행해야 하는지
    pub fn finalizes(&self) -> bool {
        self.action == TradeAction::Complete && self.to == TradeStatus::Completed
    }
}

/// 협상 중 응답해야 하는 사용자 (값이 없으면 상대방)
pub fn responder(trade: &Trade) -> i64 {
    trade.awaiting_response_from.unwrap_or(trade.counterparty_id)
}

pub fn plan(trade: &Trade, actor_id: i64, action: TradeAction) -> TradeResult<Transition> {
    let party = trade.party_of(actor_id).ok_or_else(|| {
        TradeError::Forbidden(format!(
            "사용자 {}은(는) 거래 {}의 당사자가 아닙니다.",
            actor_id, trade.id
        ))
    })?;

    let from = trade.status;
    if from.is_success() {
        return Err(TradeError::Conflict(format!(
            "거래 {}은(는) 이미 완료되었습니다: {}",
            trade.id, from
        )));
    }
    if from.is_terminal() {
        return Err(TradeError::InvalidState(format!(
            "거래 {}은(는) 이미 종료되었습니다: {}",
            trade.id, from
        )));
    }

    let to = match action {
        TradeAction::Accept | TradeAction::Decline | TradeAction::Counter => {
            if !from.is_negotiating() {
                return Err(invalid(trade, action));
            }
            if responder(trade) != actor_id {
                return Err(TradeError::Forbidden(format!(
                    "거래 {}은(는) 상대방의 응답을 기다리는 중입니다.",
                    trade.id
                )));
            }
            match action {
                TradeAction::Accept => TradeStatus::Active,
                TradeAction::Decline => TradeStatus::Declined,
                _ => TradeStatus::Countered,
            }
        }
        TradeAction::Complete => match from {
            TradeStatus::Active | TradeStatus::Accepted | TradeStatus::AwaitingConfirmation => {
                if trade.has_completed(party) {
                    return Err(TradeError::InvalidState(format!(
                        "거래 {}의 완료를 이미 확인했습니다.",
                        trade.id
                    )));
                }
                let other = match party {
                    Party::Initiator => Party::Counterparty,
                    Party::Counterparty => Party::Initiator,
                };
                if trade.has_completed(other) {
                    TradeStatus::Completed
                } else {
                    TradeStatus::AwaitingConfirmation
                }
            }
            _ => return Err(invalid(trade, action)),
        },
        TradeAction::Cancel => match from {
            TradeStatus::Pending
            | TradeStatus::Countered
            | TradeStatus::Accepted
            | TradeStatus::Active => TradeStatus::Cancelled,
            _ => return Err(invalid(trade, action)),
        },
    };

    Ok(Transition {
        action,
        party,
        from,
        to,
    })
}

fn invalid(trade: &Trade, action: TradeAction) -> TradeError {
    TradeError::InvalidState(format!(
        "거래 {} ({}) 상태에서는 {} 요청을 처리할 수 없습니다.",
        trade.id, trade.status, action
    ))
}
