//! Resolution policy keyed by (conflict type, booking origin)

use serde::Serialize;

use super::Detection;
use crate::config::ConflictPolicy;
use crate::models::{ConflictType, Origin, ResolutionAction, TimestampWinner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Auto(ResolutionAction),
    Manual,
}

/// | conflict  | channel origin | pms origin |
/// |-----------|----------------|------------|
/// | status    | accept remote  | manual     |
/// | range     | accept remote  | manual     |
/// | amount    | manual         | manual     |
/// | timestamp | per policy     | per policy |
pub const fn decide(
    conflict_type: ConflictType,
    origin: Origin,
    policy: &ConflictPolicy,
) -> Decision {
    match (conflict_type, origin) {
        (ConflictType::Status | ConflictType::Range, Origin::Channel) => {
            Decision::Auto(ResolutionAction::AcceptRemote)
        }
        (ConflictType::Status | ConflictType::Range | ConflictType::Amount, _) => Decision::Manual,
        (ConflictType::Timestamp, _) => match policy.timestamp_winner {
            TimestampWinner::Manual => Decision::Manual,
            TimestampWinner::Local => Decision::Auto(ResolutionAction::AcceptLocal),
            TimestampWinner::Remote => Decision::Auto(ResolutionAction::AcceptRemote),
        },
    }
}

/// What to do with one inbound item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Nothing diverged beyond policy
    Apply,
    /// Every rule resolved to the remote side
    ApplyRemote,
    /// Every rule resolved to the local side
    KeepLocal,
    /// At least one rule needs an operator, or the automatic answers disagree
    Hold,
}

pub fn plan(detections: &[Detection], origin: Origin, policy: &ConflictPolicy) -> Plan {
    if detections.is_empty() {
        return Plan::Apply;
    }
    let mut remote = false;
    let mut local = false;
    for detection in detections {
        match decide(detection.conflict_type, origin, policy) {
            Decision::Manual | Decision::Auto(ResolutionAction::Merge) => return Plan::Hold,
            Decision::Auto(ResolutionAction::AcceptRemote) => remote = true,
            Decision::Auto(ResolutionAction::AcceptLocal) => local = true,
        }
    }
    match (remote, local) {
        (true, false) => Plan::ApplyRemote,
        (false, true) => Plan::KeepLocal,
        _ => Plan::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(conflict_type: ConflictType) -> Detection {
        Detection {
            conflict_type,
            detail: String::new(),
        }
    }

    #[test]
    fn channel_status_conflict_accepts_remote() {
        assert_eq!(
            decide(ConflictType::Status, Origin::Channel, &ConflictPolicy::default()),
            Decision::Auto(ResolutionAction::AcceptRemote)
        );
        assert_eq!(
            decide(ConflictType::Status, Origin::Pms, &ConflictPolicy::default()),
            Decision::Manual
        );
    }

    #[test]
    fn amount_is_always_manual() {
        for origin in Origin::ALL {
            assert_eq!(
                decide(ConflictType::Amount, *origin, &ConflictPolicy::default()),
                Decision::Manual
            );
        }
    }

    #[test]
    fn timestamp_winner_is_configurable() {
        let local_wins = ConflictPolicy {
            timestamp_winner: TimestampWinner::Local,
            ..ConflictPolicy::default()
        };
        assert_eq!(
            decide(ConflictType::Timestamp, Origin::Pms, &local_wins),
            Decision::Auto(ResolutionAction::AcceptLocal)
        );
        assert_eq!(
            decide(ConflictType::Timestamp, Origin::Pms, &ConflictPolicy::default()),
            Decision::Manual
        );
    }

    #[test]
    fn plans() {
        let policy = ConflictPolicy::default();
        assert_eq!(plan(&[], Origin::Pms, &policy), Plan::Apply);
        assert_eq!(
            plan(&[detection(ConflictType::Status)], Origin::Channel, &policy),
            Plan::ApplyRemote
        );
        assert_eq!(
            plan(
                &[detection(ConflictType::Status), detection(ConflictType::Amount)],
                Origin::Channel,
                &policy
            ),
            Plan::Hold
        );

        let local_wins = ConflictPolicy {
            timestamp_winner: TimestampWinner::Local,
            ..policy
        };
        assert_eq!(
            plan(&[detection(ConflictType::Timestamp)], Origin::Pms, &local_wins),
            Plan::KeepLocal
        );
        assert_eq!(
            plan(
                &[detection(ConflictType::Timestamp), detection(ConflictType::Status)],
                Origin::Channel,
                &local_wins
            ),
            Plan::Hold
        );
    }
}
