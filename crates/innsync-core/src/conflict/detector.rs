//! Independent divergence rules for a reservation seen from both sides

use serde::Serialize;

use crate::config::ConflictPolicy;
use crate::mapper::{format_amount, percent_difference, ExternalReservation};
use crate::models::{ConflictType, Reservation};

/// One fired rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub conflict_type: ConflictType,
    pub detail: String,
}

/// Compare the local record with incoming remote data.
///
/// `local_changed_since_sync` is true when the local record no longer matches
/// the fingerprint stored on its mapping. Only then can a newer local
/// modification time mean an unsynced local edit. Rules are evaluated
/// independently, so several may fire.
pub fn detect_reservation_conflicts(
    local: &Reservation,
    remote: &ExternalReservation,
    local_changed_since_sync: bool,
    policy: &ConflictPolicy,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    if local_changed_since_sync {
        if let Some(remote_modified) = remote.updated_at {
            if local.updated_at > remote_modified {
                detections.push(Detection {
                    conflict_type: ConflictType::Timestamp,
                    detail: format!(
                        "local modified {} after remote {}",
                        local.updated_at.to_rfc3339(),
                        remote_modified.to_rfc3339()
                    ),
                });
            }
        }
    }

    if local.status != remote.status {
        detections.push(Detection {
            conflict_type: ConflictType::Status,
            detail: format!("local {} vs remote {}", local.status, remote.status),
        });
    }

    if local.check_in != remote.check_in || local.check_out != remote.check_out {
        detections.push(Detection {
            conflict_type: ConflictType::Range,
            detail: format!(
                "local {}..{} vs remote {}..{}",
                local.check_in, local.check_out, remote.check_in, remote.check_out
            ),
        });
    }

    let currency_differs = !local.currency.eq_ignore_ascii_case(&remote.currency);
    let difference = percent_difference(local.total_amount_cents, remote.total_amount_cents);
    if currency_differs || difference > policy.amount_tolerance_percent {
        detections.push(Detection {
            conflict_type: ConflictType::Amount,
            detail: format!(
                "local {} {} vs remote {} {} ({difference:.1}% > {:.1}%)",
                format_amount(local.total_amount_cents),
                local.currency,
                format_amount(remote.total_amount_cents),
                remote.currency,
                policy.amount_tolerance_percent
            ),
        });
    }

    detections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Origin, ReservationStatus};
    use chrono::{Duration, NaiveDate, Utc};

    fn local() -> Reservation {
        Reservation {
            id: "r-1".to_string(),
            property_id: "p1".to_string(),
            guest_id: None,
            room_type_id: None,
            status: ReservationStatus::Confirmed,
            check_in: NaiveDate::from_ymd_opt(2025, 1, 29).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            adults: 2,
            children: 0,
            total_amount_cents: 10_000,
            currency: "EUR".to_string(),
            origin: Origin::Channel,
            channel_code: None,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn remote_of(local: &Reservation) -> ExternalReservation {
        ExternalReservation {
            external_id: "BK-1".to_string(),
            external_property_id: None,
            status: local.status,
            check_in: local.check_in,
            check_out: local.check_out,
            adults: local.adults,
            children: local.children,
            total_amount_cents: local.total_amount_cents,
            currency: local.currency.clone(),
            channel_code: None,
            room_type_external_id: None,
            customer: None,
            notes: None,
            updated_at: Some(local.updated_at - Duration::hours(1)),
        }
    }

    fn types(detections: &[Detection]) -> Vec<ConflictType> {
        detections.iter().map(|d| d.conflict_type).collect()
    }

    #[test]
    fn identical_snapshots_do_not_conflict() {
        let local = local();
        let remote = remote_of(&local);
        assert!(detect_reservation_conflicts(&local, &remote, false, &ConflictPolicy::default())
            .is_empty());
    }

    #[test]
    fn amount_within_tolerance_is_accepted() {
        let local = local();
        let mut remote = remote_of(&local);
        remote.total_amount_cents = 10_400;
        assert!(detect_reservation_conflicts(&local, &remote, false, &ConflictPolicy::default())
            .is_empty());

        remote.total_amount_cents = 12_000;
        assert_eq!(
            types(&detect_reservation_conflicts(
                &local,
                &remote,
                false,
                &ConflictPolicy::default()
            )),
            [ConflictType::Amount]
        );
    }

    #[test]
    fn tolerance_comes_from_policy() {
        let local = local();
        let mut remote = remote_of(&local);
        remote.total_amount_cents = 12_000;
        let loose = ConflictPolicy {
            amount_tolerance_percent: 25.0,
            ..ConflictPolicy::default()
        };
        assert!(detect_reservation_conflicts(&local, &remote, false, &loose).is_empty());
    }

    #[test]
    fn several_rules_can_fire() {
        let local = local();
        let mut remote = remote_of(&local);
        remote.status = ReservationStatus::Cancelled;
        remote.check_out = NaiveDate::from_ymd_opt(2025, 2, 2).unwrap();
        assert_eq!(
            types(&detect_reservation_conflicts(
                &local,
                &remote,
                true,
                &ConflictPolicy::default()
            )),
            [ConflictType::Timestamp, ConflictType::Status, ConflictType::Range]
        );
    }

    #[test]
    fn timestamp_rule_needs_an_unsynced_local_edit() {
        let local = local();
        let remote = remote_of(&local);
        assert!(detect_reservation_conflicts(&local, &remote, false, &ConflictPolicy::default())
            .is_empty());

        let mut newer_remote = remote_of(&local);
        newer_remote.updated_at = Some(local.updated_at + Duration::hours(1));
        assert!(
            detect_reservation_conflicts(&local, &newer_remote, true, &ConflictPolicy::default())
                .is_empty()
        );
    }
}
