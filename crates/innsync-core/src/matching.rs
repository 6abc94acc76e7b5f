//! Resolve external customer records to local guests.
//!
//! Order, first hit wins: existing mapping, exact email (case-insensitive),
//! normalized phone, otherwise a new local guest. Every result carries the
//! method and a confidence; low-confidence matches are flagged for review.

use serde::Serialize;

use crate::mapper::{local_guest_hash, ExternalGuest};
use crate::models::{
    EntityType, Guest, MappingId, MatchConfidence, MatchMethod, NewMapping, SyncDirection,
};
use crate::pms::PmsGateway;
use crate::services::SyncStore;
use crate::util::{normalize_email, normalize_phone};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestMatch {
    pub guest: Guest,
    pub method: MatchMethod,
    pub confidence: MatchConfidence,
    /// Needs an operator look before it is trusted
    pub flagged: bool,
    pub mapping_id: Option<MappingId>,
}

impl GuestMatch {
    pub const fn created(&self) -> bool {
        matches!(self.method, MatchMethod::Created)
    }
}

/// Where a matched guest lives
#[derive(Debug, Clone, Copy)]
pub struct MatchScope<'a> {
    pub property_id: &'a str,
    pub external_property_id: &'a str,
}

fn same_name(guest: &Guest, external: &ExternalGuest) -> bool {
    let last = external.last_name.trim();
    !last.is_empty() && guest.last_name.trim().eq_ignore_ascii_case(last)
}

/// Pick among candidates; ties are broken by id so repeated runs agree.
fn choose(
    mut candidates: Vec<Guest>,
    external: &ExternalGuest,
    agreeing: MatchConfidence,
    disagreeing: MatchConfidence,
) -> Option<(Guest, MatchConfidence)> {
    candidates.sort_by(|a, b| a.id.cmp(&b.id));
    let ambiguous = candidates.len() > 1;
    let guest = candidates.into_iter().next()?;
    let confidence = if ambiguous {
        MatchConfidence::Low
    } else if same_name(&guest, external) {
        agreeing
    } else {
        disagreeing
    };
    Some((guest, confidence))
}

pub async fn resolve_guest(
    store: &SyncStore,
    pms: &dyn PmsGateway,
    scope: MatchScope<'_>,
    external: &ExternalGuest,
) -> Result<GuestMatch> {
    let property_id = scope.property_id;

    if let Some(external_id) = external.external_id.as_deref() {
        if let Some(mapping) = store
            .find_mapping_by_external(property_id, EntityType::Guest, external_id)
            .await?
        {
            if let Some(guest) = pms.get_guest(property_id, &mapping.local_id).await? {
                return Ok(GuestMatch {
                    guest,
                    method: MatchMethod::Mapping,
                    confidence: MatchConfidence::High,
                    flagged: false,
                    mapping_id: Some(mapping.id),
                });
            }
            tracing::warn!(
                property = property_id,
                external_id,
                local_id = %mapping.local_id,
                "Mapped guest no longer exists, retiring mapping"
            );
            store.retire_mapping(&mapping.id).await?;
        }
    }

    let mut found = None;
    if let Some(email) = external.email.as_deref().and_then(normalize_email) {
        let candidates = pms.find_guests_by_email(property_id, &email).await?;
        found = choose(candidates, external, MatchConfidence::High, MatchConfidence::Medium)
            .map(|(guest, confidence)| (guest, MatchMethod::Email, confidence));
    }
    if found.is_none() {
        if let Some(phone) = external.phone.as_deref().and_then(normalize_phone) {
            let candidates = pms.find_guests_by_phone(property_id, &phone).await?;
            found = choose(candidates, external, MatchConfidence::Medium, MatchConfidence::Low)
                .map(|(guest, confidence)| (guest, MatchMethod::Phone, confidence));
        }
    }

    let (guest, method, confidence) = match found {
        Some(found) => found,
        None => {
            if external.first_name.trim().is_empty() && external.last_name.trim().is_empty() {
                return Err(Error::Validation(
                    "customer has no name, email or phone to match on".to_string(),
                ));
            }
            let guest = pms.create_guest(property_id, &external.to_input()).await?;
            (guest, MatchMethod::Created, MatchConfidence::High)
        }
    };

    let flagged = confidence == MatchConfidence::Low;
    if flagged {
        tracing::warn!(
            property = property_id,
            guest_id = %guest.id,
            method = method.as_str(),
            "Low-confidence guest match flagged for review"
        );
    }

    let mapping_id = match external.external_id.as_deref() {
        Some(external_id) => {
            record_mapping(
                store,
                scope,
                external,
                &guest,
                method,
                confidence,
                external_id,
            )
            .await?
        }
        None => None,
    };

    Ok(GuestMatch {
        guest,
        method,
        confidence,
        flagged,
        mapping_id,
    })
}

async fn record_mapping(
    store: &SyncStore,
    scope: MatchScope<'_>,
    external: &ExternalGuest,
    guest: &Guest,
    method: MatchMethod,
    confidence: MatchConfidence,
    external_id: &str,
) -> Result<Option<MappingId>> {
    let new = NewMapping {
        property_id: scope.property_id.to_string(),
        entity_type: EntityType::Guest,
        local_id: guest.id.clone(),
        external_id: external_id.to_string(),
        external_property_id: scope.external_property_id.to_string(),
        sync_direction: SyncDirection::Inbound,
        local_hash: Some(local_guest_hash(guest)?),
        external_hash: Some(external.fingerprint()?),
        match_method: Some(method),
        match_confidence: Some(confidence),
    };
    match store.create_mapping(new, true).await {
        Ok(mapping) => Ok(Some(mapping.id)),
        Err(Error::AlreadyExists(detail)) => {
            // The local guest is already linked to another external customer.
            tracing::warn!(
                property = scope.property_id,
                guest_id = %guest.id,
                external_id,
                detail = %detail,
                "Guest already mapped, leaving existing mapping in place"
            );
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
