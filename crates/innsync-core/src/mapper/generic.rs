//! Built-in broker schema (`CHANNEL_PROVIDER=generic`).
//!
//! Reservation wire shape:
//!
//! ```json
//! {
//!   "id": "BK-1001", "property_id": "H-42", "status": "confirmed",
//!   "arrival": "2025-01-29", "departure": "2025-02-01",
//!   "adults": 2, "children": 0,
//!   "total": {"amount": "360.00", "currency": "EUR"},
//!   "channel": "booking_com", "room_type_id": "DBL",
//!   "customer": {"id": "C-9", "first_name": "Ada", "last_name": "Lovelace",
//!                "email": "ada@example.com", "phone": "+44 20 7946 0000"},
//!   "notes": null, "updated_at": "2025-01-20T10:00:00Z"
//! }
//! ```

use serde_json::{json, Map, Value};

use super::{
    format_amount, format_calendar_date, parse_amount, parse_calendar_date, parse_instant,
    status_from_external, status_to_external, ChannelMapper, ExternalGuest, ExternalReservation,
    MapError, OutboundReservation, Page, WebhookNotice, WebhookSubject,
};
use crate::channel::{ChannelOperation, ChannelRequest, HttpMethod, OperationRouter};
use crate::models::{AvailabilityDay, RateDay};

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericMapper;

static NULL: Value = Value::Null;

fn object<'a>(field: &'static str, value: &'a Value) -> Result<&'a Map<String, Value>, MapError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(MapError::MissingField(field)),
        other => Err(MapError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

/// Trimmed non-empty text; numbers are accepted as their decimal form.
fn text(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(map: &Map<String, Value>, key: &'static str) -> Result<String, MapError> {
    text(map, key).ok_or(MapError::MissingField(key))
}

fn count(map: &Map<String, Value>, key: &'static str) -> Result<Option<u32>, MapError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| MapError::InvalidField {
                field: key,
                value: value.to_string(),
            }),
    }
}

fn parse_customer(value: &Value) -> Result<ExternalGuest, MapError> {
    let map = object("customer", value)?;
    let first_name = text(map, "first_name").unwrap_or_default();
    let last_name = match text(map, "last_name") {
        Some(last) => last,
        None if !first_name.is_empty() => String::new(),
        None => return Err(MapError::MissingField("last_name")),
    };
    Ok(ExternalGuest {
        external_id: text(map, "id"),
        first_name,
        last_name,
        email: text(map, "email").map(|email| email.to_lowercase()),
        phone: text(map, "phone"),
    })
}

fn parse_currency(map: &Map<String, Value>) -> Result<String, MapError> {
    let currency = required_text(map, "currency")?.to_ascii_uppercase();
    if currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_alphabetic()) {
        Ok(currency)
    } else {
        Err(MapError::InvalidField {
            field: "currency",
            value: currency,
        })
    }
}

impl ChannelMapper for GenericMapper {
    fn reservation_to_external(&self, outbound: OutboundReservation<'_>) -> Value {
        let reservation = outbound.reservation;
        let customer = outbound.guest.map(|guest| {
            json!({
                "first_name": guest.first_name,
                "last_name": guest.last_name,
                "email": guest.email,
                "phone": guest.phone,
            })
        });
        json!({
            "reference": reservation.id,
            "status": status_to_external(reservation.status),
            "arrival": format_calendar_date(reservation.check_in),
            "departure": format_calendar_date(reservation.check_out),
            "adults": reservation.adults,
            "children": reservation.children,
            "total": {
                "amount": format_amount(reservation.total_amount_cents),
                "currency": reservation.currency,
            },
            "channel": reservation.channel_code,
            "room_type_id": outbound.room_type_external_id,
            "customer": customer,
            "notes": reservation.notes,
        })
    }

    fn reservation_from_external(&self, value: &Value) -> Result<ExternalReservation, MapError> {
        let map = object("reservation", value)?;

        let external_id = required_text(map, "id")?;
        let status = status_from_external(&required_text(map, "status")?);
        let check_in = parse_calendar_date("arrival", &required_text(map, "arrival")?)?;
        let departure = required_text(map, "departure")?;
        let check_out = parse_calendar_date("departure", &departure)?;
        if check_out < check_in {
            return Err(MapError::InvalidField {
                field: "departure",
                value: departure,
            });
        }

        let adults = count(map, "adults")?.ok_or(MapError::MissingField("adults"))?;
        let children = count(map, "children")?.unwrap_or(0);

        let total = object("total", map.get("total").unwrap_or(&NULL))?;
        let total_amount_cents = parse_amount(
            "total.amount",
            total.get("amount").unwrap_or(&NULL),
        )?;
        let currency = parse_currency(total)?;

        let customer = match map.get("customer") {
            None | Some(Value::Null) => None,
            Some(customer) => Some(parse_customer(customer)?),
        };
        let updated_at = text(map, "updated_at")
            .map(|raw| parse_instant("updated_at", &raw))
            .transpose()?;

        Ok(ExternalReservation {
            external_id,
            external_property_id: text(map, "property_id"),
            status,
            check_in,
            check_out,
            adults,
            children,
            total_amount_cents,
            currency,
            channel_code: text(map, "channel"),
            room_type_external_id: text(map, "room_type_id"),
            customer,
            notes: text(map, "notes"),
            updated_at,
        })
    }

    fn guest_from_external(&self, value: &Value) -> Result<ExternalGuest, MapError> {
        parse_customer(value)
    }

    fn availability_to_external(
        &self,
        room_type_external_id: &str,
        days: &[AvailabilityDay],
    ) -> Value {
        let days: Vec<Value> = days
            .iter()
            .map(|day| {
                json!({
                    "date": format_calendar_date(day.date),
                    "available": day.available,
                    "stop_sell": day.stop_sell,
                })
            })
            .collect();
        json!({ "room_type_id": room_type_external_id, "days": days })
    }

    fn rates_to_external(&self, room_type_external_id: &str, days: &[RateDay]) -> Value {
        let days: Vec<Value> = days
            .iter()
            .map(|day| {
                json!({
                    "date": format_calendar_date(day.date),
                    "amount": format_amount(day.amount_cents),
                    "currency": day.currency,
                })
            })
            .collect();
        json!({ "room_type_id": room_type_external_id, "days": days })
    }

    fn page(&self, body: &Value) -> Result<Page, MapError> {
        let map = object("page", body)?;
        let items = match map.get("data").or_else(|| map.get("items")) {
            Some(Value::Array(items)) => items.clone(),
            None | Some(Value::Null) => return Err(MapError::MissingField("data")),
            Some(other) => {
                return Err(MapError::InvalidField {
                    field: "data",
                    value: other.to_string(),
                })
            }
        };
        Ok(Page {
            items,
            next_cursor: text(map, "next_cursor"),
            has_more: map.get("has_more").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn created_external_id(&self, response: &Value) -> Option<String> {
        let map = response.as_object()?;
        text(map, "id").or_else(|| map.get("data")?.as_object().and_then(|data| text(data, "id")))
    }

    fn webhook_envelope(&self, body: &Value) -> Result<(String, String), MapError> {
        let map = object("webhook", body)?;
        let event_id = text(map, "event_id")
            .or_else(|| text(map, "id"))
            .ok_or(MapError::MissingField("event_id"))?;
        let event_type = text(map, "event_type")
            .or_else(|| text(map, "type"))
            .ok_or(MapError::MissingField("event_type"))?;
        Ok((event_id, event_type))
    }

    fn parse_webhook(&self, event_type: &str, payload: &Value) -> Result<WebhookNotice, MapError> {
        let map = object("webhook", payload)?;
        let data = map.get("data").filter(|data| data.is_object()).cloned();

        let subject = match event_type {
            "reservation.created"
            | "reservation.modified"
            | "reservation.updated"
            | "reservation.cancelled" => {
                let external_id = data
                    .as_ref()
                    .and_then(Value::as_object)
                    .and_then(|data| text(data, "id"))
                    .or_else(|| text(map, "reservation_id"))
                    .ok_or(MapError::MissingField("reservation_id"))?;
                WebhookSubject::Reservation { external_id, data }
            }
            "customer.created" | "customer.updated" => WebhookSubject::Guest {
                data: data.ok_or(MapError::MissingField("data"))?,
            },
            _ => WebhookSubject::Ignored,
        };

        Ok(WebhookNotice {
            external_property_id: text(map, "property_id"),
            subject,
        })
    }
}

/// URL layout of the built-in broker schema
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericRouter;

impl OperationRouter for GenericRouter {
    fn route(&self, operation: &ChannelOperation, payload: Option<Value>) -> ChannelRequest {
        match operation {
            ChannelOperation::PushReservation {
                external_property_id,
                external_id: None,
                idempotency_key,
            } => ChannelRequest::new(
                HttpMethod::Post,
                format!("/properties/{external_property_id}/reservations"),
            )
            .with_idempotency_key(idempotency_key.clone()),
            ChannelOperation::PushReservation {
                external_property_id,
                external_id: Some(external_id),
                ..
            } => ChannelRequest::new(
                HttpMethod::Put,
                format!("/properties/{external_property_id}/reservations/{external_id}"),
            ),
            ChannelOperation::CancelReservation {
                external_property_id,
                external_id,
            } => ChannelRequest::new(
                HttpMethod::Post,
                format!("/properties/{external_property_id}/reservations/{external_id}/cancel"),
            ),
            ChannelOperation::PushAvailability {
                external_property_id,
            } => ChannelRequest::new(
                HttpMethod::Put,
                format!("/properties/{external_property_id}/availability"),
            ),
            ChannelOperation::PushRates {
                external_property_id,
            } => ChannelRequest::new(
                HttpMethod::Put,
                format!("/properties/{external_property_id}/rates"),
            ),
            ChannelOperation::FetchReservations {
                external_property_id,
                cursor,
                page_size,
            } => paged(
                format!("/properties/{external_property_id}/reservations"),
                cursor.as_deref(),
                *page_size,
            ),
            ChannelOperation::FetchReservation {
                external_property_id,
                external_id,
            } => ChannelRequest::new(
                HttpMethod::Get,
                format!("/properties/{external_property_id}/reservations/{external_id}"),
            ),
            ChannelOperation::FetchGuests {
                external_property_id,
                cursor,
                page_size,
            } => paged(
                format!("/properties/{external_property_id}/customers"),
                cursor.as_deref(),
                *page_size,
            ),
        }
        .with_body(payload)
    }
}

fn paged(path: String, cursor: Option<&str>, page_size: u32) -> ChannelRequest {
    let request =
        ChannelRequest::new(HttpMethod::Get, path).with_query("limit", page_size.to_string());
    match cursor {
        Some(cursor) => request.with_query("cursor", cursor),
        None => request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Origin, Reservation, ReservationStatus};
    use chrono::{NaiveDate, Utc};
    use pretty_assertions::assert_eq;

    fn wire() -> Value {
        json!({
            "id": "BK-1001",
            "property_id": "H-42",
            "status": "confirmed",
            "arrival": "2025-01-29",
            "departure": "2025-02-01",
            "adults": 2,
            "total": {"amount": "360.00", "currency": "eur"},
            "channel": "booking_com",
            "room_type_id": "DBL",
            "customer": {
                "id": "C-9",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": " Ada@Example.com ",
                "phone": "+44 20 7946 0000"
            },
            "updated_at": "2025-01-20T10:00:00Z"
        })
    }

    fn local() -> Reservation {
        Reservation {
            id: "r-1".to_string(),
            property_id: "p1".to_string(),
            guest_id: None,
            room_type_id: Some("rt-1".to_string()),
            status: ReservationStatus::Confirmed,
            check_in: NaiveDate::from_ymd_opt(2025, 1, 29).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            adults: 2,
            children: 1,
            total_amount_cents: 36_000,
            currency: "EUR".to_string(),
            origin: Origin::Pms,
            channel_code: None,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_inbound_reservation() {
        let parsed = GenericMapper.reservation_from_external(&wire()).unwrap();
        assert_eq!(parsed.external_id, "BK-1001");
        assert_eq!(parsed.status, ReservationStatus::Confirmed);
        assert_eq!(parsed.check_in.to_string(), "2025-01-29");
        assert_eq!(parsed.children, 0);
        assert_eq!(parsed.total_amount_cents, 36_000);
        assert_eq!(parsed.currency, "EUR");
        let customer = parsed.customer.unwrap();
        assert_eq!(customer.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn outbound_dates_and_amounts_are_canonical() {
        let reservation = local();
        let value = GenericMapper.reservation_to_external(OutboundReservation {
            reservation: &reservation,
            guest: None,
            room_type_external_id: Some("DBL"),
        });
        assert_eq!(value["arrival"], "2025-01-29");
        assert_eq!(value["departure"], "2025-02-01");
        assert_eq!(value["total"]["amount"], "360.00");
        assert_eq!(value["customer"], Value::Null);
        assert_eq!(value["room_type_id"], "DBL");
    }

    #[test]
    fn date_survives_both_directions() {
        let inbound = GenericMapper.reservation_from_external(&wire()).unwrap();
        let mut reservation = local();
        reservation.check_in = inbound.check_in;
        let outbound = GenericMapper.reservation_to_external(OutboundReservation {
            reservation: &reservation,
            guest: None,
            room_type_external_id: None,
        });
        assert_eq!(outbound["arrival"], "2025-01-29");
    }

    #[test]
    fn missing_or_malformed_fields_are_validation_errors() {
        let mut value = wire();
        value.as_object_mut().unwrap().remove("arrival");
        assert_eq!(
            GenericMapper.reservation_from_external(&value).unwrap_err(),
            MapError::MissingField("arrival")
        );

        let mut value = wire();
        value["departure"] = json!("2025-01-01");
        assert!(matches!(
            GenericMapper.reservation_from_external(&value),
            Err(MapError::InvalidField {
                field: "departure",
                ..
            })
        ));

        let mut value = wire();
        value["total"] = json!({"amount": "lots", "currency": "EUR"});
        assert!(GenericMapper.reservation_from_external(&value).is_err());

        assert!(GenericMapper.reservation_from_external(&Value::Null).is_err());
        assert!(GenericMapper.reservation_from_external(&json!([1, 2])).is_err());
    }

    #[test]
    fn fingerprint_ignores_remote_timestamp() {
        let a = GenericMapper.reservation_from_external(&wire()).unwrap();
        let mut later = wire();
        later["updated_at"] = json!("2025-01-21T10:00:00Z");
        let b = GenericMapper.reservation_from_external(&later).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let mut moved = wire();
        moved["arrival"] = json!("2025-01-30");
        let c = GenericMapper.reservation_from_external(&moved).unwrap();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn pages_and_created_ids() {
        let page = GenericMapper
            .page(&json!({"data": [wire()], "next_cursor": "c-2", "has_more": true}))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("c-2"));
        assert!(page.has_more);
        assert!(GenericMapper.page(&json!({"next_cursor": "x"})).is_err());

        assert_eq!(
            GenericMapper.created_external_id(&json!({"data": {"id": "BK-7"}})),
            Some("BK-7".to_string())
        );
        assert_eq!(GenericMapper.created_external_id(&json!(null)), None);
    }

    #[test]
    fn webhook_subjects() {
        let body = json!({
            "event_id": "evt-1",
            "event_type": "reservation.cancelled",
            "property_id": "H-42",
            "reservation_id": "BK-1001"
        });
        let (event_id, event_type) = GenericMapper.webhook_envelope(&body).unwrap();
        assert_eq!(event_id, "evt-1");
        let notice = GenericMapper.parse_webhook(&event_type, &body).unwrap();
        assert_eq!(notice.external_property_id.as_deref(), Some("H-42"));
        assert_eq!(
            notice.subject,
            WebhookSubject::Reservation {
                external_id: "BK-1001".to_string(),
                data: None
            }
        );

        let ignored = GenericMapper
            .parse_webhook("rate_plan.updated", &json!({}))
            .unwrap();
        assert_eq!(ignored.subject, WebhookSubject::Ignored);
        assert!(GenericMapper.webhook_envelope(&json!({"type": "x"})).is_err());
    }

    #[test]
    fn router_paths() {
        let create = GenericRouter.route(
            &ChannelOperation::PushReservation {
                external_property_id: "H-42".to_string(),
                external_id: None,
                idempotency_key: Some("p1:r-1".to_string()),
            },
            Some(json!({})),
        );
        assert_eq!(create.method, HttpMethod::Post);
        assert_eq!(create.path, "/properties/H-42/reservations");
        assert!(create.body.is_some());
        assert_eq!(create.idempotency_key.as_deref(), Some("p1:r-1"));

        let fetch = GenericRouter.route(
            &ChannelOperation::FetchReservations {
                external_property_id: "H-42".to_string(),
                cursor: Some("c-1".to_string()),
                page_size: 50,
            },
            None,
        );
        assert_eq!(fetch.method, HttpMethod::Get);
        assert_eq!(
            fetch.query,
            vec![
                ("limit".to_string(), "50".to_string()),
                ("cursor".to_string(), "c-1".to_string())
            ]
        );
    }
}
