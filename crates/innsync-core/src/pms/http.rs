//! REST client for a PMS exposing the collaborator API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::PmsGateway;
use crate::models::{
    AvailabilityDay, DateRange, Guest, GuestInput, RateDay, Reservation, ReservationInput,
    RoomType,
};
use crate::util::{compact_text, is_http_url};
use crate::{Error, Result};

#[derive(Clone)]
pub struct HttpPmsGateway {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpPmsGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpPmsGateway")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpPmsGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::Config(format!(
                "PMS API URL must start with http:// or https://, got `{base_url}`"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Pms(sanitize(&error)))?;
        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    fn url(&self, property_id: &str, path: &str) -> String {
        format!("{}/v1/properties/{property_id}/{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| Error::Pms(format!("request failed: {}", sanitize(&error))))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::NotFound(compact_text(&body)));
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Validation(format!(
                "PMS rejected write: {}",
                compact_text(&body)
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Pms(format!(
                "HTTP {}: {}",
                status.as_u16(),
                compact_text(&body)
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| Error::Pms(format!("invalid response: {}", sanitize(&error))))
    }

    async fn get_optional<T: DeserializeOwned>(&self, url: String) -> Result<Option<T>> {
        match self.send(self.client.get(url)).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn range_query(range: DateRange) -> [(&'static str, String); 2] {
        [
            ("from", range.start.format("%Y-%m-%d").to_string()),
            ("to", range.end.format("%Y-%m-%d").to_string()),
        ]
    }
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[async_trait]
impl PmsGateway for HttpPmsGateway {
    async fn get_reservation(&self, property_id: &str, id: &str) -> Result<Option<Reservation>> {
        self.get_optional(self.url(property_id, &format!("reservations/{id}")))
            .await
    }

    async fn create_reservation(
        &self,
        property_id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation> {
        self.send(self.client.post(self.url(property_id, "reservations")).json(input))
            .await
    }

    async fn update_reservation(
        &self,
        property_id: &str,
        id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation> {
        self.send(
            self.client
                .put(self.url(property_id, &format!("reservations/{id}")))
                .json(input),
        )
        .await
    }

    async fn get_guest(&self, property_id: &str, id: &str) -> Result<Option<Guest>> {
        self.get_optional(self.url(property_id, &format!("guests/{id}")))
            .await
    }

    async fn find_guests_by_email(&self, property_id: &str, email: &str) -> Result<Vec<Guest>> {
        self.send(
            self.client
                .get(self.url(property_id, "guests"))
                .query(&[("email", email)]),
        )
        .await
    }

    async fn find_guests_by_phone(&self, property_id: &str, phone: &str) -> Result<Vec<Guest>> {
        self.send(
            self.client
                .get(self.url(property_id, "guests"))
                .query(&[("phone", phone)]),
        )
        .await
    }

    async fn create_guest(&self, property_id: &str, input: &GuestInput) -> Result<Guest> {
        self.send(self.client.post(self.url(property_id, "guests")).json(input))
            .await
    }

    async fn update_guest(
        &self,
        property_id: &str,
        id: &str,
        input: &GuestInput,
    ) -> Result<Guest> {
        self.send(
            self.client
                .put(self.url(property_id, &format!("guests/{id}")))
                .json(input),
        )
        .await
    }

    async fn get_room_type(&self, property_id: &str, id: &str) -> Result<Option<RoomType>> {
        self.get_optional(self.url(property_id, &format!("room-types/{id}")))
            .await
    }

    async fn list_room_types(&self, property_id: &str) -> Result<Vec<RoomType>> {
        self.send(self.client.get(self.url(property_id, "room-types")))
            .await
    }

    async fn availability(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<AvailabilityDay>> {
        self.send(
            self.client
                .get(self.url(
                    property_id,
                    &format!("room-types/{room_type_id}/availability"),
                ))
                .query(&Self::range_query(range)),
        )
        .await
    }

    async fn rates(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<RateDay>> {
        self.send(
            self.client
                .get(self.url(property_id, &format!("room-types/{room_type_id}/rates")))
                .query(&Self::range_query(range)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_property_scoped_urls() {
        let gateway =
            HttpPmsGateway::new("https://pms.example/", "t0k3n", Duration::from_secs(5)).unwrap();
        assert_eq!(
            gateway.url("p1", "reservations/r-1"),
            "https://pms.example/v1/properties/p1/reservations/r-1"
        );
        assert!(!format!("{gateway:?}").contains("t0k3n"));
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(matches!(
            HttpPmsGateway::new("pms.example", "t", Duration::from_secs(5)),
            Err(Error::Config(_))
        ));
    }
}
