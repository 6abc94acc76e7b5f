//! Ports to the property-management system.
//!
//! The PMS owns reservations, guests, room types and inventory. The engine
//! reads them for outbound pushes and writes them when applying inbound data.

mod http;
mod memory;

use async_trait::async_trait;

use crate::models::{
    AvailabilityDay, DateRange, Guest, GuestInput, RateDay, Reservation, ReservationInput,
    RoomType,
};
use crate::Result;

pub use http::HttpPmsGateway;
pub use memory::InMemoryPms;

#[async_trait]
pub trait PmsGateway: Send + Sync {
    async fn get_reservation(&self, property_id: &str, id: &str) -> Result<Option<Reservation>>;

    async fn create_reservation(
        &self,
        property_id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation>;

    async fn update_reservation(
        &self,
        property_id: &str,
        id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation>;

    async fn get_guest(&self, property_id: &str, id: &str) -> Result<Option<Guest>>;

    /// Guests whose email equals `email`, ignoring case
    async fn find_guests_by_email(&self, property_id: &str, email: &str) -> Result<Vec<Guest>>;

    /// Guests whose normalized phone equals `phone` (see [`crate::util::normalize_phone`])
    async fn find_guests_by_phone(&self, property_id: &str, phone: &str) -> Result<Vec<Guest>>;

    async fn create_guest(&self, property_id: &str, input: &GuestInput) -> Result<Guest>;

    async fn update_guest(&self, property_id: &str, id: &str, input: &GuestInput)
        -> Result<Guest>;

    async fn get_room_type(&self, property_id: &str, id: &str) -> Result<Option<RoomType>>;

    async fn list_room_types(&self, property_id: &str) -> Result<Vec<RoomType>>;

    async fn availability(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<AvailabilityDay>>;

    async fn rates(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<RateDay>>;
}
