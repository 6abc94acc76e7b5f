//! In-process PMS used by tests and local demos

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::PmsGateway;
use crate::models::{
    AvailabilityDay, DateRange, Guest, GuestInput, RateDay, Reservation, ReservationInput,
    RoomType,
};
use crate::util::normalize_phone;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Tables {
    reservations: BTreeMap<String, Reservation>,
    guests: BTreeMap<String, Guest>,
    room_types: BTreeMap<String, RoomType>,
    availability: Vec<(String, AvailabilityDay)>,
    rates: Vec<(String, RateDay)>,
}

/// Map-backed PMS. Records are keyed by id; every write bumps a counter so
/// tests can assert that nothing was mutated.
#[derive(Debug, Default)]
pub struct InMemoryPms {
    tables: Mutex<Tables>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl InMemoryPms {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Pms("write rejected by PMS".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of successful write calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with a PMS error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert_reservation(&self, reservation: Reservation) {
        self.tables()
            .reservations
            .insert(reservation.id.clone(), reservation);
    }

    pub fn insert_guest(&self, guest: Guest) {
        self.tables().guests.insert(guest.id.clone(), guest);
    }

    pub fn insert_room_type(&self, room_type: RoomType) {
        self.tables()
            .room_types
            .insert(room_type.id.clone(), room_type);
    }

    pub fn set_availability(&self, property_id: &str, day: AvailabilityDay) {
        let mut tables = self.tables();
        tables.availability.retain(|(p, d)| {
            !(p == property_id && d.room_type_id == day.room_type_id && d.date == day.date)
        });
        tables.availability.push((property_id.to_string(), day));
    }

    pub fn set_rate(&self, property_id: &str, day: RateDay) {
        let mut tables = self.tables();
        tables.rates.retain(|(p, d)| {
            !(p == property_id && d.room_type_id == day.room_type_id && d.date == day.date)
        });
        tables.rates.push((property_id.to_string(), day));
    }

    pub fn reservation(&self, id: &str) -> Option<Reservation> {
        self.tables().reservations.get(id).cloned()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.tables().reservations.values().cloned().collect()
    }

    pub fn guests(&self) -> Vec<Guest> {
        self.tables().guests.values().cloned().collect()
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple())
}

#[async_trait]
impl PmsGateway for InMemoryPms {
    async fn get_reservation(&self, property_id: &str, id: &str) -> Result<Option<Reservation>> {
        Ok(self
            .tables()
            .reservations
            .get(id)
            .filter(|r| r.property_id == property_id)
            .cloned())
    }

    async fn create_reservation(
        &self,
        property_id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation> {
        self.begin_write()?;
        let now = Utc::now();
        let reservation = Reservation {
            id: new_id("res"),
            property_id: property_id.to_string(),
            guest_id: input.guest_id.clone(),
            room_type_id: input.room_type_id.clone(),
            status: input.status,
            check_in: input.check_in,
            check_out: input.check_out,
            adults: input.adults,
            children: input.children,
            total_amount_cents: input.total_amount_cents,
            currency: input.currency.clone(),
            origin: input.origin,
            channel_code: input.channel_code.clone(),
            notes: input.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        self.insert_reservation(reservation.clone());
        Ok(reservation)
    }

    async fn update_reservation(
        &self,
        property_id: &str,
        id: &str,
        input: &ReservationInput,
    ) -> Result<Reservation> {
        self.begin_write()?;
        let mut tables = self.tables();
        let reservation = tables
            .reservations
            .get_mut(id)
            .filter(|r| r.property_id == property_id)
            .ok_or_else(|| Error::NotFound(format!("reservation {id}")))?;
        reservation.guest_id.clone_from(&input.guest_id);
        reservation.room_type_id.clone_from(&input.room_type_id);
        reservation.status = input.status;
        reservation.check_in = input.check_in;
        reservation.check_out = input.check_out;
        reservation.adults = input.adults;
        reservation.children = input.children;
        reservation.total_amount_cents = input.total_amount_cents;
        reservation.currency.clone_from(&input.currency);
        reservation.origin = input.origin;
        reservation.channel_code.clone_from(&input.channel_code);
        reservation.notes.clone_from(&input.notes);
        reservation.updated_at = Utc::now();
        Ok(reservation.clone())
    }

    async fn get_guest(&self, property_id: &str, id: &str) -> Result<Option<Guest>> {
        Ok(self
            .tables()
            .guests
            .get(id)
            .filter(|g| g.property_id == property_id)
            .cloned())
    }

    async fn find_guests_by_email(&self, property_id: &str, email: &str) -> Result<Vec<Guest>> {
        let email = email.trim();
        Ok(self
            .tables()
            .guests
            .values()
            .filter(|g| g.property_id == property_id)
            .filter(|g| {
                g.email
                    .as_deref()
                    .is_some_and(|stored| stored.trim().eq_ignore_ascii_case(email))
            })
            .cloned()
            .collect())
    }

    async fn find_guests_by_phone(&self, property_id: &str, phone: &str) -> Result<Vec<Guest>> {
        Ok(self
            .tables()
            .guests
            .values()
            .filter(|g| g.property_id == property_id)
            .filter(|g| g.phone.as_deref().and_then(normalize_phone).as_deref() == Some(phone))
            .cloned()
            .collect())
    }

    async fn create_guest(&self, property_id: &str, input: &GuestInput) -> Result<Guest> {
        self.begin_write()?;
        let guest = Guest {
            id: new_id("guest"),
            property_id: property_id.to_string(),
            first_name: input.first_name.clone(),
            last_name: input.last_name.clone(),
            email: input.email.clone(),
            phone: input.phone.clone(),
            updated_at: Utc::now(),
        };
        self.insert_guest(guest.clone());
        Ok(guest)
    }

    async fn update_guest(
        &self,
        property_id: &str,
        id: &str,
        input: &GuestInput,
    ) -> Result<Guest> {
        self.begin_write()?;
        let mut tables = self.tables();
        let guest = tables
            .guests
            .get_mut(id)
            .filter(|g| g.property_id == property_id)
            .ok_or_else(|| Error::NotFound(format!("guest {id}")))?;
        guest.first_name.clone_from(&input.first_name);
        guest.last_name.clone_from(&input.last_name);
        guest.email.clone_from(&input.email);
        guest.phone.clone_from(&input.phone);
        guest.updated_at = Utc::now();
        Ok(guest.clone())
    }

    async fn get_room_type(&self, property_id: &str, id: &str) -> Result<Option<RoomType>> {
        Ok(self
            .tables()
            .room_types
            .get(id)
            .filter(|rt| rt.property_id == property_id)
            .cloned())
    }

    async fn list_room_types(&self, property_id: &str) -> Result<Vec<RoomType>> {
        Ok(self
            .tables()
            .room_types
            .values()
            .filter(|rt| rt.property_id == property_id)
            .cloned()
            .collect())
    }

    async fn availability(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<AvailabilityDay>> {
        let mut days: Vec<AvailabilityDay> = self
            .tables()
            .availability
            .iter()
            .filter(|(p, d)| {
                p == property_id
                    && d.room_type_id == room_type_id
                    && d.date >= range.start
                    && d.date < range.end
            })
            .map(|(_, d)| d.clone())
            .collect();
        days.sort_by_key(|d| d.date);
        Ok(days)
    }

    async fn rates(
        &self,
        property_id: &str,
        room_type_id: &str,
        range: DateRange,
    ) -> Result<Vec<RateDay>> {
        let mut days: Vec<RateDay> = self
            .tables()
            .rates
            .iter()
            .filter(|(p, d)| {
                p == property_id
                    && d.room_type_id == room_type_id
                    && d.date >= range.start
                    && d.date < range.end
            })
            .map(|(_, d)| d.clone())
            .collect();
        days.sort_by_key(|d| d.date);
        Ok(days)
    }
}
