//! Conflict detection and the resolution policy table

mod detector;
mod policy;

pub use detector::{detect_reservation_conflicts, Detection};
pub use policy::{decide, plan, Decision, Plan};
