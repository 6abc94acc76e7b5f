//! Data models for innsync

/// Declares a fieldless enum stored as a snake_case string column.
macro_rules! db_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Column representation
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::Error::InvalidInput(format!(
                        "unknown {} `{other}`",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

mod conflict;
mod dead_letter;
mod domain;
mod ids;
mod mapping;
mod settings;
mod sync_log;
mod sync_state;
mod webhook_event;

pub use conflict::{Conflict, ConflictType, NewConflict, ResolutionAction, ResolutionStrategy};
pub use dead_letter::DeadLetter;
pub use domain::{
    AvailabilityDay, ChangeEntity, ChangeEvent, ChangeOperation, DateRange, EntityType, Guest,
    GuestInput, Origin, RateDay, Reservation, ReservationInput, ReservationStatus, RoomType,
};
pub use ids::{ConflictId, DeadLetterId, LogId, MappingId, RunId};
pub use mapping::{MatchConfidence, MatchMethod, NewMapping, SyncDirection, SyncMapping};
pub use settings::{PropertySettings, TimestampWinner};
pub use sync_log::{Direction, SyncLog, SyncOperation};
pub use sync_state::{RunTrigger, SyncState, SyncStats, SyncStatus, SyncType};
pub use webhook_event::WebhookEvent;

#[cfg(test)]
mod tests {
    use crate::Result;

    db_enum! {
        Shade {
            Light => "light",
            Dark => "dark",
        }
    }

    fn parse_shade(raw: &str) -> Result<Shade> {
        raw.parse()
    }

    #[test]
    fn db_enum_expands_next_to_crate_result() {
        assert_eq!(parse_shade(" dark ").unwrap(), Shade::Dark);
        assert_eq!(Shade::Light.to_string(), "light");
        assert!(matches!(
            parse_shade("dim"),
            Err(crate::Error::InvalidInput(message)) if message.contains("Shade")
        ));
    }
}
