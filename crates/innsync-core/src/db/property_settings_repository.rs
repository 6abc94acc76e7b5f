//! Per-property policy override repository

use libsql::{Connection, Row};

use super::row;
use super::schema::Persisted;
use crate::error::{Error, Result};
use crate::models::PropertySettings;
use crate::util::to_millis;

/// Trait for property settings storage operations (async)
#[allow(async_fn_in_trait)]
pub trait PropertySettingsRepository {
    async fn get(&self, property_id: &str) -> Result<Option<PropertySettings>>;

    async fn save(&self, settings: &PropertySettings) -> Result<()>;

    async fn delete(&self, property_id: &str) -> Result<bool>;
}

/// libSQL implementation of `PropertySettingsRepository`
pub struct LibSqlPropertySettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlPropertySettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<PropertySettings> {
        Ok(PropertySettings {
            property_id: row::text(row, 0)?,
            amount_tolerance_percent: row.get::<Option<f64>>(1)?,
            timestamp_winner: row::opt_parsed(row, 2)?,
            updated_at: row::time(row, 3)?,
        })
    }
}

impl PropertySettingsRepository for LibSqlPropertySettingsRepository<'_> {
    async fn get(&self, property_id: &str) -> Result<Option<PropertySettings>> {
        let sql = format!("{} WHERE property_id = ?", PropertySettings::select_sql());
        let mut rows = self.conn.query(&sql, [property_id]).await?;
        match rows.next().await? {
            Some(row) => Self::parse(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, settings: &PropertySettings) -> Result<()> {
        if let Some(tolerance) = settings.amount_tolerance_percent {
            if !(0.0..=100.0).contains(&tolerance) {
                return Err(Error::InvalidInput(format!(
                    "amount tolerance must be within 0..=100, got {tolerance}"
                )));
            }
        }
        let sql =
            PropertySettings::insert_sql().replacen("INSERT INTO", "INSERT OR REPLACE INTO", 1);
        self.conn
            .execute(
                &sql,
                libsql::params![
                    settings.property_id.clone(),
                    settings.amount_tolerance_percent,
                    settings.timestamp_winner.map(|w| w.as_str()),
                    to_millis(settings.updated_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, property_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM property_settings WHERE property_id = ?",
                [property_id],
            )
            .await?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::TimestampWinner;

    #[tokio::test(flavor = "multi_thread")]
    async fn save_load_and_delete() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlPropertySettingsRepository::new(db.connection());

        assert!(repo.get("p1").await.unwrap().is_none());

        let mut settings = PropertySettings::new("p1");
        settings.amount_tolerance_percent = Some(2.5);
        settings.timestamp_winner = Some(TimestampWinner::Remote);
        repo.save(&settings).await.unwrap();

        let loaded = repo.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded.amount_tolerance_percent, Some(2.5));
        assert_eq!(loaded.timestamp_winner, Some(TimestampWinner::Remote));

        assert!(repo.delete("p1").await.unwrap());
        assert!(repo.get("p1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_out_of_range_tolerance() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlPropertySettingsRepository::new(db.connection());
        let mut settings = PropertySettings::new("p1");
        settings.amount_tolerance_percent = Some(150.0);
        assert!(matches!(
            repo.save(&settings).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
