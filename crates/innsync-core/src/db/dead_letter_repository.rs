//! Outbound dead-letter repository implementation

#![allow(clippy::cast_possible_wrap)]

use chrono::Utc;
use libsql::{Connection, Row};

use super::row;
use super::schema::Persisted;
use crate::error::Result;
use crate::models::{DeadLetter, DeadLetterId};
use crate::util::to_millis;

/// Trait for dead-letter storage operations (async)
#[allow(async_fn_in_trait)]
pub trait DeadLetterRepository {
    async fn insert(&self, letter: &DeadLetter) -> Result<()>;

    async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetter>>;

    /// Newest first; replayed letters only when asked
    async fn list(&self, include_replayed: bool, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Stamp a letter as replayed. `false` if it already was.
    async fn mark_replayed(&self, id: &DeadLetterId) -> Result<bool>;
}

/// libSQL implementation of `DeadLetterRepository`
pub struct LibSqlDeadLetterRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlDeadLetterRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<DeadLetter> {
        Ok(DeadLetter {
            id: row::parsed(row, 0)?,
            property_id: row::text(row, 1)?,
            entity_key: row::text(row, 2)?,
            event: row::json(row, 3)?,
            attempts: row::count(row, 4)?,
            last_error: row::text(row, 5)?,
            created_at: row::time(row, 6)?,
            replayed_at: row::opt_time(row, 7)?,
        })
    }
}

impl DeadLetterRepository for LibSqlDeadLetterRepository<'_> {
    async fn insert(&self, letter: &DeadLetter) -> Result<()> {
        self.conn
            .execute(
                &DeadLetter::insert_sql(),
                libsql::params![
                    letter.id.as_str(),
                    letter.property_id.clone(),
                    letter.entity_key.clone(),
                    serde_json::to_string(&letter.event)?,
                    i64::from(letter.attempts),
                    letter.last_error.clone(),
                    to_millis(letter.created_at),
                    letter.replayed_at.map(to_millis),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetter>> {
        let sql = format!("{} WHERE id = ?", DeadLetter::select_sql());
        let mut rows = self.conn.query(&sql, [id.as_str()]).await?;
        match rows.next().await? {
            Some(row) => Self::parse(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, include_replayed: bool, limit: usize) -> Result<Vec<DeadLetter>> {
        let filter = if include_replayed {
            ""
        } else {
            " WHERE replayed_at IS NULL"
        };
        let sql = format!(
            "{}{filter} ORDER BY created_at DESC, id DESC LIMIT ?",
            DeadLetter::select_sql()
        );
        let limit = (if limit == 0 { 100 } else { limit }) as i64;
        let mut rows = self.conn.query(&sql, [limit]).await?;
        let mut letters = Vec::new();
        while let Some(row) = rows.next().await? {
            letters.push(Self::parse(&row)?);
        }
        Ok(letters)
    }

    async fn mark_replayed(&self, id: &DeadLetterId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE outbound_dead_letters SET replayed_at = ?
                 WHERE id = ? AND replayed_at IS NULL",
                libsql::params![to_millis(Utc::now()), id.as_str()],
            )
            .await?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ChangeEntity, ChangeEvent, ChangeOperation};

    fn event() -> ChangeEvent {
        ChangeEvent {
            property_id: "p1".to_string(),
            entity: ChangeEntity::Reservation,
            entity_id: "r-1".to_string(),
            operation: ChangeOperation::Updated,
            occurred_at: Utc::now(),
            range: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn letters_replay_once() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlDeadLetterRepository::new(db.connection());
        let letter = DeadLetter::new(event(), 5, "503 Service Unavailable");
        repo.insert(&letter).await.unwrap();

        let stored = repo.get(&letter.id).await.unwrap().unwrap();
        assert_eq!(stored.event, letter.event);
        assert_eq!(stored.entity_key, "p1:reservation:r-1");

        assert!(repo.mark_replayed(&letter.id).await.unwrap());
        assert!(!repo.mark_replayed(&letter.id).await.unwrap());
        assert!(repo.list(false, 10).await.unwrap().is_empty());
        assert_eq!(repo.list(true, 10).await.unwrap().len(), 1);
    }
}
