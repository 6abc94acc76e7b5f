//! In-process per-entity mutual exclusion.
//!
//! Inbound applies and outbound pushes for the same entity take the same
//! keys. Keys are always acquired in sorted order, so two holders of
//! overlapping key sets cannot deadlock. Cross-process races are caught by
//! the mapping compare-and-set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::models::EntityType;
use crate::{Error, Result};

type Slots = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    External,
}

pub fn entity_key(property_id: &str, entity_type: EntityType, side: Side, id: &str) -> String {
    let side = match side {
        Side::Local => "local",
        Side::External => "external",
    };
    format!("{property_id}:{entity_type}:{side}:{id}")
}

#[derive(Debug, Clone)]
pub struct EntityLocks {
    slots: Slots,
    max_wait: Duration,
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Held keys; released on drop
pub struct EntityGuard {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<String>,
    slots: Slots,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in &self.keys {
            if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(key);
            }
        }
    }
}

impl EntityLocks {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_wait,
        }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Acquire every key, waiting at most `max_wait` in total
    pub async fn lock(&self, mut keys: Vec<String>) -> Result<EntityGuard> {
        keys.sort();
        keys.dedup();

        let acquire = async {
            let mut guards = Vec::with_capacity(keys.len());
            for key in &keys {
                guards.push(self.slot(key).lock_owned().await);
            }
            guards
        };
        let guards = tokio::time::timeout(self.max_wait, acquire)
            .await
            .map_err(|_| Error::LockUnavailable(format!("entity busy: {}", keys.join(", "))))?;

        Ok(EntityGuard {
            guards,
            keys,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        match self.slots.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_holder_waits_then_times_out() {
        let locks = EntityLocks::new(Duration::from_secs(1));
        let key = entity_key("p1", EntityType::Reservation, Side::Local, "r-1");

        let held = locks.lock(vec![key.clone()]).await.unwrap();
        let err = locks.lock(vec![key.clone()]).await.err().unwrap();
        assert!(matches!(err, Error::LockUnavailable(_)));

        drop(held);
        assert!(locks.lock(vec![key]).await.is_ok());
    }

    #[tokio::test]
    async fn overlapping_sets_in_any_order_do_not_deadlock() {
        let locks = EntityLocks::new(Duration::from_secs(5));
        let a = "p1:reservation:local:r-1".to_string();
        let b = "p1:reservation:external:BK-1".to_string();

        let first = {
            let locks = locks.clone();
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _guard = locks.lock(vec![a.clone(), b.clone()]).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let second = {
            let locks = locks.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let _guard = locks.lock(vec![b.clone(), a.clone()]).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }
}
