use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::domain::{Pool, PoolMember, PoolStrategy};

use super::{Store, StoreError};

fn row_to_pool(row: &Row) -> rusqlite::Result<Pool> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Pool {
        id: row.get("id")?,
        name: row.get("name")?,
        strategy: PoolStrategy::RoundRobin,
        is_default: row.get::<_, i64>("is_default")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at).unwrap().with_timezone(&Utc),
    })
}

fn row_to_member(row: &Row) -> rusqlite::Result<PoolMember> {
    Ok(PoolMember {
        pool_id: row.get("pool_id")?,
        profile_id: row.get("profile_id")?,
        weight: row.get::<_, i64>("weight")? as u32,
        position: row.get("position")?,
    })
}

impl Store {
    pub fn create_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        debug!(id = %pool.id, name = %pool.name, "Store::create_pool: called");
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO pools (id, name, strategy, is_default, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6)",
            params![pool.id, pool.name, "round_robin", pool.is_default as i64, pool.created_at.to_rfc3339(), pool.updated_at.to_rfc3339()],
        )
        .map_err(StoreError::from_sqlite)?;
        Ok(pool)
    }

    pub fn get_pool(&self, id: &str) -> Result<Pool, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT * FROM pools WHERE id = ?1", params![id], row_to_pool)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("pool {id}")),
                other => StoreError::from_sqlite(other),
            })
    }

    pub fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM pools ORDER BY created_at ASC").map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map([], row_to_pool).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }

    pub fn default_pool(&self) -> Result<Option<Pool>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT * FROM pools WHERE is_default = 1 LIMIT 1", [], row_to_pool)
            .optional()
            .map_err(StoreError::from_sqlite)
    }

    /// Atomically clear every pool's default flag and set it on `id`.
    pub fn set_default_pool(&self, id: &str) -> Result<(), StoreError> {
        debug!(id, "Store::set_default_pool: called");
        self.with_transaction(|tx| {
            tx.execute("UPDATE pools SET is_default = 0", []).map_err(StoreError::from_sqlite)?;
            let affected = tx
                .execute("UPDATE pools SET is_default = 1, updated_at = ?2 WHERE id = ?1", params![id, Utc::now().to_rfc3339()])
                .map_err(StoreError::from_sqlite)?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("pool {id}")));
            }
            Ok(())
        })
    }

    pub fn add_pool_member(&self, member: PoolMember) -> Result<(), StoreError> {
        debug!(pool_id = %member.pool_id, profile_id = %member.profile_id, "Store::add_pool_member: called");
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO pool_members (pool_id, profile_id, weight, position) VALUES (?1,?2,?3,?4)",
            params![member.pool_id, member.profile_id, member.weight as i64, member.position],
        )
        .map_err(StoreError::from_sqlite)?;
        Ok(())
    }

    pub fn list_pool_members(&self, pool_id: &str) -> Result<Vec<PoolMember>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM pool_members WHERE pool_id = ?1 ORDER BY position ASC")
            .map_err(StoreError::from_sqlite)?;
        let rows = stmt.query_map(params![pool_id], row_to_member).map_err(StoreError::from_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from_sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_pool_can_be_default() {
        let store = Store::open_in_memory().unwrap();
        store.create_pool(Pool::new("pool-1", "a")).unwrap();
        store.create_pool(Pool::new("pool-2", "b")).unwrap();
        store.set_default_pool("pool-1").unwrap();
        store.set_default_pool("pool-2").unwrap();
        let pools = store.list_pools().unwrap();
        let defaults: Vec<_> = pools.iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, "pool-2");
    }

    #[test]
    fn default_pool_returns_none_when_unset() {
        let store = Store::open_in_memory().unwrap();
        store.create_pool(Pool::new("pool-1", "a")).unwrap();
        assert!(store.default_pool().unwrap().is_none());
    }

    #[test]
    fn pool_members_are_ordered_by_position() {
        let store = Store::open_in_memory().unwrap();
        store.create_pool(Pool::new("pool-1", "a")).unwrap();
        store
            .add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p2".into(), weight: 1, position: 2 })
            .unwrap();
        store
            .add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p1".into(), weight: 1, position: 1 })
            .unwrap();
        let members = store.list_pool_members("pool-1").unwrap();
        assert_eq!(members[0].profile_id, "p1");
        assert_eq!(members[1].profile_id, "p2");
    }
}
