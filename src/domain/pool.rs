//! `Pool`: an ordered set of profiles used for round-robin selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    pub pool_id: String,
    pub profile_id: String,
    pub weight: u32,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub strategy: PoolStrategy,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        let rec = Self {
            id: id.into(),
            name: name.into(),
            strategy: PoolStrategy::RoundRobin,
            is_default: false,
            created_at: now,
            updated_at: now,
        };
        debug!(id = %rec.id, name = %rec.name, "Pool::new: created");
        rec
    }

    pub fn set_default(&mut self, is_default: bool) {
        debug!(id = %self.id, is_default, "Pool::set_default: called");
        self.is_default = is_default;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_not_default() {
        let p = Pool::new("pool-1", "main");
        assert!(!p.is_default);
    }

    #[test]
    fn set_default_mutates_in_place() {
        let mut p = Pool::new("pool-1", "main");
        p.set_default(true);
        assert!(p.is_default);
    }
}
