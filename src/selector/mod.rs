//! Pool/Profile selection: resolves a profile for an iteration, honoring
//! per-profile concurrency caps and pool round-robin ordering.

use thiserror::Error;
use tracing::debug;

use crate::domain::{Loop, Profile};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no eligible profile available right now")]
    Unavailable,

    #[error("loop has neither a pinned profile, a pinned pool, nor a default pool")]
    NoPool,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Selector {
    store: Store,
}

impl Selector {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve the profile to use for the next iteration of `loop_`.
    ///
    /// Precedence: pinned profile -> pinned pool -> default pool -> `NoPool`.
    pub fn select(&self, loop_: &Loop) -> Result<Profile, SelectorError> {
        debug!(loop_id = %loop_.id, "Selector::select: called");

        if let Some(profile_id) = &loop_.profile_id {
            let profile = self.store.get_profile(profile_id)?;
            if self.is_eligible(&profile)? {
                return Ok(profile);
            }
            return Err(SelectorError::Unavailable);
        }

        let pool = if let Some(pool_id) = &loop_.pool_id {
            self.store.get_pool(pool_id)?
        } else if let Some(pool) = self.store.default_pool()? {
            pool
        } else {
            return Err(SelectorError::NoPool);
        };

        self.select_from_pool(&pool.id)
    }

    fn is_eligible(&self, profile: &Profile) -> Result<bool, SelectorError> {
        if profile.is_in_cooldown(chrono::Utc::now()) {
            return Ok(false);
        }
        let running = self.store.count_running_for_profile(&profile.id)?;
        Ok(running < profile.max_concurrency)
    }

    /// Round-robin within a pool: advance past the profile most recently
    /// used by any loop drawing from this pool's members, skipping
    /// ineligible members, deriving the cursor from the store rather than
    /// an in-memory singleton so multiple `Selector` instances agree.
    fn select_from_pool(&self, pool_id: &str) -> Result<Profile, SelectorError> {
        let members = self.store.list_pool_members(pool_id)?;
        if members.is_empty() {
            return Err(SelectorError::Unavailable);
        }
        let profile_ids: Vec<String> = members.iter().map(|m| m.profile_id.clone()).collect();
        let cursor = self.store.most_recent_profile_for_pool(&profile_ids)?;

        let start_idx = cursor
            .and_then(|id| members.iter().position(|m| m.profile_id == id))
            .map(|idx| (idx + 1) % members.len())
            .unwrap_or(0);

        for offset in 0..members.len() {
            let idx = (start_idx + offset) % members.len();
            let profile = self.store.get_profile(&members[idx].profile_id)?;
            if self.is_eligible(&profile)? {
                return Ok(profile);
            }
        }
        Err(SelectorError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Pool, PoolMember};

    fn store_with_profile(cap: u32) -> (Store, Profile) {
        let store = Store::open_in_memory().unwrap();
        let profile = store
            .create_profile(Profile::new("p1", "default", "claude", "claude '{prompt}'").with_max_concurrency(cap))
            .unwrap();
        (store, profile)
    }

    #[test]
    fn pinned_profile_is_selected_directly() {
        let (store, _profile) = store_with_profile(1);
        let selector = Selector::new(store.clone());
        let loop_ = Loop::new("l1", "", "demo", "/repo").with_profile("p1");
        let selected = selector.select(&loop_).unwrap();
        assert_eq!(selected.id, "p1");
    }

    #[test]
    fn pinned_profile_at_cap_is_unavailable() {
        let (store, _) = store_with_profile(1);
        store.start_run(crate::domain::LoopRun::start("r1", "other", Some("p1".into()), crate::domain::PromptSource::Base), None).unwrap();
        let selector = Selector::new(store);
        let loop_ = Loop::new("l1", "", "demo", "/repo").with_profile("p1");
        let err = selector.select(&loop_).unwrap_err();
        assert!(matches!(err, SelectorError::Unavailable));
    }

    #[test]
    fn no_pool_and_no_profile_is_no_pool_error() {
        let store = Store::open_in_memory().unwrap();
        let selector = Selector::new(store);
        let loop_ = Loop::new("l1", "", "demo", "/repo");
        let err = selector.select(&loop_).unwrap_err();
        assert!(matches!(err, SelectorError::NoPool));
    }

    #[test]
    fn default_pool_is_used_when_loop_pins_neither() {
        let store = Store::open_in_memory().unwrap();
        store.create_profile(Profile::new("p1", "default", "claude", "claude")).unwrap();
        let pool = store.create_pool(Pool::new("pool-1", "main")).unwrap();
        store.set_default_pool(&pool.id).unwrap();
        store.add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p1".into(), weight: 1, position: 1 }).unwrap();

        let selector = Selector::new(store);
        let loop_ = Loop::new("l1", "", "demo", "/repo");
        let selected = selector.select(&loop_).unwrap();
        assert_eq!(selected.id, "p1");
    }

    #[test]
    fn round_robin_cycles_through_pool_members() {
        let store = Store::open_in_memory().unwrap();
        store.create_profile(Profile::new("p1", "one", "claude", "claude")).unwrap();
        store.create_profile(Profile::new("p2", "two", "claude", "claude")).unwrap();
        let pool = store.create_pool(Pool::new("pool-1", "main")).unwrap();
        store.add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p1".into(), weight: 1, position: 1 }).unwrap();
        store.add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p2".into(), weight: 1, position: 2 }).unwrap();

        let selector = Selector::new(store.clone());
        let loop_ = Loop::new("l1", "", "demo", "/repo").with_pool("pool-1");
        let first = selector.select(&loop_).unwrap();

        // Simulate that `first` was just used by recording a finished run.
        store.start_run(crate::domain::LoopRun::start("r1", "l1", Some(first.id.clone()), crate::domain::PromptSource::Base), None).unwrap();

        let second = selector.select(&loop_).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn all_members_ineligible_is_unavailable() {
        let (store, _) = store_with_profile(1);
        let pool = store.create_pool(Pool::new("pool-1", "main")).unwrap();
        store.add_pool_member(PoolMember { pool_id: "pool-1".into(), profile_id: "p1".into(), weight: 1, position: 1 }).unwrap();
        store.start_run(crate::domain::LoopRun::start("r1", "other", Some("p1".into()), crate::domain::PromptSource::Base), None).unwrap();

        let selector = Selector::new(store);
        let loop_ = Loop::new("l1", "", "demo", "/repo").with_pool(pool.id);
        let err = selector.select(&loop_).unwrap_err();
        assert!(matches!(err, SelectorError::Unavailable));
    }
}
