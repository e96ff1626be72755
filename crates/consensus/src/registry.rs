//! Validator registry - the fixed authority set and round-robin selection
//!
//! The registry keeps the validator set in memory, sorted by registration
//! order, and writes every metric change through to the ledger store so a
//! restarted node resumes with the same uptime and rewards.

use crate::types::{ValidationReport, ValidationVote};
use l2_runtime::{Address, Block, ChainError, ChainResult, LedgerStore, ProducerSchedule, Validator};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

/// How uptime moves on success and failure
#[derive(Debug, Clone, Copy)]
pub struct UptimePolicy {
    /// Percentage points gained per produced block or confirmed validation
    pub recovery: f64,
    /// Percentage points lost per abandoned tick or failed validation
    pub penalty: f64,
}

impl Default for UptimePolicy {
    fn default() -> Self {
        Self {
            recovery: 0.1,
            penalty: 1.0,
        }
    }
}

impl UptimePolicy {
    fn reward(&self, uptime: f64) -> f64 {
        (uptime + self.recovery).min(100.0)
    }

    fn punish(&self, uptime: f64) -> f64 {
        (uptime - self.penalty).max(0.0)
    }
}

pub struct ValidatorRegistry {
    store: Arc<LedgerStore>,
    validators: RwLock<Vec<Validator>>,
    /// Highest height each validator has been scored for
    last_votes: Mutex<HashMap<Address, u64>>,
    policy: UptimePolicy,
}

impl ValidatorRegistry {
    /// Load the validator set persisted at genesis
    pub fn load(store: Arc<LedgerStore>, policy: UptimePolicy) -> ChainResult<Self> {
        let validators = store.list_validators()?;
        tracing::info!(
            "Loaded {} validators ({} active)",
            validators.len(),
            validators.iter().filter(|v| v.active).count()
        );
        Ok(Self {
            store,
            validators: RwLock::new(validators),
            last_votes: Mutex::new(HashMap::new()),
            policy,
        })
    }

    /// All validators in registration order
    pub fn list(&self) -> Vec<Validator> {
        self.validators.read().clone()
    }

    pub fn get(&self, address: &Address) -> Option<Validator> {
        self.validators
            .read()
            .iter()
            .find(|v| &v.address == address)
            .cloned()
    }

    /// Active validators in rotation order
    pub fn active(&self) -> Vec<Validator> {
        self.validators
            .read()
            .iter()
            .filter(|v| v.active)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.validators.read().iter().filter(|v| v.active).count()
    }

    /// Stake held by active validators
    pub fn total_staked(&self) -> u128 {
        self.validators
            .read()
            .iter()
            .filter(|v| v.active)
            .map(|v| v.stake)
            .sum()
    }

    /// Round-robin producer for `height`: index `(height - 1) mod active`,
    /// genesis goes to the first active validator
    pub fn select_producer(&self, height: u64) -> Option<Address> {
        let validators = self.validators.read();
        let active: Vec<&Validator> = validators.iter().filter(|v| v.active).collect();
        if active.is_empty() {
            return None;
        }
        let index = height.saturating_sub(1) % active.len() as u64;
        Some(active[index as usize].address)
    }

    /// Activate or deactivate a validator; inactive validators leave the rotation
    pub fn set_active(&self, address: &Address, active: bool) -> ChainResult<Validator> {
        self.update(address, |v| v.active = active)
    }

    /// Credit a produced block: fees to rewards, uptime recovers
    pub fn record_produced(&self, address: &Address, fees: u128) -> ChainResult<Validator> {
        let policy = self.policy;
        self.update(address, |v| {
            v.blocks_produced += 1;
            v.rewards = v.rewards.saturating_add(fees);
            v.uptime = policy.reward(v.uptime);
        })
    }

    /// Penalize an abandoned production tick
    pub fn record_missed(&self, address: &Address) -> ChainResult<Validator> {
        let policy = self.policy;
        self.update(address, |v| v.uptime = policy.punish(v.uptime))
    }

    /// Adjust uptime after a validation round
    pub fn record_validation(&self, address: &Address, confirmed: bool) -> ChainResult<Validator> {
        let policy = self.policy;
        self.update(address, |v| {
            v.uptime = if confirmed {
                policy.reward(v.uptime)
            } else {
                policy.punish(v.uptime)
            }
        })
    }

    /// Check a validator's vote against the stored chain and record the outcome.
    ///
    /// A vote is confirmed when the validator approves the block and its hash
    /// matches the block stored at that height. Only the first vote a validator
    /// casts above its last scored height moves uptime; repeats are reported
    /// with the current uptime.
    pub fn process_vote(&self, vote: &ValidationVote) -> ChainResult<ValidationReport> {
        let current = self
            .get(&vote.validator)
            .ok_or_else(|| ChainError::NotFound(format!("validator {}", vote.validator)))?;

        let matches = match self.store.get_block(vote.height) {
            Ok(block) => block.hash == vote.hash,
            Err(ChainError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        let confirmed = vote.valid && matches;

        let fresh = {
            let mut last_votes = self.last_votes.lock();
            match last_votes.get(&vote.validator) {
                Some(&last) if vote.height <= last => false,
                _ => {
                    last_votes.insert(vote.validator, vote.height);
                    true
                }
            }
        };

        let validator = if fresh {
            self.record_validation(&vote.validator, confirmed)?
        } else {
            tracing::debug!(
                "Ignoring repeat vote from {} for block {}",
                current.name,
                vote.height
            );
            current
        };

        if fresh && !confirmed {
            tracing::warn!(
                "Validator {} failed validation of block {} (vote: {}, hash match: {})",
                validator.name,
                vote.height,
                vote.valid,
                matches
            );
        }

        Ok(ValidationReport {
            validator: validator.address,
            name: validator.name,
            height: vote.height,
            hash: vote.hash,
            valid: vote.valid,
            confirmed,
            uptime: validator.uptime,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    fn update<F>(&self, address: &Address, f: F) -> ChainResult<Validator>
    where
        F: FnOnce(&mut Validator),
    {
        let updated = {
            let mut validators = self.validators.write();
            let validator = validators
                .iter_mut()
                .find(|v| &v.address == address)
                .ok_or_else(|| ChainError::NotFound(format!("validator {}", address)))?;
            f(validator);
            validator.clone()
        };
        self.store.upsert_validator(&updated)?;
        Ok(updated)
    }
}

impl ProducerSchedule for ValidatorRegistry {
    fn producer_for(&self, height: u64) -> Option<Address> {
        self.select_producer(height)
    }

    fn block_produced(&self, producer: &Address, block: &Block, fees: u128) {
        if let Err(e) = self.record_produced(producer, fees) {
            tracing::warn!("Failed to credit producer of block {}: {}", block.height, e);
        }
    }

    fn production_failed(&self, producer: &Address, height: u64) {
        match self.record_missed(producer) {
            Ok(v) => tracing::warn!(
                "Validator {} missed block {}, uptime {:.1}%",
                v.name,
                height,
                v.uptime
            ),
            Err(e) => tracing::warn!("Failed to record missed block {}: {}", height, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l2_runtime::{genesis, ChainParams, GenesisConfig, H256};
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, Arc<LedgerStore>, ValidatorRegistry) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        genesis::initialize(&store, &GenesisConfig::development(), &ChainParams::default()).unwrap();
        let registry = ValidatorRegistry::load(store.clone(), UptimePolicy::default()).unwrap();
        (dir, store, registry)
    }

    #[test]
    fn test_round_robin() {
        let (_dir, _store, registry) = registry();
        let v: Vec<_> = registry.list().iter().map(|v| v.address).collect();

        let producers: Vec<_> = (1..=6).map(|h| registry.select_producer(h).unwrap()).collect();
        assert_eq!(producers, vec![v[0], v[1], v[2], v[0], v[1], v[2]]);
        assert_eq!(registry.select_producer(0), Some(v[0]));
    }

    #[test]
    fn test_inactive_validators_are_skipped() {
        let (_dir, _store, registry) = registry();
        let v: Vec<_> = registry.list().iter().map(|v| v.address).collect();

        registry.set_active(&v[1], false).unwrap();
        let producers: Vec<_> = (1..=4).map(|h| registry.select_producer(h).unwrap()).collect();
        assert_eq!(producers, vec![v[0], v[2], v[0], v[2]]);
        assert_eq!(registry.active_count(), 2);

        registry.set_active(&v[0], false).unwrap();
        registry.set_active(&v[2], false).unwrap();
        assert!(registry.select_producer(1).is_none());
        assert_eq!(registry.total_staked(), 0);
    }

    #[test]
    fn test_uptime_bounds_and_rewards() {
        let (_dir, store, registry) = registry();
        let addr = registry.list()[0].address;

        let v = registry.record_produced(&addr, 500).unwrap();
        assert_eq!(v.uptime, 100.0);
        assert_eq!(v.rewards, 500);
        assert_eq!(v.blocks_produced, 1);

        for _ in 0..150 {
            registry.record_missed(&addr).unwrap();
        }
        assert_eq!(registry.get(&addr).unwrap().uptime, 0.0);

        let v = registry.record_validation(&addr, true).unwrap();
        assert!((v.uptime - 0.1).abs() < 1e-9);

        // written through to the store
        let reloaded = ValidatorRegistry::load(store, UptimePolicy::default()).unwrap();
        assert_eq!(reloaded.get(&addr).unwrap().rewards, 500);
    }

    #[test]
    fn test_process_vote() {
        let (_dir, store, registry) = registry();
        let addr = registry.list()[1].address;
        let genesis_hash = store.get_block(0).unwrap().hash;

        registry.record_missed(&addr).unwrap();
        let report = registry
            .process_vote(&ValidationVote {
                validator: addr,
                height: 0,
                hash: genesis_hash,
                valid: true,
            })
            .unwrap();
        assert!(report.confirmed);
        assert!((report.uptime - 99.1).abs() < 1e-9);

        let report = registry
            .process_vote(&ValidationVote {
                validator: addr,
                height: 0,
                hash: H256::zero(),
                valid: true,
            })
            .unwrap();
        assert!(!report.confirmed);
        // already scored for height 0
        assert!((report.uptime - 99.1).abs() < 1e-9);

        let unknown = registry.process_vote(&ValidationVote {
            validator: Address([9u8; 20]),
            height: 0,
            hash: genesis_hash,
            valid: true,
        });
        assert!(matches!(unknown, Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_repeat_votes_do_not_move_uptime() {
        let (_dir, store, registry) = registry();
        let addr = registry.list()[2].address;
        let genesis_hash = store.get_block(0).unwrap().hash;
        for _ in 0..5 {
            registry.record_missed(&addr).unwrap();
        }

        let vote = ValidationVote {
            validator: addr,
            height: 0,
            hash: genesis_hash,
            valid: true,
        };
        let first = registry.process_vote(&vote).unwrap();
        assert!((first.uptime - 95.1).abs() < 1e-9);

        for _ in 0..10 {
            let report = registry.process_vote(&vote).unwrap();
            assert!(report.confirmed);
            assert!((report.uptime - 95.1).abs() < 1e-9);
        }
        assert!((registry.get(&addr).unwrap().uptime - 95.1).abs() < 1e-9);

        // a failing repeat is not penalized either
        let report = registry
            .process_vote(&ValidationVote { valid: false, ..vote })
            .unwrap();
        assert!(!report.confirmed);
        assert!((report.uptime - 95.1).abs() < 1e-9);

        // votes are tracked per validator
        let other = registry.list()[0].address;
        let report = registry
            .process_vote(&ValidationVote { validator: other, ..vote })
            .unwrap();
        assert_eq!(report.uptime, 100.0);
        assert!(report.confirmed);
    }
}
