use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::ports::{EvaluationStore, PackageStore};
use crate::{
    CheckError, EvaluationId, EvaluationRecord, EvaluationResult, PackageId, PackageRecord,
    PackageState,
};

#[derive(Debug, Default)]
struct MemoryState {
    packages: BTreeMap<PackageId, PackageRecord>,
    evaluations: BTreeMap<EvaluationId, EvaluationRecord>,
    evaluation_index: BTreeMap<(PackageId, String), EvaluationId>,
}

/// Process-local backend. Evaluation records are addressed through an index
/// keyed by `(package_info_id, rule_set_hash)`, so dedup does not depend on
/// any storage engine constraint.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All package records sharing `hash`, oldest first.
    ///
    /// # Errors
    /// Returns [`CheckError::Storage`] if the store lock is poisoned.
    pub fn packages_with_hash(&self, hash: &str) -> Result<Vec<PackageRecord>, CheckError> {
        let state = self.lock()?;
        let mut records: Vec<PackageRecord> = state
            .packages
            .values()
            .filter(|record| record.hash == hash)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.created_at, record.id));
        Ok(records)
    }

    /// Number of stored evaluation records.
    ///
    /// # Errors
    /// Returns [`CheckError::Storage`] if the store lock is poisoned.
    pub fn evaluation_count(&self) -> Result<usize, CheckError> {
        Ok(self.lock()?.evaluations.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, CheckError> {
        self.state
            .lock()
            .map_err(|_| CheckError::Storage("in-memory store lock poisoned".to_string()))
    }
}

impl PackageStore for InMemoryStore {
    fn find_latest_by_hash(&self, hash: &str) -> Result<Option<PackageRecord>, CheckError> {
        let state = self.lock()?;
        Ok(state
            .packages
            .values()
            .filter(|record| record.hash == hash && record.latest)
            .max_by_key(|record| (record.created_at, record.id))
            .cloned())
    }

    fn get_package(&self, id: PackageId) -> Result<Option<PackageRecord>, CheckError> {
        Ok(self.lock()?.packages.get(&id).cloned())
    }

    fn insert_package(&self, record: &PackageRecord) -> Result<(), CheckError> {
        let mut state = self.lock()?;
        if state.packages.contains_key(&record.id) {
            return Err(CheckError::Storage(format!(
                "package record {} already exists",
                record.id
            )));
        }
        if record.latest {
            for sibling in state.packages.values_mut() {
                if sibling.hash == record.hash {
                    sibling.latest = false;
                }
            }
        }
        state.packages.insert(record.id, record.clone());
        Ok(())
    }

    fn update_package_state(
        &self,
        id: PackageId,
        package_state: &PackageState,
    ) -> Result<bool, CheckError> {
        let mut state = self.lock()?;
        Ok(match state.packages.get_mut(&id) {
            Some(record) => {
                record.state = package_state.clone();
                true
            }
            None => false,
        })
    }

    fn invalidate_hash(&self, hash: &str) -> Result<usize, CheckError> {
        let mut state = self.lock()?;
        let mut touched = 0;
        for record in state.packages.values_mut() {
            if record.hash == hash && record.latest {
                record.latest = false;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

impl EvaluationStore for InMemoryStore {
    fn find_evaluation(
        &self,
        package_info_id: PackageId,
        rule_set_hash: &str,
    ) -> Result<Option<EvaluationRecord>, CheckError> {
        let state = self.lock()?;
        Ok(state
            .evaluation_index
            .get(&(package_info_id, rule_set_hash.to_string()))
            .and_then(|id| state.evaluations.get(id))
            .cloned())
    }

    fn insert_evaluation_if_absent(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationRecord, CheckError> {
        let mut state = self.lock()?;
        let key = (record.package_info_id, record.rule_set_hash.clone());
        if let Some(existing) = state
            .evaluation_index
            .get(&key)
            .and_then(|id| state.evaluations.get(id))
        {
            return Ok(existing.clone());
        }

        state.evaluation_index.insert(key, record.id);
        state.evaluations.insert(record.id, record.clone());
        Ok(record.clone())
    }

    fn get_evaluation(&self, id: EvaluationId) -> Result<Option<EvaluationRecord>, CheckError> {
        Ok(self.lock()?.evaluations.get(&id).cloned())
    }

    fn set_evaluation_result(
        &self,
        id: EvaluationId,
        result: &EvaluationResult,
    ) -> Result<bool, CheckError> {
        let mut state = self.lock()?;
        Ok(match state.evaluations.get_mut(&id) {
            Some(record) if record.result.is_none() => {
                record.result = Some(result.clone());
                true
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_utc, EvaluationTree, Qualification};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn evaluation(package_info_id: PackageId, rule_set_hash: &str) -> EvaluationRecord {
        EvaluationRecord {
            id: EvaluationId::new(),
            package_info_id,
            created_at: now_utc(),
            rule_set: None,
            rule_set_hash: rule_set_hash.to_string(),
            result: None,
        }
    }

    fn result() -> EvaluationResult {
        EvaluationResult {
            root_evaluation: EvaluationTree {
                node_name: "a".to_string(),
                node_version: "1.0.0".to_string(),
                node_score: 1.0,
                aggregate_score: 1.0,
                evaluations: Vec::new(),
                dependencies: Vec::new(),
            },
            qualification: Qualification::Accepted,
        }
    }

    #[test]
    fn inserting_latest_record_demotes_siblings() {
        let store = InMemoryStore::new();
        let first = PackageRecord::pending("a", false, "h", now_utc());
        let second = PackageRecord::pending("a", false, "h", now_utc());
        must_ok(store.insert_package(&first));
        must_ok(store.insert_package(&second));

        let latest: Vec<PackageId> = must_ok(store.packages_with_hash("h"))
            .into_iter()
            .filter(|record| record.latest)
            .map(|record| record.id)
            .collect();
        assert_eq!(latest, vec![second.id]);
        assert_eq!(
            must_ok(store.find_latest_by_hash("h")).map(|record| record.id),
            Some(second.id)
        );
    }

    #[test]
    fn invalidate_hash_is_set_based_and_idempotent() {
        let store = InMemoryStore::new();
        must_ok(store.insert_package(&PackageRecord::pending("a", false, "h", now_utc())));
        must_ok(store.insert_package(&PackageRecord::pending("b", false, "other", now_utc())));

        assert_eq!(must_ok(store.invalidate_hash("h")), 1);
        assert_eq!(must_ok(store.invalidate_hash("h")), 0);
        assert!(must_ok(store.find_latest_by_hash("h")).is_none());
        assert!(must_ok(store.find_latest_by_hash("other")).is_some());
    }

    #[test]
    fn evaluation_insert_is_idempotent_on_key() {
        let store = InMemoryStore::new();
        let package_id = PackageId::new();
        let first = must_ok(store.insert_evaluation_if_absent(&evaluation(package_id, "r")));
        let second = must_ok(store.insert_evaluation_if_absent(&evaluation(package_id, "r")));
        assert_eq!(first.id, second.id);
        assert_eq!(must_ok(store.evaluation_count()), 1);

        let other = must_ok(store.insert_evaluation_if_absent(&evaluation(package_id, "r2")));
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn result_is_written_exactly_once() {
        let store = InMemoryStore::new();
        let record = must_ok(store.insert_evaluation_if_absent(&evaluation(PackageId::new(), "r")));
        assert!(must_ok(store.set_evaluation_result(record.id, &result())));
        assert!(!must_ok(store.set_evaluation_result(record.id, &result())));
        assert!(!must_ok(store.set_evaluation_result(EvaluationId::new(), &result())));
    }
}
