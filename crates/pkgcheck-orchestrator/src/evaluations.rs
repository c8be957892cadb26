use pkgcheck_core::{
    evaluate_snapshot, now_utc, rule_set_hash, CheckError, EvaluationId, EvaluationRecord,
    EvaluationResult, EvaluationStore, PackageId, PackageState, RuleSet,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::PackageInfoApi;

/// Diagnostic stored on a package record whose evaluation threw.
pub const EVALUATE_FAILURE_MESSAGE: &str = "error in evaluate";

/// Evaluation cache keyed by `(package_info_id, hash(rule_set))`, plus
/// completion of evaluations once metadata is known.
pub struct EvaluationsApi<'a> {
    store: &'a dyn EvaluationStore,
    package_info: &'a PackageInfoApi<'a>,
}

impl<'a> EvaluationsApi<'a> {
    #[must_use]
    pub fn new(store: &'a dyn EvaluationStore, package_info: &'a PackageInfoApi<'a>) -> Self {
        Self {
            store,
            package_info,
        }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn from_rule_set(
        &self,
        package_info_id: PackageId,
        rule_set: Option<&Value>,
    ) -> Result<Option<EvaluationRecord>, CheckError> {
        let rule_set_hash = rule_set_hash(rule_set)?;
        self.store.find_evaluation(package_info_id, &rule_set_hash)
    }

    /// Returns the record for the key, inserting a pending one if absent.
    #[allow(clippy::missing_errors_doc)]
    pub fn create(
        &self,
        package_info_id: PackageId,
        rule_set: Option<&Value>,
    ) -> Result<EvaluationRecord, CheckError> {
        let candidate = EvaluationRecord {
            id: EvaluationId::new(),
            package_info_id,
            created_at: now_utc(),
            rule_set: rule_set.cloned(),
            rule_set_hash: rule_set_hash(rule_set)?,
            result: None,
        };
        let stored = self.store.insert_evaluation_if_absent(&candidate)?;
        if stored.id == candidate.id {
            debug!(cid = %stored.id, package_id = %package_info_id, "evaluation created");
        } else {
            debug!(cid = %stored.id, package_id = %package_info_id, "evaluation already present");
        }
        Ok(stored)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get(&self, cid: EvaluationId) -> Result<Option<EvaluationRecord>, CheckError> {
        self.store.get_evaluation(cid)
    }

    /// Stores `result` unless one is already present; returns whether it was
    /// stored.
    #[allow(clippy::missing_errors_doc)]
    pub fn update_result(
        &self,
        cid: EvaluationId,
        result: &EvaluationResult,
    ) -> Result<bool, CheckError> {
        self.store.set_evaluation_result(cid, result)
    }

    /// Scores `data` with the evaluation's rule set, records the metadata
    /// snapshot on the package and stores the result.
    ///
    /// # Errors
    /// A rule set that does not decode is returned as
    /// [`CheckError::Configuration`] and leaves the package untouched. Any
    /// later failure marks the package `FAILED` before the error is returned.
    pub fn evaluate(
        &self,
        evaluation: &EvaluationRecord,
        data: &Value,
    ) -> Result<EvaluationRecord, CheckError> {
        let rule_set = RuleSet::from_json(evaluation.rule_set.as_ref())?;
        match self.evaluate_and_store(evaluation, &rule_set, data) {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(cid = %evaluation.id, error = %err, "evaluation failed");
                if let Err(mark_err) = self
                    .package_info
                    .fail(evaluation.package_info_id, EVALUATE_FAILURE_MESSAGE)
                {
                    warn!(
                        package_id = %evaluation.package_info_id,
                        error = %mark_err,
                        "could not mark package as failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Records a failure reported by the worker that owns `cid`.
    ///
    /// # Errors
    /// Returns [`CheckError::NotFound`] for an unknown `cid`.
    pub fn fail(&self, cid: EvaluationId, message: &str) -> Result<EvaluationRecord, CheckError> {
        let evaluation = self
            .get(cid)?
            .ok_or_else(|| CheckError::NotFound(format!("evaluation {cid} not exists")))?;
        self.package_info.fail(evaluation.package_info_id, message)?;
        Ok(evaluation)
    }

    fn evaluate_and_store(
        &self,
        evaluation: &EvaluationRecord,
        rule_set: &RuleSet,
        data: &Value,
    ) -> Result<EvaluationRecord, CheckError> {
        let result = evaluate_snapshot(Some(data), Some(rule_set))?;

        self.package_info.update_state(
            evaluation.package_info_id,
            &PackageState::Succeeded { meta: data.clone() },
        )?;
        if self.update_result(evaluation.id, &result)? {
            info!(
                cid = %evaluation.id,
                qualification = result.qualification.as_str(),
                score = result.root_evaluation.aggregate_score,
                "evaluation stored"
            );
        } else {
            debug!(cid = %evaluation.id, "evaluation result already present");
        }

        match self.get(evaluation.id)? {
            Some(stored) => Ok(stored),
            None => Ok(EvaluationRecord {
                result: Some(result),
                ..evaluation.clone()
            }),
        }
    }
}
