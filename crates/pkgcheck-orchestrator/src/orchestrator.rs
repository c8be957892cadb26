use pkgcheck_core::{
    CheckError, EvaluationRecord, FreshnessCheck, PackageInfoLookup, PackageRecord, PackageState,
    RuleSet,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{DispatchRequest, EvaluationsApi, JobDispatch, PackageInfoApi, ValidationRequest};

/// Input of [`ValidationOrchestrator::start`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    pub force: bool,
    pub rule_set: Option<Value>,
    pub lookup: Option<PackageInfoLookup>,
    pub package_json: Option<String>,
    pub package_lock: Option<String>,
    pub yarn_lock: Option<String>,
}

pub struct ValidationOrchestrator<'a> {
    package_info: &'a PackageInfoApi<'a>,
    evaluations: &'a EvaluationsApi<'a>,
    freshness: &'a dyn FreshnessCheck,
    dispatcher: &'a dyn JobDispatch,
}

impl<'a> ValidationOrchestrator<'a> {
    #[must_use]
    pub fn new(
        package_info: &'a PackageInfoApi<'a>,
        evaluations: &'a EvaluationsApi<'a>,
        freshness: &'a dyn FreshnessCheck,
        dispatcher: &'a dyn JobDispatch,
    ) -> Self {
        Self {
            package_info,
            evaluations,
            freshness,
            dispatcher,
        }
    }

    /// Resolves `request`, finds or creates its package record and starts
    /// the validation.
    ///
    /// # Errors
    /// Propagates resolution, storage, evaluation and dispatch failures.
    pub fn validate(
        &self,
        request: &ValidationRequest,
        rule_set: Option<Value>,
        force: bool,
    ) -> Result<EvaluationRecord, CheckError> {
        let resolved = self.package_info.resolve_target(request)?;
        let lookup = self.package_info.get_or_create(&resolved)?;
        self.start(&StartRequest {
            force,
            rule_set,
            lookup: Some(lookup),
            package_json: resolved.target.package_json,
            package_lock: resolved.target.package_lock,
            yarn_lock: resolved.target.yarn_lock,
        })
    }

    /// Decides between a cache hit, a synchronous re-score of stored
    /// metadata, and dispatching a new validation job.
    ///
    /// 1. An unexpired record with a stored result is returned as-is.
    /// 2. An unexpired record without a result is scored synchronously when
    ///    the package already succeeded, otherwise it is left in flight.
    /// 3. An expired package is superseded by a fresh `PENDING` record and
    ///    the evaluation is keyed by the new record.
    /// 4. A freshly created or superseded package is dispatched with the
    ///    evaluation id as `cid`.
    ///
    /// # Errors
    /// Returns [`CheckError::InvalidArgument`] without a package lookup and
    /// [`CheckError::Configuration`] for a rule set that does not decode;
    /// neither touches the store. A dispatch failure marks the dispatched
    /// package `FAILED` before the error is returned.
    pub fn start(&self, request: &StartRequest) -> Result<EvaluationRecord, CheckError> {
        let lookup = request
            .lookup
            .as_ref()
            .ok_or_else(|| CheckError::missing("packageInfoLookupResult"))?;
        let package_info = &lookup.package_info;
        let rule_set = request.rule_set.as_ref();
        RuleSet::from_json(rule_set)?;

        let existing = self.evaluations.from_rule_set(package_info.id, rule_set)?;
        let expired = self
            .freshness
            .is_expired(package_info, true, request.force)?;

        if !expired {
            if let Some(existing) = existing {
                return self.resume(package_info, existing);
            }
        }

        let target = if expired {
            self.package_info.create(package_info)?
        } else {
            package_info.clone()
        };
        let evaluation = self.evaluations.create(target.id, rule_set)?;

        if lookup.created || expired {
            self.dispatch(&target, &evaluation, request)?;
            return Ok(evaluation);
        }

        self.resume(&target, evaluation)
    }

    fn resume(
        &self,
        package_info: &PackageRecord,
        evaluation: EvaluationRecord,
    ) -> Result<EvaluationRecord, CheckError> {
        if evaluation.result.is_some() {
            info!(cid = %evaluation.id, package_id = %package_info.id, "evaluation cache hit");
            return Ok(evaluation);
        }

        match &package_info.state {
            PackageState::Succeeded { meta } => {
                info!(
                    cid = %evaluation.id,
                    package_id = %package_info.id,
                    "scoring stored metadata synchronously"
                );
                self.evaluations.evaluate(&evaluation, meta)
            }
            _ => {
                debug!(
                    cid = %evaluation.id,
                    package_id = %package_info.id,
                    state = package_info.state.as_str(),
                    "evaluation still in flight"
                );
                Ok(evaluation)
            }
        }
    }

    fn dispatch(
        &self,
        target: &PackageRecord,
        evaluation: &EvaluationRecord,
        request: &StartRequest,
    ) -> Result<(), CheckError> {
        let dispatch = DispatchRequest {
            cid: evaluation.id,
            package_name: Some(&target.package_name),
            package_json: request.package_json.as_deref(),
            package_lock: request.package_lock.as_deref(),
            yarn_lock: request.yarn_lock.as_deref(),
            is_production: Some(target.is_production),
        };

        if let Err(err) = self.dispatcher.dispatch(&dispatch) {
            if let Err(mark_err) = self.package_info.fail(target.id, &err.to_string()) {
                warn!(
                    package_id = %target.id,
                    error = %mark_err,
                    "could not mark package as failed"
                );
            }
            return Err(err);
        }
        info!(cid = %evaluation.id, package_id = %target.id, "validation dispatched");
        Ok(())
    }
}
