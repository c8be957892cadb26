use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    CheckError, EvaluationId, EvaluationRecord, EvaluationResult, PackageId, PackageRecord,
    PackageState,
};

/// Document store holding package records.
pub trait PackageStore {
    #[allow(clippy::missing_errors_doc)]
    fn find_latest_by_hash(&self, hash: &str) -> Result<Option<PackageRecord>, CheckError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_package(&self, id: PackageId) -> Result<Option<PackageRecord>, CheckError>;

    /// Stores `record`. A record inserted with `latest = true` becomes the
    /// only latest record for its hash.
    #[allow(clippy::missing_errors_doc)]
    fn insert_package(&self, record: &PackageRecord) -> Result<(), CheckError>;

    #[allow(clippy::missing_errors_doc)]
    fn update_package_state(&self, id: PackageId, state: &PackageState)
        -> Result<bool, CheckError>;

    /// Set-based `latest = false` for every record sharing `hash`. Returns the
    /// number of records touched.
    #[allow(clippy::missing_errors_doc)]
    fn invalidate_hash(&self, hash: &str) -> Result<usize, CheckError>;
}

/// Document store holding evaluation records, unique on
/// `(package_info_id, rule_set_hash)`.
pub trait EvaluationStore {
    #[allow(clippy::missing_errors_doc)]
    fn find_evaluation(
        &self,
        package_info_id: PackageId,
        rule_set_hash: &str,
    ) -> Result<Option<EvaluationRecord>, CheckError>;

    /// Inserts `record` unless one already exists for its key; returns the
    /// stored record either way.
    #[allow(clippy::missing_errors_doc)]
    fn insert_evaluation_if_absent(
        &self,
        record: &EvaluationRecord,
    ) -> Result<EvaluationRecord, CheckError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_evaluation(&self, id: EvaluationId) -> Result<Option<EvaluationRecord>, CheckError>;

    /// Sets the result only while it is still unset. Returns whether a
    /// record was updated.
    #[allow(clippy::missing_errors_doc)]
    fn set_evaluation_result(
        &self,
        id: EvaluationId,
        result: &EvaluationResult,
    ) -> Result<bool, CheckError>;
}

/// Client of a durable queue with publisher confirms.
pub trait QueueChannel {
    #[allow(clippy::missing_errors_doc)]
    fn assert_queue(&self, queue: &str) -> Result<(), CheckError>;

    #[allow(clippy::missing_errors_doc)]
    fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<(), CheckError>;

    /// Blocks until every message sent so far is durably accepted, or fails
    /// once `timeout` has elapsed.
    #[allow(clippy::missing_errors_doc)]
    fn wait_for_confirms(&self, timeout: Duration) -> Result<(), CheckError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NpmInfo {
    pub name: String,
    pub version: String,
    pub latest_version: String,
    #[serde(rename = "versionJSON")]
    pub version_json: Value,
    pub raw: Value,
}

/// Registry metadata lookup. Fails with [`CheckError::NotFound`] for unknown
/// packages or versions.
pub trait MetadataProvider {
    #[allow(clippy::missing_errors_doc)]
    fn get_npm_info(&self, name: &str, version: Option<&str>) -> Result<NpmInfo, CheckError>;
}
