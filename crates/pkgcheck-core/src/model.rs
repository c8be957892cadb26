use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::CheckError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PackageId(pub Ulid);

impl PackageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PackageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PackageId {
    type Err = CheckError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self).map_err(|err| {
            CheckError::InvalidArgument(format!("invalid package id {value}: {err}"))
        })
    }
}

/// Identifier of an evaluation record. Doubles as the correlation id (`cid`)
/// carried by validation jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EvaluationId(pub Ulid);

impl EvaluationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EvaluationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EvaluationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EvaluationId {
    type Err = CheckError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self).map_err(|err| {
            CheckError::InvalidArgument(format!("invalid evaluation id {value}: {err}"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Pending,
    Succeeded { meta: Value },
    Failed { meta: Value },
}

impl PackageState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded { .. } => "SUCCEEDED",
            Self::Failed { .. } => "FAILED",
        }
    }

    #[must_use]
    pub fn failed(message: &str) -> Self {
        Self::Failed {
            meta: serde_json::json!({ "message": message }),
        }
    }

    #[must_use]
    pub fn meta(&self) -> Option<&Value> {
        match self {
            Self::Pending => None,
            Self::Succeeded { meta } | Self::Failed { meta } => Some(meta),
        }
    }
}

/// One cached validation target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub id: PackageId,
    pub package_name: String,
    pub is_production: bool,
    pub hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: PackageState,
    pub latest: bool,
}

impl PackageRecord {
    /// A fresh `PENDING` record that is the authoritative one for `hash`.
    #[must_use]
    pub fn pending(
        package_name: impl Into<String>,
        is_production: bool,
        hash: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: PackageId::new(),
            package_name: package_name.into(),
            is_production,
            hash: hash.into(),
            created_at,
            state: PackageState::Pending,
            latest: true,
        }
    }
}

/// Result of an external find-or-create keyed by target hash.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfoLookup {
    pub package_info: PackageRecord,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qualification {
    Rejected,
    Recommended,
    Accepted,
}

impl Qualification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rejected => "REJECTED",
            Self::Recommended => "RECOMMENDED",
            Self::Accepted => "ACCEPTED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RuleCategory {
    License,
    Version,
    NpmScores,
    Deprecation,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule: RuleCategory,
    pub passed: bool,
    /// Multiplier applied to the node score, `1.0` when the rule passed.
    pub score: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationTree {
    pub node_name: String,
    pub node_version: String,
    pub node_score: f64,
    /// Node score combined with the reduced aggregate of all dependencies.
    pub aggregate_score: f64,
    pub evaluations: Vec<RuleOutcome>,
    pub dependencies: Vec<EvaluationTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub root_evaluation: EvaluationTree,
    pub qualification: Qualification,
}

/// Computed (or pending) result of scoring one package record against one
/// rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub id: EvaluationId,
    pub package_info_id: PackageId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub rule_set: Option<Value>,
    pub rule_set_hash: String,
    pub result: Option<EvaluationResult>,
}

/// What a single validation is about: a published package or a manifest,
/// optionally pinned by lockfiles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTarget {
    pub package_name: String,
    #[serde(rename = "packageJSON", skip_serializing_if = "Option::is_none")]
    pub package_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_lock: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yarn_lock: Option<String>,
    pub is_production: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BadgeStatus {
    Inprogress,
    Failed,
    Accepted,
    Recommended,
    Rejected,
}

impl BadgeStatus {
    #[must_use]
    pub fn of(package: Option<&PackageRecord>, evaluation: Option<&EvaluationRecord>) -> Self {
        let Some(package) = package else {
            return Self::Failed;
        };

        match package.state {
            PackageState::Pending => Self::Inprogress,
            PackageState::Failed { .. } => Self::Failed,
            PackageState::Succeeded { .. } => {
                match evaluation.and_then(|record| record.result.as_ref()) {
                    Some(result) => match result.qualification {
                        Qualification::Accepted => Self::Accepted,
                        Qualification::Recommended => Self::Recommended,
                        Qualification::Rejected => Self::Rejected,
                    },
                    None => Self::Failed,
                }
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inprogress => "inprogress",
            Self::Failed => "failed",
            Self::Accepted => "accepted",
            Self::Recommended => "recommended",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn image_key(self) -> String {
        format!("/images/status/corp-check-{}.svg", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_utc;

    fn fixture_package(state: PackageState) -> PackageRecord {
        let mut record = PackageRecord::pending("left-pad", false, "h1", now_utc());
        record.state = state;
        record
    }

    fn fixture_evaluation(result: Option<EvaluationResult>) -> EvaluationRecord {
        EvaluationRecord {
            id: EvaluationId::new(),
            package_info_id: PackageId::new(),
            created_at: now_utc(),
            rule_set: None,
            rule_set_hash: "r".to_string(),
            result,
        }
    }

    fn fixture_result(qualification: Qualification) -> EvaluationResult {
        EvaluationResult {
            root_evaluation: EvaluationTree {
                node_name: "left-pad".to_string(),
                node_version: "1.3.0".to_string(),
                node_score: 1.0,
                aggregate_score: 1.0,
                evaluations: Vec::new(),
                dependencies: Vec::new(),
            },
            qualification,
        }
    }

    #[test]
    fn qualification_tiers_are_ordered() {
        assert!(Qualification::Rejected < Qualification::Recommended);
        assert!(Qualification::Recommended < Qualification::Accepted);
    }

    #[test]
    fn package_state_serializes_as_tagged_variant() {
        let state = PackageState::failed("boom");
        let value = serde_json::to_value(&state).unwrap_or_default();
        assert_eq!(
            value,
            serde_json::json!({ "type": "FAILED", "meta": { "message": "boom" } })
        );

        let pending = serde_json::to_value(PackageState::Pending).unwrap_or_default();
        assert_eq!(pending, serde_json::json!({ "type": "PENDING" }));
    }

    #[test]
    fn validation_target_omits_unset_lockfiles() {
        let target = ValidationTarget {
            package_name: "left-pad".to_string(),
            package_json: None,
            package_lock: Some("lock".to_string()),
            yarn_lock: None,
            is_production: true,
        };
        let value = serde_json::to_value(&target).unwrap_or_default();
        let mut keys: Vec<&String> = value
            .as_object()
            .map(|map| map.keys().collect())
            .unwrap_or_default();
        keys.sort();
        assert_eq!(keys, vec!["isProduction", "packageLock", "packageName"]);
    }

    #[test]
    fn badge_status_follows_state_and_qualification() {
        let pending = fixture_package(PackageState::Pending);
        assert_eq!(BadgeStatus::of(Some(&pending), None), BadgeStatus::Inprogress);

        let failed = fixture_package(PackageState::failed("x"));
        assert_eq!(BadgeStatus::of(Some(&failed), None), BadgeStatus::Failed);

        let succeeded = fixture_package(PackageState::Succeeded {
            meta: serde_json::json!({}),
        });
        assert_eq!(
            BadgeStatus::of(Some(&succeeded), Some(&fixture_evaluation(None))),
            BadgeStatus::Failed
        );

        for (qualification, expected) in [
            (Qualification::Accepted, BadgeStatus::Accepted),
            (Qualification::Recommended, BadgeStatus::Recommended),
            (Qualification::Rejected, BadgeStatus::Rejected),
        ] {
            let evaluation = fixture_evaluation(Some(fixture_result(qualification)));
            assert_eq!(BadgeStatus::of(Some(&succeeded), Some(&evaluation)), expected);
        }

        assert_eq!(BadgeStatus::of(None, None), BadgeStatus::Failed);
    }

    #[test]
    fn badge_image_key_matches_asset_layout() {
        assert_eq!(
            BadgeStatus::Inprogress.image_key(),
            "/images/status/corp-check-inprogress.svg"
        );
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = EvaluationId::new();
        let parsed: Result<EvaluationId, _> = id.to_string().parse();
        assert_eq!(parsed, Ok(id));
        assert!("not-a-ulid".parse::<PackageId>().is_err());
    }
}
