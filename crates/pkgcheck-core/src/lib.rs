//! Domain model and pure decision logic for package validation.
//!
//! The crate holds everything that does not talk to the outside world:
//! record types, content hashing, rule sets, the rule evaluation engine and
//! the expiration policy, plus the collaborator traits the orchestration
//! layer is wired through.

mod error;
pub mod evaluate;
pub mod expiration;
pub mod hash;
mod memory;
mod model;
pub mod ports;
pub mod ruleset;

use time::{OffsetDateTime, UtcOffset};

pub use error::CheckError;
pub use evaluate::{evaluate, evaluate_snapshot, NpmScores, PackageMeta, ValidationData};
pub use expiration::{
    EnvSettings, ExpirationPolicy, Freshness, FreshnessCheck, SettingsSource, StaticSettings,
};
pub use hash::{hash_json, rule_set_hash, target_hash};
pub use memory::InMemoryStore;
pub use model::{
    BadgeStatus, EvaluationId, EvaluationRecord, EvaluationResult, EvaluationTree, PackageId,
    PackageInfoLookup, PackageRecord, PackageState, Qualification, RuleCategory, RuleOutcome,
    ValidationTarget,
};
pub use ports::{EvaluationStore, MetadataProvider, NpmInfo, PackageStore, QueueChannel};
pub use ruleset::RuleSet;

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CheckError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CheckError::InvalidArgument(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CheckError::InvalidArgument(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CheckError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            CheckError::InvalidArgument(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
