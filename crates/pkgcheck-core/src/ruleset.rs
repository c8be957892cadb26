use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{CheckError, Qualification};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRule {
    /// Accepted licenses; empty means every license not excluded is accepted.
    pub include: Vec<String>,
    /// Licenses that zero the node score outright.
    pub exclude: Vec<String>,
    pub license_required: bool,
    pub penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionRule {
    pub min_version: String,
    pub reject_prerelease: bool,
    pub penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NpmScoresRule {
    pub quality: Option<f64>,
    pub popularity: Option<f64>,
    pub maintenance: Option<f64>,
    /// Applied once per metric below its minimum.
    pub penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeprecationRule {
    pub penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualificationThresholds {
    pub recommended_from: f64,
    pub accepted_from: f64,
}

impl QualificationThresholds {
    #[must_use]
    pub fn qualify(&self, score: f64) -> Qualification {
        if score >= self.accepted_from {
            Qualification::Accepted
        } else if score >= self.recommended_from {
            Qualification::Recommended
        } else {
            Qualification::Rejected
        }
    }
}

/// How dependency aggregates are reduced before they are combined with the
/// parent's own score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChildAggregation {
    #[default]
    Min,
    Mean,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub license: Option<LicenseRule>,
    pub version: Option<VersionRule>,
    pub npm_scores: Option<NpmScoresRule>,
    pub deprecation: Option<DeprecationRule>,
    pub unknown_package_penalty: f64,
    pub qualification: QualificationThresholds,
    pub aggregation: ChildAggregation,
}

impl RuleSet {
    /// The organisation-wide defaults every requested rule set is merged over.
    #[must_use]
    pub fn defaults_json() -> Value {
        json!({
            "license": {
                "include": [],
                "exclude": ["AGPL-3.0", "GPL-3.0", "SSPL-1.0"],
                "licenseRequired": true,
                "penalty": 0.5
            },
            "version": {
                "minVersion": "1.0.0",
                "rejectPrerelease": true,
                "penalty": 0.1
            },
            "npmScores": {
                "quality": 0.5,
                "popularity": 0.1,
                "maintenance": 0.5,
                "penalty": 0.1
            },
            "deprecation": {
                "penalty": 0.5
            },
            "unknownPackagePenalty": 0.5,
            "qualification": {
                "recommendedFrom": 0.5,
                "acceptedFrom": 0.8
            },
            "aggregation": "min"
        })
    }

    /// Builds the effective rule set for a raw request value. Objects are
    /// merged key by key over [`RuleSet::defaults_json`]; a `null` category
    /// disables it.
    ///
    /// # Errors
    /// Returns [`CheckError::Configuration`] when the raw value is not an
    /// object, fails to decode, or violates rule-set bounds.
    pub fn from_json(raw: Option<&Value>) -> Result<Self, CheckError> {
        let mut merged = Self::defaults_json();
        match raw {
            None | Some(Value::Null) => {}
            Some(value @ Value::Object(_)) => merge_json(&mut merged, value),
            Some(_) => {
                return Err(CheckError::Configuration(
                    "rule set MUST be a JSON object".to_string(),
                ))
            }
        }

        let rule_set: Self = serde_json::from_value(merged).map_err(|err| {
            CheckError::Configuration(format!("invalid rule set JSON payload: {err}"))
        })?;
        rule_set.validate()?;
        Ok(rule_set)
    }

    /// Validates penalty, threshold and version bounds.
    ///
    /// # Errors
    /// Returns [`CheckError::Configuration`] naming the first field out of
    /// bounds.
    pub fn validate(&self) -> Result<(), CheckError> {
        let mut bounded = vec![
            ("unknownPackagePenalty", Some(self.unknown_package_penalty)),
            (
                "qualification.recommendedFrom",
                Some(self.qualification.recommended_from),
            ),
            (
                "qualification.acceptedFrom",
                Some(self.qualification.accepted_from),
            ),
        ];
        if let Some(rule) = &self.license {
            bounded.push(("license.penalty", Some(rule.penalty)));
        }
        if let Some(rule) = &self.version {
            bounded.push(("version.penalty", Some(rule.penalty)));
        }
        if let Some(rule) = &self.npm_scores {
            bounded.push(("npmScores.penalty", Some(rule.penalty)));
            bounded.push(("npmScores.quality", rule.quality));
            bounded.push(("npmScores.popularity", rule.popularity));
            bounded.push(("npmScores.maintenance", rule.maintenance));
        }
        if let Some(rule) = &self.deprecation {
            bounded.push(("deprecation.penalty", Some(rule.penalty)));
        }

        for (name, value) in bounded {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(CheckError::Configuration(format!(
                        "{name} MUST be in [0.0, 1.0]"
                    )));
                }
            }
        }

        if self.qualification.recommended_from > self.qualification.accepted_from {
            return Err(CheckError::Configuration(
                "qualification.recommendedFrom cannot exceed acceptedFrom".to_string(),
            ));
        }

        if let Some(rule) = &self.version {
            if SemVer::parse(&rule.min_version).is_none() {
                return Err(CheckError::Configuration(format!(
                    "version.minVersion is not a valid version: {}",
                    rule.min_version
                )));
            }
        }

        Ok(())
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            license: Some(LicenseRule {
                include: Vec::new(),
                exclude: vec![
                    "AGPL-3.0".to_string(),
                    "GPL-3.0".to_string(),
                    "SSPL-1.0".to_string(),
                ],
                license_required: true,
                penalty: 0.5,
            }),
            version: Some(VersionRule {
                min_version: "1.0.0".to_string(),
                reject_prerelease: true,
                penalty: 0.1,
            }),
            npm_scores: Some(NpmScoresRule {
                quality: Some(0.5),
                popularity: Some(0.1),
                maintenance: Some(0.5),
                penalty: 0.1,
            }),
            deprecation: Some(DeprecationRule { penalty: 0.5 }),
            unknown_package_penalty: 0.5,
            qualification: QualificationThresholds {
                recommended_from: 0.5,
                accepted_from: 0.8,
            },
            aggregation: ChildAggregation::Min,
        }
    }
}

fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Numeric `major.minor.patch` with a prerelease marker. Build metadata is
/// ignored.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: bool,
}

impl SemVer {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches(['v', '=']);
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, prerelease) = match without_build.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, true),
            Some(_) => return None,
            None => (without_build, false),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            prerelease,
        })
    }

    /// Release ordering without the prerelease marker.
    #[must_use]
    pub fn release(self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn absent_rule_set_yields_defaults() {
        let rule_set = must_ok(RuleSet::from_json(None));
        assert_eq!(rule_set, RuleSet::default());
        assert_eq!(must_ok(RuleSet::from_json(Some(&Value::Null))), rule_set);
    }

    #[test]
    fn defaults_json_and_default_agree() {
        let decoded: RuleSet = must_ok(serde_json::from_value(RuleSet::defaults_json()));
        assert_eq!(decoded, RuleSet::default());
    }

    #[test]
    fn overlay_merges_per_field_and_null_disables_category() {
        let raw = json!({
            "license": { "include": ["MIT", "ISC"] },
            "npmScores": null,
            "aggregation": "mean"
        });
        let rule_set = must_ok(RuleSet::from_json(Some(&raw)));

        let license = match rule_set.license {
            Some(rule) => rule,
            None => panic!("license rule should stay enabled"),
        };
        assert_eq!(license.include, vec!["MIT".to_string(), "ISC".to_string()]);
        assert!(license.license_required);
        assert!(rule_set.npm_scores.is_none());
        assert_eq!(rule_set.aggregation, ChildAggregation::Mean);
    }

    #[test]
    fn out_of_bounds_values_are_rejected() {
        let raw = json!({ "deprecation": { "penalty": 1.5 } });
        assert!(matches!(
            RuleSet::from_json(Some(&raw)),
            Err(CheckError::Configuration(message)) if message.contains("deprecation.penalty")
        ));

        let inverted = json!({ "qualification": { "recommendedFrom": 0.9, "acceptedFrom": 0.3 } });
        assert!(RuleSet::from_json(Some(&inverted)).is_err());

        let bad_version = json!({ "version": { "minVersion": "one" } });
        assert!(RuleSet::from_json(Some(&bad_version)).is_err());

        assert!(RuleSet::from_json(Some(&json!(["license"]))).is_err());
    }

    #[test]
    fn thresholds_map_scores_to_ordered_tiers() {
        let thresholds = RuleSet::default().qualification;
        assert_eq!(thresholds.qualify(0.49), Qualification::Rejected);
        assert_eq!(thresholds.qualify(0.5), Qualification::Recommended);
        assert_eq!(thresholds.qualify(0.79), Qualification::Recommended);
        assert_eq!(thresholds.qualify(0.8), Qualification::Accepted);
        assert_eq!(thresholds.qualify(1.0), Qualification::Accepted);
    }

    #[test]
    fn semver_parses_release_and_prerelease() {
        let parsed = SemVer::parse("v1.2.3-beta.1+build");
        assert_eq!(
            parsed,
            Some(SemVer {
                major: 1,
                minor: 2,
                patch: 3,
                prerelease: true
            })
        );
        assert_eq!(SemVer::parse("0.4.0").map(SemVer::release), Some((0, 4, 0)));
        assert!(SemVer::parse("1.2").is_none());
        assert!(SemVer::parse("1.2.3-").is_none());
        assert!(SemVer::parse("latest").is_none());
    }
}
