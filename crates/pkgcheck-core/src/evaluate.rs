//! Rule evaluation engine.
//!
//! Every node of a collected dependency tree is scored against the active
//! [`RuleSet`]:
//!
//! - each enabled rule category yields one [`RuleOutcome`] whose `score` is a
//!   multiplier in `[0, 1]` (`1.0` when the rule passed);
//! - `nodeScore` is the product of those multipliers, so an extra failing
//!   rule can only lower it;
//! - `aggregateScore` is `min(nodeScore, reduce(children aggregates))` where
//!   the reduction is the rule set's [`ChildAggregation`] (minimum by
//!   default, arithmetic mean on request). Leaves aggregate to their own
//!   score;
//! - the root aggregate is mapped to a [`Qualification`] by the rule set's
//!   thresholds.
//!
//! Packages the collector could not resolve are attached to the root as
//! leaves with a single failing `unknown` outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ruleset::{
    ChildAggregation, DeprecationRule, LicenseRule, NpmScoresRule, SemVer, VersionRule,
};
use crate::{
    CheckError, EvaluationResult, EvaluationTree, RuleCategory, RuleOutcome, RuleSet,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NpmScores {
    pub quality: f64,
    pub popularity: f64,
    pub maintenance: f64,
}

/// Metadata of one package in a collected dependency tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageMeta {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub deprecated: Option<String>,
    #[serde(default)]
    pub npm_scores: Option<NpmScores>,
    #[serde(default)]
    pub dependencies: Vec<PackageMeta>,
}

/// Snapshot produced by metadata collection and stored on a succeeded
/// package record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationData {
    pub tree: PackageMeta,
    #[serde(default)]
    pub unknown_packages: Vec<String>,
}

/// Decodes a stored metadata snapshot and evaluates it.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] when either input is absent or the
/// snapshot does not decode into [`ValidationData`].
pub fn evaluate_snapshot(
    data: Option<&Value>,
    rule_set: Option<&RuleSet>,
) -> Result<EvaluationResult, CheckError> {
    let data = match data {
        None | Some(Value::Null) => return Err(CheckError::missing("data")),
        Some(value) => value,
    };
    let rule_set = rule_set.ok_or_else(|| CheckError::missing("ruleSet"))?;

    let decoded: ValidationData = serde_json::from_value(data.clone()).map_err(|err| {
        CheckError::InvalidArgument(format!("invalid validation data: {err}"))
    })?;
    evaluate(&decoded, rule_set)
}

/// Scores the dependency tree and qualifies its root.
///
/// # Errors
/// Returns [`CheckError::InvalidArgument`] when the root has no name and
/// [`CheckError::Configuration`] when the rule set is out of bounds.
pub fn evaluate(data: &ValidationData, rule_set: &RuleSet) -> Result<EvaluationResult, CheckError> {
    if data.tree.name.trim().is_empty() {
        return Err(CheckError::missing("data.tree.name"));
    }
    rule_set.validate()?;

    let mut root = evaluate_node(&data.tree, rule_set);
    if !data.unknown_packages.is_empty() {
        root.dependencies.extend(
            data.unknown_packages
                .iter()
                .map(|name| unknown_node(name, rule_set.unknown_package_penalty)),
        );
        root.aggregate_score = aggregate(root.node_score, &root.dependencies, rule_set.aggregation);
    }

    let qualification = rule_set.qualification.qualify(root.aggregate_score);
    debug!(
        package = %root.node_name,
        version = %root.node_version,
        score = root.aggregate_score,
        qualification = qualification.as_str(),
        "evaluated dependency tree"
    );

    Ok(EvaluationResult {
        root_evaluation: root,
        qualification,
    })
}

fn evaluate_node(meta: &PackageMeta, rule_set: &RuleSet) -> EvaluationTree {
    let mut evaluations = Vec::new();
    if let Some(rule) = &rule_set.license {
        evaluations.push(license_outcome(meta, rule));
    }
    if let Some(rule) = &rule_set.version {
        evaluations.push(version_outcome(meta, rule));
    }
    if let Some(rule) = &rule_set.npm_scores {
        if let Some(outcome) = npm_scores_outcome(meta, rule) {
            evaluations.push(outcome);
        }
    }
    if let Some(rule) = &rule_set.deprecation {
        evaluations.push(deprecation_outcome(meta, rule));
    }

    let node_score = combine(&evaluations);
    let dependencies: Vec<EvaluationTree> = meta
        .dependencies
        .iter()
        .map(|dependency| evaluate_node(dependency, rule_set))
        .collect();
    let aggregate_score = aggregate(node_score, &dependencies, rule_set.aggregation);

    EvaluationTree {
        node_name: meta.name.clone(),
        node_version: meta.version.clone(),
        node_score,
        aggregate_score,
        evaluations,
        dependencies,
    }
}

fn unknown_node(name: &str, penalty: f64) -> EvaluationTree {
    let evaluations = vec![failed(
        RuleCategory::Unknown,
        1.0 - penalty,
        format!("{name} could not be resolved"),
    )];
    let node_score = combine(&evaluations);
    EvaluationTree {
        node_name: name.to_string(),
        node_version: String::new(),
        node_score,
        aggregate_score: node_score,
        evaluations,
        dependencies: Vec::new(),
    }
}

fn license_outcome(meta: &PackageMeta, rule: &LicenseRule) -> RuleOutcome {
    let Some(license) = meta.license.as_deref().map(str::trim).filter(|l| !l.is_empty()) else {
        return if rule.license_required {
            failed(
                RuleCategory::License,
                1.0 - rule.penalty,
                "license is missing".to_string(),
            )
        } else {
            passed(RuleCategory::License, "license not required".to_string())
        };
    };

    let alternatives = license_alternatives(license);
    let listed = |list: &[String], candidate: &str| {
        list.iter().any(|entry| entry.eq_ignore_ascii_case(candidate))
    };
    let admissible: Vec<&Vec<String>> = alternatives
        .iter()
        .filter(|terms| !terms.iter().any(|term| listed(&rule.exclude, term)))
        .collect();

    if admissible.is_empty() {
        return failed(
            RuleCategory::License,
            0.0,
            format!("license {license} is excluded"),
        );
    }

    if !rule.include.is_empty()
        && !admissible
            .iter()
            .any(|terms| terms.iter().all(|term| listed(&rule.include, term)))
    {
        return failed(
            RuleCategory::License,
            1.0 - rule.penalty,
            format!("license {license} is not in the accepted list"),
        );
    }

    passed(RuleCategory::License, format!("license {license} is accepted"))
}

/// Expands an SPDX expression into its alternatives, each the list of
/// licenses that apply together. `AND` binds tighter than `OR`; `WITH`
/// exceptions are dropped.
fn license_alternatives(expression: &str) -> Vec<Vec<String>> {
    let spaced = expression.replace('(', " ( ").replace(')', " ) ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();
    let mut position = 0;
    let mut alternatives = parse_or(&tokens, &mut position);
    alternatives.retain(|terms| !terms.is_empty());
    if alternatives.is_empty() {
        vec![vec![expression.trim().to_string()]]
    } else {
        alternatives
    }
}

fn parse_or(tokens: &[&str], position: &mut usize) -> Vec<Vec<String>> {
    let mut alternatives = parse_and(tokens, position);
    while tokens
        .get(*position)
        .is_some_and(|token| token.eq_ignore_ascii_case("OR"))
    {
        *position += 1;
        alternatives.extend(parse_and(tokens, position));
    }
    alternatives
}

fn parse_and(tokens: &[&str], position: &mut usize) -> Vec<Vec<String>> {
    let mut alternatives = parse_term(tokens, position);
    while tokens
        .get(*position)
        .is_some_and(|token| token.eq_ignore_ascii_case("AND"))
    {
        *position += 1;
        let right = parse_term(tokens, position);
        alternatives = alternatives
            .iter()
            .flat_map(|left| {
                right.iter().map(move |terms| {
                    let mut combined = left.clone();
                    combined.extend(terms.iter().cloned());
                    combined
                })
            })
            .collect();
    }
    alternatives
}

fn parse_term(tokens: &[&str], position: &mut usize) -> Vec<Vec<String>> {
    match tokens.get(*position).copied() {
        Some("(") => {
            *position += 1;
            let inner = parse_or(tokens, position);
            if tokens.get(*position) == Some(&")") {
                *position += 1;
            }
            inner
        }
        Some(token) if token != ")" => {
            *position += 1;
            if tokens
                .get(*position)
                .is_some_and(|next| next.eq_ignore_ascii_case("WITH"))
            {
                *position = (*position + 2).min(tokens.len());
            }
            vec![vec![token.to_string()]]
        }
        _ => vec![Vec::new()],
    }
}

fn version_outcome(meta: &PackageMeta, rule: &VersionRule) -> RuleOutcome {
    let Some(version) = SemVer::parse(&meta.version) else {
        return failed(
            RuleCategory::Version,
            1.0 - rule.penalty,
            format!("version {:?} is not a release version", meta.version),
        );
    };

    if rule.reject_prerelease && version.prerelease {
        return failed(
            RuleCategory::Version,
            1.0 - rule.penalty,
            format!("version {} is a prerelease", meta.version),
        );
    }

    let below_minimum = SemVer::parse(&rule.min_version)
        .is_some_and(|minimum| version.release() < minimum.release());
    if below_minimum {
        return failed(
            RuleCategory::Version,
            1.0 - rule.penalty,
            format!("version {} is below {}", meta.version, rule.min_version),
        );
    }

    passed(
        RuleCategory::Version,
        format!("version {} is acceptable", meta.version),
    )
}

fn npm_scores_outcome(meta: &PackageMeta, rule: &NpmScoresRule) -> Option<RuleOutcome> {
    let scores = meta.npm_scores.as_ref()?;
    let mut below = Vec::new();
    for (name, minimum, actual) in [
        ("quality", rule.quality, scores.quality),
        ("popularity", rule.popularity, scores.popularity),
        ("maintenance", rule.maintenance, scores.maintenance),
    ] {
        if let Some(minimum) = minimum {
            if actual < minimum {
                below.push(format!("{name} {actual:.2} < {minimum:.2}"));
            }
        }
    }

    if below.is_empty() {
        return Some(passed(
            RuleCategory::NpmScores,
            "npm scores meet the minimums".to_string(),
        ));
    }

    let exponent = i32::try_from(below.len()).unwrap_or(i32::MAX);
    Some(failed(
        RuleCategory::NpmScores,
        (1.0 - rule.penalty).powi(exponent),
        below.join(", "),
    ))
}

fn deprecation_outcome(meta: &PackageMeta, rule: &DeprecationRule) -> RuleOutcome {
    match meta.deprecated.as_deref() {
        Some(message) => failed(
            RuleCategory::Deprecation,
            1.0 - rule.penalty,
            format!("deprecated: {message}"),
        ),
        None => passed(RuleCategory::Deprecation, "not deprecated".to_string()),
    }
}

fn combine(evaluations: &[RuleOutcome]) -> f64 {
    clamp_unit(evaluations.iter().map(|outcome| outcome.score).product())
}

#[allow(clippy::cast_precision_loss)]
fn aggregate(node_score: f64, dependencies: &[EvaluationTree], policy: ChildAggregation) -> f64 {
    if dependencies.is_empty() {
        return node_score;
    }

    let children = dependencies.iter().map(|child| child.aggregate_score);
    let reduced = match policy {
        ChildAggregation::Min => children.fold(1.0_f64, f64::min),
        ChildAggregation::Mean => children.sum::<f64>() / dependencies.len() as f64,
    };
    clamp_unit(node_score.min(reduced))
}

fn passed(rule: RuleCategory, description: String) -> RuleOutcome {
    RuleOutcome {
        rule,
        passed: true,
        score: 1.0,
        description,
    }
}

fn failed(rule: RuleCategory, score: f64, description: String) -> RuleOutcome {
    RuleOutcome {
        rule,
        passed: false,
        score: clamp_unit(score),
        description,
    }
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
