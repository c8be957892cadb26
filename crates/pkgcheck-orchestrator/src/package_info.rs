use pkgcheck_core::{
    now_utc, target_hash, CheckError, MetadataProvider, PackageId, PackageInfoLookup,
    PackageRecord, PackageState, PackageStore, ValidationTarget,
};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Manifest-less validations of a package file fall back to this name.
pub const MANIFEST_FALLBACK_NAME: &str = "package.json";

/// A validation request as received from a caller, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationRequest {
    pub package_name: Option<String>,
    pub package_json: Option<String>,
    pub package_lock: Option<String>,
    pub yarn_lock: Option<String>,
    pub is_production: bool,
}

/// A request pinned to a concrete target and its cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target: ValidationTarget,
    pub hash: String,
}

/// Splits `name[@version]`, keeping the leading `@` of scoped names.
#[must_use]
pub fn split_package_spec(spec: &str) -> (&str, Option<&str>) {
    let spec = spec.trim();
    let search_from = usize::from(spec.starts_with('@'));
    match spec[search_from..].find('@') {
        Some(offset) => {
            let at = search_from + offset;
            let version = &spec[at + 1..];
            (&spec[..at], (!version.is_empty()).then_some(version))
        }
        None => (spec, None),
    }
}

pub struct PackageInfoApi<'a> {
    store: &'a dyn PackageStore,
    metadata: &'a dyn MetadataProvider,
}

impl<'a> PackageInfoApi<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PackageStore, metadata: &'a dyn MetadataProvider) -> Self {
        Self { store, metadata }
    }

    /// Pins `request` to a concrete target.
    ///
    /// A manifest is taken as-is; a bare package spec is resolved through
    /// the registry so that `name` and `name@<latest>` share a cache key.
    ///
    /// # Errors
    /// Returns [`CheckError::InvalidArgument`] for a missing name or a
    /// manifest that is not a JSON object, and [`CheckError::NotFound`] when
    /// the registry does not know the package or version.
    pub fn resolve_target(
        &self,
        request: &ValidationRequest,
    ) -> Result<ResolvedTarget, CheckError> {
        if let Some(manifest) = &request.package_json {
            let parsed: Value = serde_json::from_str(manifest).map_err(|err| {
                CheckError::InvalidArgument(format!("packageJSON is not valid JSON: {err}"))
            })?;
            let Some(object) = parsed.as_object() else {
                return Err(CheckError::InvalidArgument(
                    "packageJSON MUST be a JSON object".to_string(),
                ));
            };
            let name = object
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(MANIFEST_FALLBACK_NAME);

            let target = ValidationTarget {
                package_name: name.to_string(),
                package_json: Some(manifest.clone()),
                package_lock: request.package_lock.clone(),
                yarn_lock: request.yarn_lock.clone(),
                is_production: request.is_production,
            };
            let hash = target_hash(&target)?;
            return Ok(ResolvedTarget { target, hash });
        }

        let spec = request
            .package_name
            .as_deref()
            .filter(|spec| !spec.trim().is_empty())
            .ok_or_else(|| CheckError::missing("packageName"))?;
        let (name, version) = split_package_spec(spec);
        let info = self.metadata.get_npm_info(name, version)?;

        let package_name = if info.version == info.latest_version {
            name.to_string()
        } else {
            format!("{name}@{}", info.version)
        };
        let target = ValidationTarget {
            package_name,
            package_json: None,
            package_lock: request.package_lock.clone(),
            yarn_lock: request.yarn_lock.clone(),
            is_production: request.is_production,
        };
        let hash = target_hash(&ValidationTarget {
            package_name: format!("{name}@{}", info.version),
            ..target.clone()
        })?;
        debug!(spec, resolved = %target.package_name, %hash, "resolved validation target");
        Ok(ResolvedTarget { target, hash })
    }

    /// Finds the authoritative record for the target's hash or creates a
    /// `PENDING` one.
    #[allow(clippy::missing_errors_doc)]
    pub fn get_or_create(
        &self,
        resolved: &ResolvedTarget,
    ) -> Result<PackageInfoLookup, CheckError> {
        if let Some(package_info) = self.store.find_latest_by_hash(&resolved.hash)? {
            debug!(package_id = %package_info.id, hash = %resolved.hash, "package record found");
            return Ok(PackageInfoLookup {
                package_info,
                created: false,
            });
        }

        let package_info = PackageRecord::pending(
            resolved.target.package_name.clone(),
            resolved.target.is_production,
            resolved.hash.clone(),
            now_utc(),
        );
        self.store.insert_package(&package_info)?;
        info!(package_id = %package_info.id, hash = %resolved.hash, "package record created");
        Ok(PackageInfoLookup {
            package_info,
            created: true,
        })
    }

    /// Supersedes `previous` with a fresh `PENDING` record for the same target.
    #[allow(clippy::missing_errors_doc)]
    pub fn create(&self, previous: &PackageRecord) -> Result<PackageRecord, CheckError> {
        let record = PackageRecord::pending(
            previous.package_name.clone(),
            previous.is_production,
            previous.hash.clone(),
            now_utc(),
        );
        self.store.insert_package(&record)?;
        info!(
            package_id = %record.id,
            previous_id = %previous.id,
            hash = %record.hash,
            "package record superseded"
        );
        Ok(record)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get(&self, id: PackageId) -> Result<Option<PackageRecord>, CheckError> {
        self.store.get_package(id)
    }

    /// # Errors
    /// Returns [`CheckError::NotFound`] if no record has `id`.
    pub fn update_state(&self, id: PackageId, state: &PackageState) -> Result<(), CheckError> {
        if !self.store.update_package_state(id, state)? {
            return Err(CheckError::NotFound(format!("package record {id} not exists")));
        }
        debug!(package_id = %id, state = state.as_str(), "package state updated");
        Ok(())
    }

    /// Marks the record `FAILED` with a diagnostic `message`.
    ///
    /// # Errors
    /// See [`PackageInfoApi::update_state`].
    pub fn fail(&self, id: PackageId, message: &str) -> Result<(), CheckError> {
        warn!(package_id = %id, message, "package validation failed");
        self.update_state(id, &PackageState::failed(message))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::npm::parse_registry_document;
    use pkgcheck_core::{InMemoryStore, NpmInfo};
    use serde_json::json;

    struct FixtureRegistry {
        calls: RefCell<Vec<(String, Option<String>)>>,
    }

    impl FixtureRegistry {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl MetadataProvider for FixtureRegistry {
        fn get_npm_info(&self, name: &str, version: Option<&str>) -> Result<NpmInfo, CheckError> {
            self.calls
                .borrow_mut()
                .push((name.to_string(), version.map(str::to_string)));
            let document = json!({
                "name": name,
                "dist-tags": { "latest": "2.0.0" },
                "versions": { "1.0.0": {}, "2.0.0": {} }
            });
            parse_registry_document(name, version, document)
        }
    }

    fn must_ok<T>(result: Result<T, CheckError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn by_name(spec: &str) -> ValidationRequest {
        ValidationRequest {
            package_name: Some(spec.to_string()),
            ..ValidationRequest::default()
        }
    }

    #[test]
    fn package_spec_splitting_handles_scopes() {
        assert_eq!(split_package_spec("left-pad"), ("left-pad", None));
        assert_eq!(split_package_spec("left-pad@1.3.0"), ("left-pad", Some("1.3.0")));
        assert_eq!(split_package_spec("@scope/name"), ("@scope/name", None));
        assert_eq!(split_package_spec("@scope/name@2.0.0"), ("@scope/name", Some("2.0.0")));
        assert_eq!(split_package_spec("left-pad@"), ("left-pad", None));
    }

    #[test]
    fn latest_and_bare_name_share_a_cache_key() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);

        let bare = must_ok(api.resolve_target(&by_name("left-pad")));
        let pinned = must_ok(api.resolve_target(&by_name("left-pad@2.0.0")));
        assert_eq!(bare, pinned);
        assert_eq!(bare.target.package_name, "left-pad");

        let old = must_ok(api.resolve_target(&by_name("left-pad@1.0.0")));
        assert_eq!(old.target.package_name, "left-pad@1.0.0");
        assert_ne!(old.hash, bare.hash);
        assert_eq!(
            registry.calls.borrow()[2],
            ("left-pad".to_string(), Some("1.0.0".to_string()))
        );
    }

    #[test]
    fn manifest_target_skips_registry() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);

        let named = must_ok(api.resolve_target(&ValidationRequest {
            package_json: Some(r#"{"name":"my-app","dependencies":{}}"#.to_string()),
            package_lock: Some("lock".to_string()),
            ..ValidationRequest::default()
        }));
        assert_eq!(named.target.package_name, "my-app");
        assert_eq!(named.target.package_lock.as_deref(), Some("lock"));

        let anonymous = must_ok(api.resolve_target(&ValidationRequest {
            package_json: Some("{}".to_string()),
            ..ValidationRequest::default()
        }));
        assert_eq!(anonymous.target.package_name, MANIFEST_FALLBACK_NAME);
        assert!(registry.calls.borrow().is_empty());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);

        assert!(matches!(
            api.resolve_target(&ValidationRequest::default()),
            Err(CheckError::InvalidArgument(_))
        ));
        assert!(matches!(
            api.resolve_target(&ValidationRequest {
                package_json: Some("[1, 2]".to_string()),
                ..ValidationRequest::default()
            }),
            Err(CheckError::InvalidArgument(_))
        ));
        assert!(matches!(
            api.resolve_target(&by_name("left-pad@9.9.9")),
            Err(CheckError::NotFound(_))
        ));
    }

    #[test]
    fn get_or_create_is_keyed_by_hash() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);
        let resolved = must_ok(api.resolve_target(&by_name("left-pad")));

        let first = must_ok(api.get_or_create(&resolved));
        assert!(first.created);
        assert_eq!(first.package_info.state, PackageState::Pending);
        assert!(first.package_info.latest);

        let second = must_ok(api.get_or_create(&resolved));
        assert!(!second.created);
        assert_eq!(second.package_info.id, first.package_info.id);
    }

    #[test]
    fn create_supersedes_previous_record() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);
        let resolved = must_ok(api.resolve_target(&by_name("left-pad")));
        let previous = must_ok(api.get_or_create(&resolved)).package_info;
        must_ok(api.fail(previous.id, "boom"));

        let next = must_ok(api.create(&previous));
        assert_ne!(next.id, previous.id);
        assert_eq!(next.hash, previous.hash);
        assert_eq!(next.state, PackageState::Pending);

        let demoted = must_ok(api.get(previous.id));
        assert_eq!(demoted.as_ref().map(|record| record.latest), Some(false));
        assert_eq!(
            demoted.map(|record| record.state),
            Some(PackageState::failed("boom"))
        );
    }

    #[test]
    fn updating_unknown_record_is_not_found() {
        let store = InMemoryStore::new();
        let registry = FixtureRegistry::new();
        let api = PackageInfoApi::new(&store, &registry);
        assert!(matches!(
            api.update_state(PackageId::new(), &PackageState::Pending),
            Err(CheckError::NotFound(_))
        ));
    }
}
