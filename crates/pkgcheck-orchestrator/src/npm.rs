use std::time::Duration;

use pkgcheck_core::{CheckError, MetadataProvider, NpmInfo};
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Metadata provider backed by the npm registry's document endpoint.
#[derive(Debug, Clone)]
pub struct NpmRegistry {
    base_url: String,
    timeout: Duration,
}

impl Default for NpmRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_URL, DEFAULT_REGISTRY_TIMEOUT)
    }
}

impl NpmRegistry {
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn document_url(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            name.replace('/', "%2F")
        )
    }

    fn fetch_document(&self, name: &str) -> Result<Value, CheckError> {
        let url = self.document_url(name);
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();

        match agent.get(&url).set("accept", "application/json").call() {
            Ok(response) => response.into_json::<Value>().map_err(|err| {
                warn!(%url, error = %err, "registry returned an unreadable document");
                package_not_exists(name)
            }),
            Err(ureq::Error::Status(code, _)) => {
                debug!(%url, code, "registry lookup failed");
                Err(package_not_exists(name))
            }
            Err(ureq::Error::Transport(err)) => {
                warn!(%url, error = %err, "registry transport failure");
                Err(package_not_exists(name))
            }
        }
    }
}

impl MetadataProvider for NpmRegistry {
    fn get_npm_info(&self, name: &str, version: Option<&str>) -> Result<NpmInfo, CheckError> {
        if name.trim().is_empty() {
            return Err(CheckError::missing("name"));
        }
        let document = self.fetch_document(name)?;
        parse_registry_document(name, version, document)
    }
}

/// Picks `version` (or the `latest` dist-tag) out of a registry document.
///
/// # Errors
/// Returns [`CheckError::NotFound`] when the document does not describe a
/// package or lacks the requested version.
pub fn parse_registry_document(
    name: &str,
    version: Option<&str>,
    raw: Value,
) -> Result<NpmInfo, CheckError> {
    let Some(package_name) = raw.get("name").and_then(Value::as_str) else {
        return Err(package_not_exists(name));
    };
    let Some(versions) = raw.get("versions").and_then(Value::as_object) else {
        return Err(package_not_exists(name));
    };

    let latest_version = raw
        .get("dist-tags")
        .and_then(|tags| tags.get("latest"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let version = match version {
        Some(requested) if !requested.is_empty() => requested.to_string(),
        _ => latest_version.clone(),
    };

    let Some(version_json) = versions.get(&version).cloned() else {
        return Err(CheckError::NotFound(format!(
            "'{version}' version not exists for package '{name}'"
        )));
    };

    Ok(NpmInfo {
        name: package_name.to_string(),
        version,
        latest_version,
        version_json,
        raw,
    })
}

fn package_not_exists(name: &str) -> CheckError {
    CheckError::NotFound(format!("'{name}' npm package not exists"))
}
