//! Freshness of cached package records.
//!
//! A record is judged as follows:
//! 1. `force` always expires it;
//! 2. `PENDING` never expires (the validation is still in flight);
//! 3. `FAILED` always expires, so a transient failure never blocks retries;
//! 4. `SUCCEEDED` expires once its age exceeds the configured window
//!    (`PACKAGE_VALIDATION_EXPIRATION_IN_DAYS`, default one day).
//!
//! Whenever the verdict is "expired" and the caller asked for it, every
//! record sharing the hash is demoted with one set-based invalidation.

use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::ports::PackageStore;
use crate::{now_utc, CheckError, PackageRecord, PackageState};

pub const EXPIRATION_DAYS_ENV: &str = "PACKAGE_VALIDATION_EXPIRATION_IN_DAYS";
pub const DEFAULT_EXPIRATION_DAYS: u32 = 1;

/// Source of runtime settings, consulted on every freshness check.
pub trait SettingsSource {
    #[allow(clippy::missing_errors_doc)]
    fn expiration_days(&self) -> Result<Option<u32>, CheckError>;
}

/// Reads settings from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsSource for EnvSettings {
    fn expiration_days(&self) -> Result<Option<u32>, CheckError> {
        parse_expiration_days(std::env::var(EXPIRATION_DAYS_ENV).ok().as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StaticSettings {
    pub expiration_days: Option<u32>,
}

impl SettingsSource for StaticSettings {
    fn expiration_days(&self) -> Result<Option<u32>, CheckError> {
        Ok(self.expiration_days)
    }
}

/// Parses a whole number of days; empty input means "use the default".
///
/// # Errors
/// Returns [`CheckError::Configuration`] for anything but a positive integer.
pub fn parse_expiration_days(raw: Option<&str>) -> Result<Option<u32>, CheckError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    match raw.parse::<u32>() {
        Ok(days) if days > 0 => Ok(Some(days)),
        _ => Err(CheckError::Configuration(format!(
            "{EXPIRATION_DAYS_ENV} MUST be a positive whole number of days, got {raw:?}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Freshness {
    Fresh,
    Expired,
    ForceExpired,
}

impl Freshness {
    #[must_use]
    pub fn is_expired(self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

/// Pure freshness verdict for `record` at `now`.
#[must_use]
pub fn freshness(
    record: &PackageRecord,
    force: bool,
    ttl: Duration,
    now: OffsetDateTime,
) -> Freshness {
    if force {
        return Freshness::ForceExpired;
    }

    match record.state {
        PackageState::Pending => Freshness::Fresh,
        PackageState::Failed { .. } => Freshness::Expired,
        PackageState::Succeeded { .. } => {
            if now - record.created_at > ttl {
                Freshness::Expired
            } else {
                Freshness::Fresh
            }
        }
    }
}

/// Freshness check as consumed by the validation orchestrator.
pub trait FreshnessCheck {
    #[allow(clippy::missing_errors_doc)]
    fn is_expired(
        &self,
        package_info: &PackageRecord,
        update: bool,
        force: bool,
    ) -> Result<bool, CheckError>;
}

pub struct ExpirationPolicy<'a> {
    store: &'a dyn PackageStore,
    settings: &'a dyn SettingsSource,
}

impl<'a> ExpirationPolicy<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PackageStore, settings: &'a dyn SettingsSource) -> Self {
        Self { store, settings }
    }

    /// Current expiration window.
    ///
    /// # Errors
    /// Returns [`CheckError::Configuration`] when the configured value is
    /// malformed.
    pub fn ttl(&self) -> Result<Duration, CheckError> {
        let days = self
            .settings
            .expiration_days()?
            .unwrap_or(DEFAULT_EXPIRATION_DAYS);
        Ok(Duration::days(i64::from(days)))
    }

    /// Decides whether `record` is expired at `now`, invalidating its hash
    /// siblings when it is and `update_if_expired` is set.
    ///
    /// # Errors
    /// Returns [`CheckError::InvalidArgument`] when `record` is absent, and
    /// propagates configuration and storage failures.
    pub fn is_expired_at(
        &self,
        record: Option<&PackageRecord>,
        update_if_expired: bool,
        force: bool,
        now: OffsetDateTime,
    ) -> Result<bool, CheckError> {
        let record = record.ok_or_else(|| CheckError::missing("packageInfo"))?;

        let ttl = match (&record.state, force) {
            (PackageState::Succeeded { .. }, false) => self.ttl()?,
            _ => Duration::ZERO,
        };
        let verdict = freshness(record, force, ttl, now);
        debug!(
            package_id = %record.id,
            hash = %record.hash,
            state = record.state.as_str(),
            ?verdict,
            "freshness checked"
        );

        if verdict.is_expired() && update_if_expired {
            let touched = self.store.invalidate_hash(&record.hash)?;
            info!(hash = %record.hash, touched, "invalidated package records sharing hash");
        }

        Ok(verdict.is_expired())
    }

    /// [`ExpirationPolicy::is_expired_at`] evaluated now.
    ///
    /// # Errors
    /// See [`ExpirationPolicy::is_expired_at`].
    pub fn is_expired_now(
        &self,
        record: Option<&PackageRecord>,
        update_if_expired: bool,
        force: bool,
    ) -> Result<bool, CheckError> {
        self.is_expired_at(record, update_if_expired, force, now_utc())
    }
}

impl FreshnessCheck for ExpirationPolicy<'_> {
    fn is_expired(
        &self,
        package_info: &PackageRecord,
        update: bool,
        force: bool,
    ) -> Result<bool, CheckError> {
        self.is_expired_now(Some(package_info), update, force)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::PackageId;
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingStore {
        invalidated: RefCell<Vec<String>>,
    }

    impl PackageStore for RecordingStore {
        fn find_latest_by_hash(&self, _hash: &str) -> Result<Option<PackageRecord>, CheckError> {
            Ok(None)
        }

        fn get_package(&self, _id: PackageId) -> Result<Option<PackageRecord>, CheckError> {
            Ok(None)
        }

        fn insert_package(&self, _record: &PackageRecord) -> Result<(), CheckError> {
            Ok(())
        }

        fn update_package_state(
            &self,
            _id: PackageId,
            _state: &PackageState,
        ) -> Result<bool, CheckError> {
            Ok(false)
        }

        fn invalidate_hash(&self, hash: &str) -> Result<usize, CheckError> {
            self.invalidated.borrow_mut().push(hash.to_string());
            Ok(1)
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn now() -> OffsetDateTime {
        must_ok(crate::parse_rfc3339_utc("2026-03-01T12:00:00Z"))
    }

    fn record(state: PackageState, age: Duration) -> PackageRecord {
        let mut record = PackageRecord::pending("left-pad", false, "1", now() - age);
        record.state = state;
        record
    }

    fn succeeded() -> PackageState {
        PackageState::Succeeded { meta: json!({}) }
    }

    fn check(
        settings: &StaticSettings,
        record: &PackageRecord,
        update: bool,
        force: bool,
    ) -> (bool, Vec<String>) {
        let store = RecordingStore::default();
        let policy = ExpirationPolicy::new(&store, settings);
        let expired = must_ok(policy.is_expired_at(Some(record), update, force, now()));
        let calls = store.invalidated.borrow().clone();
        (expired, calls)
    }

    #[test]
    fn absent_record_is_invalid_argument() {
        let store = RecordingStore::default();
        let settings = StaticSettings::default();
        let policy = ExpirationPolicy::new(&store, &settings);
        assert!(matches!(
            policy.is_expired_at(None, true, true, now()),
            Err(CheckError::InvalidArgument(_))
        ));
    }

    #[test]
    fn state_matrix_without_force_or_update() {
        let settings = StaticSettings::default();
        let fresh = Duration::ZERO;
        assert_eq!(
            check(&settings, &record(PackageState::Pending, fresh), false, false),
            (false, vec![])
        );
        assert_eq!(
            check(&settings, &record(PackageState::failed("x"), fresh), false, false),
            (true, vec![])
        );
        assert_eq!(
            check(&settings, &record(succeeded(), fresh), false, false),
            (false, vec![])
        );
    }

    #[test]
    fn force_expires_every_state_and_invalidates_when_updating() {
        let settings = StaticSettings::default();
        for state in [PackageState::Pending, PackageState::failed("x"), succeeded()] {
            let (expired, calls) =
                check(&settings, &record(state.clone(), Duration::ZERO), true, true);
            assert!(expired);
            assert_eq!(calls, vec!["1".to_string()]);

            let (expired, calls) = check(&settings, &record(state, Duration::ZERO), false, true);
            assert!(expired);
            assert!(calls.is_empty());
        }
    }

    #[test]
    fn update_invalidates_only_when_expired() {
        let settings = StaticSettings::default();
        assert_eq!(
            check(&settings, &record(PackageState::Pending, Duration::ZERO), true, false),
            (false, vec![])
        );
        assert_eq!(
            check(&settings, &record(PackageState::failed("x"), Duration::ZERO), true, false),
            (true, vec!["1".to_string()])
        );
        assert_eq!(
            check(&settings, &record(succeeded(), Duration::ZERO), true, false),
            (false, vec![])
        );
    }

    #[test]
    fn default_window_is_one_day() {
        let settings = StaticSettings::default();
        let inside = Duration::DAY - Duration::SECOND;
        let outside = Duration::DAY + Duration::SECOND;

        assert_eq!(
            check(&settings, &record(succeeded(), inside), true, false),
            (false, vec![])
        );
        assert_eq!(
            check(&settings, &record(succeeded(), outside), false, false),
            (true, vec![])
        );
        assert_eq!(
            check(&settings, &record(succeeded(), outside), true, false),
            (true, vec!["1".to_string()])
        );
    }

    #[test]
    fn custom_window_of_three_days() {
        let settings = StaticSettings {
            expiration_days: Some(3),
        };
        let inside = Duration::days(3) - Duration::SECOND;
        let outside = Duration::days(3) + Duration::SECOND;

        assert_eq!(
            check(&settings, &record(succeeded(), inside), true, false),
            (false, vec![])
        );
        assert_eq!(
            check(&settings, &record(succeeded(), outside), true, false),
            (true, vec!["1".to_string()])
        );
    }

    #[test]
    fn expiration_days_parsing() {
        assert_eq!(parse_expiration_days(None), Ok(None));
        assert_eq!(parse_expiration_days(Some("  ")), Ok(None));
        assert_eq!(parse_expiration_days(Some("3")), Ok(Some(3)));
        assert!(matches!(
            parse_expiration_days(Some("0")),
            Err(CheckError::Configuration(_))
        ));
        assert!(parse_expiration_days(Some("1.5")).is_err());
        assert!(parse_expiration_days(Some("-2")).is_err());
    }

    #[test]
    fn malformed_window_surfaces_for_succeeded_records_only() {
        struct Broken;
        impl SettingsSource for Broken {
            fn expiration_days(&self) -> Result<Option<u32>, CheckError> {
                parse_expiration_days(Some("soon"))
            }
        }

        let store = RecordingStore::default();
        let policy = ExpirationPolicy::new(&store, &Broken);
        let pending = record(PackageState::Pending, Duration::ZERO);
        assert_eq!(policy.is_expired_at(Some(&pending), true, false, now()), Ok(false));
        let done = record(succeeded(), Duration::ZERO);
        assert!(policy.is_expired_at(Some(&done), true, false, now()).is_err());
    }

    proptest! {
        #[test]
        fn prop_pending_never_expires_without_force(
            age_secs in 0i64..10_000_000,
            update in any::<bool>(),
            days in prop::option::of(1u32..30),
        ) {
            let settings = StaticSettings { expiration_days: days };
            let pending = record(PackageState::Pending, Duration::seconds(age_secs));
            let (expired, calls) = check(&settings, &pending, update, false);
            prop_assert!(!expired);
            prop_assert!(calls.is_empty());
        }

        #[test]
        fn prop_failed_always_expires(
            age_secs in 0i64..10_000_000,
            update in any::<bool>(),
            force in any::<bool>(),
        ) {
            let settings = StaticSettings::default();
            let failed = record(PackageState::failed("x"), Duration::seconds(age_secs));
            let (expired, calls) = check(&settings, &failed, update, force);
            prop_assert!(expired);
            prop_assert_eq!(calls.len(), usize::from(update));
        }
    }
}
