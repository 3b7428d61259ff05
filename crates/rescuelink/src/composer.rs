//! Alert composition.
//!
//! Turns an impact event or a manual SOS into an [`AlertRecord`]. Composing
//! never fails: missing identity falls back to placeholders and a missing
//! location fix becomes `None`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::alert::{generate_alert_id, AlertRecord, DeliveryState, GeoPoint, Trigger, UserIdentity};
use crate::device::{LocationProvider, Permission};
use crate::storage::KeyValueStore;
use crate::Result;

/// Key of the user id.
pub const USER_ID_KEY: &str = "userId";
/// Key of the display name.
pub const USER_NAME_KEY: &str = "userName";
/// Key of the contact email.
pub const USER_EMAIL_KEY: &str = "userEmail";
/// Key of the contact phone.
pub const USER_PHONE_KEY: &str = "userPhone";
/// Key of the cached last location fix.
pub const LAST_LOCATION_KEY: &str = "@last_known_location";

/// Tuning for an [`AlertComposer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposerConfig {
    /// Upper bound on waiting for a location fix.
    pub location_timeout: Duration,
    /// Use the cached fix when a fresh one is unavailable.
    pub fallback_to_last_known: bool,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            location_timeout: Duration::from_millis(5_000),
            fallback_to_last_known: false,
        }
    }
}

/// Builds alert records from triggers.
#[derive(Debug, Clone)]
pub struct AlertComposer {
    store: Arc<dyn KeyValueStore>,
    location: Arc<dyn LocationProvider>,
    config: ComposerConfig,
}

impl AlertComposer {
    /// Create a composer reading identity from `store` and fixes from `location`.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        location: Arc<dyn LocationProvider>,
        config: ComposerConfig,
    ) -> Self {
        Self {
            store,
            location,
            config,
        }
    }

    /// Compose a record for `trigger`, stamped now.
    pub async fn compose(&self, trigger: Trigger) -> AlertRecord {
        let identity = self.load_identity();
        let location = self.locate().await;
        compose_record(trigger, &identity, location, Utc::now())
    }

    /// Read the stored identity, with placeholders for anything missing.
    ///
    /// Storage errors are logged and treated as missing values.
    #[must_use]
    pub fn load_identity(&self) -> UserIdentity {
        let keys = [USER_ID_KEY, USER_NAME_KEY, USER_EMAIL_KEY, USER_PHONE_KEY];
        let values = match self.store.multi_get(&keys) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "failed to read user profile, using placeholders");
                Vec::new()
            }
        };

        let lookup = |key: &str| {
            values
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.clone())
        };

        UserIdentity::with_fallbacks(
            lookup(USER_ID_KEY),
            lookup(USER_NAME_KEY),
            lookup(USER_EMAIL_KEY),
            lookup(USER_PHONE_KEY),
        )
    }

    /// Persist the user identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn save_identity(&self, identity: &UserIdentity) -> Result<()> {
        self.store.multi_set(&[
            (USER_ID_KEY, identity.user_id.as_str()),
            (USER_NAME_KEY, identity.user_name.as_str()),
            (USER_EMAIL_KEY, identity.user_email.as_str()),
            (USER_PHONE_KEY, identity.user_phone.as_str()),
        ])
    }

    /// Get a location fix within the configured timeout.
    ///
    /// Denied permission, a timeout or a provider error all yield `None`,
    /// or the cached fix when fallback is enabled.
    pub async fn locate(&self) -> Option<GeoPoint> {
        let timeout = self.config.location_timeout;

        let fix = match tokio::time::timeout(timeout, self.fresh_fix(timeout)).await {
            Ok(fix) => fix,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis(), "location fix timed out");
                None
            }
        };

        if let Some(point) = fix {
            self.remember(point);
            return Some(point);
        }

        if self.config.fallback_to_last_known {
            let cached = self.last_known();
            if cached.is_some() {
                debug!("using last known location");
            }
            return cached;
        }
        None
    }

    async fn fresh_fix(&self, timeout: Duration) -> Option<GeoPoint> {
        if self.location.request_permission().await == Permission::Denied {
            warn!("location permission denied");
            return None;
        }

        match self.location.current_location(timeout).await {
            Ok(point) => Some(point),
            Err(e) => {
                warn!(error = %e, "location unavailable");
                None
            }
        }
    }

    fn remember(&self, point: GeoPoint) {
        let stored = serde_json::to_string(&point)
            .map_err(crate::Error::from)
            .and_then(|raw| self.store.set(LAST_LOCATION_KEY, &raw));
        if let Err(e) = stored {
            debug!(error = %e, "failed to cache location");
        }
    }

    /// The cached last fix, if any.
    #[must_use]
    pub fn last_known(&self) -> Option<GeoPoint> {
        let raw = self.store.get(LAST_LOCATION_KEY).ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Assemble a record from already-gathered parts.
#[must_use]
pub fn compose_record(
    trigger: Trigger,
    identity: &UserIdentity,
    location: Option<GeoPoint>,
    now: DateTime<Utc>,
) -> AlertRecord {
    let kind = trigger.kind();
    AlertRecord {
        alert_id: generate_alert_id(kind, now),
        kind,
        severity: trigger.severity(),
        user_id: identity.user_id.clone(),
        user_name: identity.user_name.clone(),
        user_email: identity.user_email.clone(),
        user_phone: identity.user_phone.clone(),
        location,
        created_at: now,
        delivery_state: DeliveryState::Pending,
    }
}
