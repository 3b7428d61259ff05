//! Alert records and their wire representation.
//!
//! An [`AlertRecord`] is the durable unit of the pipeline. Records are built
//! by the composer, then only their [`DeliveryState`] changes, and only
//! forward (see [`DeliveryState::can_transition_to`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::motion::{ImpactEvent, ImpactSeverity};

/// What raised the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Detected by the motion sampler.
    Crash,
    /// Raised manually by the user.
    Sos,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crash => write!(f, "CRASH"),
            Self::Sos => write!(f, "SOS"),
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// Moderate impact.
    Moderate,
    /// Severe impact.
    Severe,
    /// Manual SOS.
    Critical,
}

impl From<ImpactSeverity> for AlertSeverity {
    fn from(severity: ImpactSeverity) -> Self {
        match severity {
            ImpactSeverity::Moderate => Self::Moderate,
            ImpactSeverity::Severe => Self::Severe,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moderate => write!(f, "MODERATE"),
            Self::Severe => write!(f, "SEVERE"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Whether an alert has reached the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    /// Composed, not yet attempted.
    Pending,
    /// Written to the remote store.
    Sent,
    /// Remote write failed; kept in the local pending queue.
    FailedLocal,
}

impl DeliveryState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent | Self::FailedLocal)
                | (Self::FailedLocal, Self::Sent | Self::FailedLocal)
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Sent => write!(f, "SENT"),
            Self::FailedLocal => write!(f, "FAILED_LOCAL"),
        }
    }
}

/// A location fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy_meters: f64,
}

/// Who the alert is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    /// Account identifier.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Contact email.
    pub user_email: String,
    /// Contact phone.
    pub user_phone: String,
}

impl UserIdentity {
    /// Placeholder user id.
    pub const UNKNOWN_ID: &'static str = "demo_user";
    /// Placeholder display name.
    pub const UNKNOWN_NAME: &'static str = "Unknown User";
    /// Placeholder email.
    pub const UNKNOWN_EMAIL: &'static str = "demo@rescuelink.com";
    /// Placeholder phone.
    pub const UNKNOWN_PHONE: &'static str = "N/A";

    /// Build an identity, filling blanks with placeholders.
    #[must_use]
    pub fn with_fallbacks(
        user_id: Option<String>,
        user_name: Option<String>,
        user_email: Option<String>,
        user_phone: Option<String>,
    ) -> Self {
        fn pick(value: Option<String>, fallback: &str) -> String {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        }

        Self {
            user_id: pick(user_id, Self::UNKNOWN_ID),
            user_name: pick(user_name, Self::UNKNOWN_NAME),
            user_email: pick(user_email, Self::UNKNOWN_EMAIL),
            user_phone: pick(user_phone, Self::UNKNOWN_PHONE),
        }
    }
}

impl Default for UserIdentity {
    fn default() -> Self {
        Self::with_fallbacks(None, None, None, None)
    }
}

/// What the composer is building an alert for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    /// A detected impact.
    Impact(ImpactEvent),
    /// A manual SOS.
    Sos,
}

impl Trigger {
    /// The alert kind this trigger produces.
    #[must_use]
    pub fn kind(&self) -> AlertKind {
        match self {
            Self::Impact(_) => AlertKind::Crash,
            Self::Sos => AlertKind::Sos,
        }
    }

    /// The alert severity this trigger produces.
    #[must_use]
    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::Impact(event) => event.severity.into(),
            Self::Sos => AlertSeverity::Critical,
        }
    }
}

static ALERT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate an alert id of the form `{KIND}-{epochMillis}-{suffix}`.
///
/// The suffix is a BLAKE3 digest over the timestamp, a process-wide counter
/// and the process id, so two alerts in the same millisecond still differ.
#[must_use]
pub fn generate_alert_id(kind: AlertKind, now: DateTime<Utc>) -> String {
    generate_id(&kind.to_string(), now)
}

/// Generate a location update id, `UPDATE-{epochMillis}-{suffix}`.
#[must_use]
pub fn generate_update_id(now: DateTime<Utc>) -> String {
    generate_id("UPDATE", now)
}

fn generate_id(prefix: &str, now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis();
    let sequence = ALERT_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&millis.to_le_bytes());
    hasher.update(&now.timestamp_subsec_nanos().to_le_bytes());
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let digest = hasher.finalize().to_hex();

    format!("{prefix}-{millis}-{}", &digest[..8])
}

/// The durable emergency alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    /// Unique alert id, also used as the remote document id.
    pub alert_id: String,
    /// Crash or SOS.
    pub kind: AlertKind,
    /// Alert severity.
    pub severity: AlertSeverity,
    /// Account identifier.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Contact email.
    pub user_email: String,
    /// Contact phone.
    pub user_phone: String,
    /// Location fix, if one was available.
    pub location: Option<GeoPoint>,
    /// When the alert was composed.
    pub created_at: DateTime<Utc>,
    /// Delivery lifecycle.
    pub delivery_state: DeliveryState,
}

impl AlertRecord {
    /// Move to a new delivery state, refusing backward transitions.
    ///
    /// Returns `false` (leaving the state unchanged) if the move is not allowed.
    pub fn transition(&mut self, next: DeliveryState) -> bool {
        if self.delivery_state.can_transition_to(next) {
            self.delivery_state = next;
            true
        } else {
            false
        }
    }

    /// The JSON document written to the remote store.
    ///
    /// With `zero_fill_location`, a missing location is sent as zero
    /// coordinates instead of `null`.
    #[must_use]
    pub fn to_wire(&self, zero_fill_location: bool) -> WireAlert<'_> {
        let location = match self.location {
            Some(point) => Some(WireLocation {
                latitude: point.latitude,
                longitude: point.longitude,
                accuracy: point.accuracy_meters,
            }),
            None if zero_fill_location => Some(WireLocation::default()),
            None => None,
        };

        WireAlert {
            alert_id: &self.alert_id,
            kind: self.kind,
            severity: self.severity,
            user_id: &self.user_id,
            user_name: &self.user_name,
            user_email: &self.user_email,
            user_phone: &self.user_phone,
            location,
            created_at: self.created_at,
            delivery_state: self.delivery_state,
        }
    }

    /// Rebuild a record from a remote document.
    ///
    /// Zero coordinates with zero accuracy are read back as "no location".
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not have the alert shape.
    pub fn from_wire(value: serde_json::Value) -> serde_json::Result<Self> {
        let wire: OwnedWireAlert = serde_json::from_value(value)?;
        let location = wire
            .location
            .filter(|l| !(l.latitude == 0.0 && l.longitude == 0.0 && l.accuracy == 0.0))
            .map(|l| GeoPoint {
                latitude: l.latitude,
                longitude: l.longitude,
                accuracy_meters: l.accuracy,
            });

        Ok(Self {
            alert_id: wire.alert_id,
            kind: wire.kind,
            severity: wire.severity,
            user_id: wire.user_id,
            user_name: wire.user_name,
            user_email: wire.user_email,
            user_phone: wire.user_phone,
            location,
            created_at: wire.created_at,
            delivery_state: wire.delivery_state,
        })
    }
}

/// Location as the remote schema spells it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WireLocation {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy: f64,
}

/// Borrowed view of an [`AlertRecord`] in remote document shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAlert<'a> {
    alert_id: &'a str,
    kind: AlertKind,
    severity: AlertSeverity,
    user_id: &'a str,
    user_name: &'a str,
    user_email: &'a str,
    user_phone: &'a str,
    location: Option<WireLocation>,
    created_at: DateTime<Utc>,
    delivery_state: DeliveryState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedWireAlert {
    alert_id: String,
    kind: AlertKind,
    severity: AlertSeverity,
    user_id: String,
    user_name: String,
    user_email: String,
    user_phone: String,
    location: Option<WireLocation>,
    created_at: DateTime<Utc>,
    delivery_state: DeliveryState,
}

/// A fresh location fix sent after an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Unique update id, also used as the remote document id.
    pub update_id: String,
    /// The alert this update follows.
    pub alert_id: String,
    /// Account identifier.
    pub user_id: String,
    /// The new fix.
    pub location: GeoPoint,
    /// When the fix was taken.
    pub created_at: DateTime<Utc>,
}

impl LocationUpdate {
    /// `updateType` of every update this crate sends.
    pub const UPDATE_TYPE: &'static str = "ADDITIONAL_INFO";
    /// `status` of every update this crate sends.
    pub const STATUS: &'static str = "UPDATE";
    /// Human-readable `message` sent with the update.
    pub const MESSAGE: &'static str = "User provided additional location update";

    /// Build an update taken at `now`.
    #[must_use]
    pub fn new(
        alert_id: impl Into<String>,
        user_id: impl Into<String>,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            update_id: generate_update_id(now),
            alert_id: alert_id.into(),
            user_id: user_id.into(),
            location,
            created_at: now,
        }
    }

    /// The JSON document written to the updates collection.
    #[must_use]
    pub fn to_wire(&self) -> WireLocationUpdate<'_> {
        WireLocationUpdate {
            update_id: &self.update_id,
            alert_id: &self.alert_id,
            user_id: &self.user_id,
            update_type: Self::UPDATE_TYPE,
            message: Self::MESSAGE,
            location: WireFix {
                latitude: self.location.latitude,
                longitude: self.location.longitude,
                accuracy: self.location.accuracy_meters,
                timestamp: self.created_at,
            },
            timestamp: self.created_at,
            status: Self::STATUS,
        }
    }
}

/// Borrowed view of a [`LocationUpdate`] in remote document shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLocationUpdate<'a> {
    update_id: &'a str,
    alert_id: &'a str,
    user_id: &'a str,
    update_type: &'static str,
    message: &'static str,
    location: WireFix,
    timestamp: DateTime<Utc>,
    status: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct WireFix {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    timestamp: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn sample_record(alert_id: &str, kind: AlertKind) -> AlertRecord {
    AlertRecord {
        alert_id: alert_id.to_string(),
        kind,
        severity: if kind == AlertKind::Sos {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Severe
        },
        user_id: "u-1".to_string(),
        user_name: "Maria Santos".to_string(),
        user_email: "maria@example.com".to_string(),
        user_phone: "+63 917 000 0000".to_string(),
        location: None,
        created_at: Utc::now(),
        delivery_state: DeliveryState::Pending,
    }
}
