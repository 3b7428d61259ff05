//! Crash detection from accelerometer samples.
//!
//! [`MotionSampler`] turns a stream of [`MotionSample`]s into debounced,
//! severity-classified [`ImpactEvent`]s. The force of a sample is the
//! magnitude of its change against the previous sample (in g), so a steady
//! gravity vector contributes nothing once the first sample has been seen.
//!
//! [`SpeedTracker`] smooths GPS ground speed and decides when the device is
//! in driving mode. The sampler refuses to classify anything below the
//! configured minimum speed.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// One accelerometer reading in g.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// X axis acceleration.
    pub x: f64,
    /// Y axis acceleration.
    pub y: f64,
    /// Z axis acceleration.
    pub z: f64,
    /// When the sample arrived.
    pub at: DateTime<Utc>,
}

impl MotionSample {
    /// Create a sample stamped with the given arrival time.
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64, at: DateTime<Utc>) -> Self {
        Self { x, y, z, at }
    }

    /// Magnitude of the difference between this sample and `previous`.
    #[must_use]
    pub fn delta_force(&self, previous: &Self) -> f64 {
        let dx = self.x - previous.x;
        let dy = self.y - previous.y;
        let dz = self.z - previous.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Severity of a detected impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpactSeverity {
    /// Force crossed the moderate threshold.
    Moderate,
    /// Force crossed the severe threshold.
    Severe,
}

impl fmt::Display for ImpactSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moderate => write!(f, "MODERATE"),
            Self::Severe => write!(f, "SEVERE"),
        }
    }
}

/// A debounced, classified impact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactEvent {
    /// Classified severity.
    pub severity: ImpactSeverity,
    /// Force in g, rounded to two decimals.
    pub magnitude_g: f64,
    /// Arrival time of the sample that produced the event.
    pub occurred_at: DateTime<Utc>,
}

/// Crash detection sensitivity profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Fewer false positives, needs harder impacts.
    Low,
    /// Balanced default.
    #[default]
    Medium,
    /// Triggers on lighter impacts.
    High,
}

impl Sensitivity {
    /// Default thresholds for this profile.
    #[must_use]
    pub const fn thresholds(self) -> Thresholds {
        match self {
            Self::Low => Thresholds {
                moderate_g: 2.5,
                severe_g: 4.0,
            },
            Self::Medium => Thresholds {
                moderate_g: 2.0,
                severe_g: 3.5,
            },
            Self::High => Thresholds {
                moderate_g: 1.5,
                severe_g: 2.8,
            },
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown sensitivity '{other}'")),
        }
    }
}

/// Force thresholds in g.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Force at or above which an impact is moderate.
    pub moderate_g: f64,
    /// Force at or above which an impact is severe.
    pub severe_g: f64,
}

impl Thresholds {
    /// Classify a force against these thresholds.
    #[must_use]
    pub fn classify(&self, force: f64) -> Option<ImpactSeverity> {
        if force >= self.severe_g {
            Some(ImpactSeverity::Severe)
        } else if force >= self.moderate_g {
            Some(ImpactSeverity::Moderate)
        } else {
            None
        }
    }
}

/// Tuning for a [`MotionSampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    /// Classification thresholds.
    pub thresholds: Thresholds,
    /// Minimum ground speed in km/h for classification.
    pub min_speed_kmh: f64,
    /// Minimum time between two emitted events, in milliseconds.
    pub cooldown_ms: i64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            thresholds: Sensitivity::Medium.thresholds(),
            min_speed_kmh: 10.0,
            cooldown_ms: 5_000,
        }
    }
}

/// Streaming impact classifier.
///
/// One sampler belongs to one monitoring session. `process` does no I/O and
/// is cheap enough to run for every sample at the sensor rate.
#[derive(Debug, Clone)]
pub struct MotionSampler {
    config: SamplerConfig,
    last_sample: Option<MotionSample>,
    last_impact_at: Option<DateTime<Utc>>,
    ground_speed_kmh: f64,
}

impl MotionSampler {
    /// Create a sampler with the given tuning.
    #[must_use]
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            last_sample: None,
            last_impact_at: None,
            ground_speed_kmh: 0.0,
        }
    }

    /// Update the ground speed used for gating.
    pub fn set_ground_speed(&mut self, kmh: f64) {
        self.ground_speed_kmh = kmh;
    }

    /// Feed one sample, returning an event if it qualifies.
    pub fn process(&mut self, sample: MotionSample) -> Option<ImpactEvent> {
        // Before the first reading the device is assumed at rest on all axes.
        let previous = self
            .last_sample
            .unwrap_or(MotionSample::new(0.0, 0.0, 0.0, sample.at));
        self.last_sample = Some(sample);

        let force = sample.delta_force(&previous);
        trace!(force, speed = self.ground_speed_kmh, "motion sample");

        if self.ground_speed_kmh < self.config.min_speed_kmh {
            return None;
        }

        let severity = self.config.thresholds.classify(force)?;

        if let Some(last) = self.last_impact_at {
            let since = sample.at.signed_duration_since(last).num_milliseconds();
            if since < self.config.cooldown_ms {
                debug!(
                    "Suppressing {} impact ({:.2} g), {} ms into cooldown",
                    severity, force, since
                );
                return None;
            }
        }

        self.last_impact_at = Some(sample.at);
        let event = ImpactEvent {
            severity,
            magnitude_g: round_hundredths(force),
            occurred_at: sample.at,
        };
        info!(
            "Impact detected: {} at {:.2} g ({:.0} km/h)",
            event.severity, event.magnitude_g, self.ground_speed_kmh
        );
        Some(event)
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Tuning for a [`SpeedTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedConfig {
    /// Number of readings in the moving average.
    pub window: usize,
    /// Smoothed speed at or above which driving mode turns on.
    pub activation_kmh: f64,
    /// Smoothed speed below which driving mode turns off.
    pub deactivation_kmh: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            window: 5,
            activation_kmh: 20.0,
            deactivation_kmh: 5.0,
        }
    }
}

/// Driving mode transition reported by [`SpeedTracker::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrivingTransition {
    /// Driving mode turned on.
    Started,
    /// Driving mode turned off.
    Stopped,
}

/// Moving-average ground speed with driving mode hysteresis.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    config: SpeedConfig,
    readings: VecDeque<f64>,
    smoothed_kmh: f64,
    driving: bool,
}

impl SpeedTracker {
    /// Create a tracker with the given tuning.
    #[must_use]
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            readings: VecDeque::with_capacity(config.window.max(1)),
            config,
            smoothed_kmh: 0.0,
            driving: false,
        }
    }

    /// Record a raw speed reading in km/h.
    ///
    /// Negative or non-finite readings (no GPS speed) count as zero.
    pub fn observe(&mut self, raw_kmh: f64) -> Option<DrivingTransition> {
        let reading = if raw_kmh.is_finite() && raw_kmh > 0.0 {
            raw_kmh.round()
        } else {
            0.0
        };

        if self.readings.len() >= self.config.window.max(1) {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);

        #[allow(clippy::cast_precision_loss)]
        let average = self.readings.iter().sum::<f64>() / self.readings.len() as f64;
        self.smoothed_kmh = average.round();

        if !self.driving && self.smoothed_kmh >= self.config.activation_kmh {
            self.driving = true;
            info!("Driving mode activated at {} km/h", self.smoothed_kmh);
            Some(DrivingTransition::Started)
        } else if self.driving && self.smoothed_kmh < self.config.deactivation_kmh {
            self.driving = false;
            info!("Driving mode deactivated at {} km/h", self.smoothed_kmh);
            Some(DrivingTransition::Stopped)
        } else {
            None
        }
    }

    /// Smoothed speed in km/h.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.smoothed_kmh
    }

    /// Whether driving mode is on.
    #[must_use]
    pub fn is_driving(&self) -> bool {
        self.driving
    }
}

/// Convert a speed in m/s to km/h.
#[must_use]
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * 3.6
}

/// A message on the monitoring channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    /// An accelerometer reading.
    Motion(MotionSample),
    /// A ground speed reading in km/h.
    Speed(f64),
}
