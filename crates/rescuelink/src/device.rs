//! Device collaborators: location, vibration and motion input.
//!
//! The pipeline only talks to these traits. The CLI plugs in a fixed
//! location from the config file, an actuator that logs, and a motion
//! source that replays a recorded sensor stream.

use std::fmt::Debug;
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::alert::GeoPoint;
use crate::motion::{mps_to_kmh, MotionSample, SensorEvent};
use crate::{Error, Result};

/// Vibration pattern played once per countdown second.
pub const COUNTDOWN_PATTERN: &[u64] = &[0, 400, 200, 400];

/// Vibration pattern played, repeating, when a crash alert is raised.
pub const CRASH_PATTERN: &[u64] = &[0, 1000, 200, 1000, 200, 1000];

/// Vibration pattern played, repeating, while an SOS is sent.
pub const SOS_PATTERN: &[u64] = &[0, 1000, 500, 1000];

/// Outcome of a location permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// The app may read the location.
    Granted,
    /// The user or platform refused.
    Denied,
}

/// Source of location fixes.
#[async_trait]
pub trait LocationProvider: Send + Sync + Debug {
    /// Ask for permission to read the location.
    async fn request_permission(&self) -> Permission;

    /// Get a fix, giving up after `timeout`.
    async fn current_location(&self, timeout: Duration) -> Result<GeoPoint>;
}

/// A [`LocationProvider`] that always reports the same configured point.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocationProvider {
    point: Option<GeoPoint>,
}

impl FixedLocationProvider {
    /// Create a provider. With `None` it reports permission denied.
    #[must_use]
    pub fn new(point: Option<GeoPoint>) -> Self {
        Self { point }
    }
}

#[async_trait]
impl LocationProvider for FixedLocationProvider {
    async fn request_permission(&self) -> Permission {
        if self.point.is_some() {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    async fn current_location(&self, _timeout: Duration) -> Result<GeoPoint> {
        self.point.ok_or_else(|| {
            Error::permission_missing(
                "Location",
                "Set [device] latitude and longitude in the config file",
            )
        })
    }
}

/// Haptic feedback.
pub trait Actuator: Send + Sync + Debug {
    /// Play a pattern of alternating wait/vibrate durations in milliseconds.
    fn vibrate(&self, pattern: &[u64], repeat: bool);

    /// Stop any running vibration.
    fn cancel_vibration(&self);
}

/// An [`Actuator`] that writes vibration requests to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogActuator;

impl Actuator for LogActuator {
    fn vibrate(&self, pattern: &[u64], repeat: bool) {
        tracing::info!(?pattern, repeat, "vibrate");
    }

    fn cancel_vibration(&self) {
        tracing::debug!("vibration cancelled");
    }
}

/// A stream of motion and speed readings.
#[async_trait]
pub trait MotionSource: Send + Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether the underlying sensor can produce motion samples.
    fn is_available(&self) -> bool;

    /// Push events into `tx` until the source is exhausted or the receiver
    /// goes away.
    async fn run(self: Box<Self>, tx: mpsc::Sender<SensorEvent>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ReplayLine {
    Motion {
        x: f64,
        y: f64,
        z: f64,
        #[serde(default)]
        at_ms: Option<i64>,
    },
    Speed {
        #[serde(default)]
        kmh: Option<f64>,
        #[serde(default)]
        mps: Option<f64>,
    },
}

/// A [`MotionSource`] that replays a JSON Lines recording.
///
/// Each line is either `{"type":"motion","x":..,"y":..,"z":..,"at_ms":..}`
/// or a speed reading, `{"type":"speed","kmh":..}` or `{"type":"speed","mps":..}`
/// as GPS reports it. `at_ms` is the offset from the start of the recording; lines without it reuse the previous offset. Blank lines
/// and lines starting with `#` are skipped.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    lines: Vec<ReplayLine>,
    started_at: DateTime<Utc>,
    realtime: bool,
}

impl ReplaySource {
    /// Parse a recording from a reader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Replay`] with the offending line number if a line is
    /// not a valid event, or an I/O error if reading fails.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut lines = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(trimmed)
                .map_err(|e| Error::replay(index + 1, e.to_string()))?;
            match parsed {
                ReplayLine::Speed { kmh: None, mps: None } => {
                    return Err(Error::replay(index + 1, "speed line needs `kmh` or `mps`"));
                }
                ReplayLine::Speed {
                    kmh: Some(_),
                    mps: Some(_),
                } => {
                    return Err(Error::replay(index + 1, "speed line has both `kmh` and `mps`"));
                }
                _ => lines.push(parsed),
            }
        }

        Ok(Self {
            lines,
            started_at: Utc::now(),
            realtime: false,
        })
    }

    /// Open and parse a recording file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Sleep between samples according to their offsets.
    #[must_use]
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Anchor sample timestamps at `started_at` instead of the parse time.
    #[must_use]
    pub fn starting_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Number of events in the recording.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the recording has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn events(&self) -> Vec<(i64, SensorEvent)> {
        let mut offset = 0;
        self.lines
            .iter()
            .map(|line| match *line {
                ReplayLine::Motion { x, y, z, at_ms } => {
                    if let Some(at_ms) = at_ms {
                        offset = at_ms;
                    }
                    let at = self.started_at + chrono::Duration::milliseconds(offset);
                    (offset, SensorEvent::Motion(MotionSample::new(x, y, z, at)))
                }
                ReplayLine::Speed { kmh, mps } => {
                    let kmh = kmh.or(mps.map(mps_to_kmh)).unwrap_or_default();
                    (offset, SensorEvent::Speed(kmh))
                }
            })
            .collect()
    }
}

#[async_trait]
impl MotionSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn is_available(&self) -> bool {
        self.lines
            .iter()
            .any(|line| matches!(line, ReplayLine::Motion { .. }))
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<SensorEvent>) -> Result<()> {
        let mut previous_offset = 0;
        for (offset, event) in self.events() {
            if self.realtime && offset > previous_offset {
                let wait = u64::try_from(offset - previous_offset).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            previous_offset = offset;

            if tx.send(event).await.is_err() {
                tracing::debug!("monitor closed, stopping replay");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Test doubles for device collaborators.

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Actuator, LocationProvider, Permission};
    use crate::alert::GeoPoint;
    use crate::{Error, Result};

    #[derive(Debug, Default)]
    pub struct RecordingActuator {
        pub calls: Mutex<Vec<(Vec<u64>, bool)>>,
        pub cancels: Mutex<usize>,
    }

    impl RecordingActuator {
        pub fn patterns(&self) -> Vec<(Vec<u64>, bool)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn cancel_count(&self) -> usize {
            *self.cancels.lock().unwrap()
        }
    }

    impl Actuator for RecordingActuator {
        fn vibrate(&self, pattern: &[u64], repeat: bool) {
            self.calls.lock().unwrap().push((pattern.to_vec(), repeat));
        }

        fn cancel_vibration(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    /// How the scripted provider answers.
    #[derive(Debug, Clone, Copy)]
    pub enum Script {
        Fix(GeoPoint),
        Denied,
        Hang,
        Fail,
    }

    #[derive(Debug)]
    pub struct ScriptedLocation {
        pub script: Mutex<Script>,
    }

    impl ScriptedLocation {
        pub fn new(script: Script) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }

        pub fn set(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }
    }

    #[async_trait]
    impl LocationProvider for ScriptedLocation {
        async fn request_permission(&self) -> Permission {
            match *self.script.lock().unwrap() {
                Script::Denied => Permission::Denied,
                _ => Permission::Granted,
            }
        }

        async fn current_location(&self, _timeout: Duration) -> Result<GeoPoint> {
            let script = *self.script.lock().unwrap();
            match script {
                Script::Fix(point) => Ok(point),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::internal("location provider woke up"))
                }
                Script::Denied | Script::Fail => Err(Error::internal("no fix")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"
# highway, then a hard stop
{"type":"speed","kmh":15}
{"type":"motion","x":0.5,"y":0,"z":0,"at_ms":0}
{"type":"motion","x":1.5,"y":0,"z":0,"at_ms":100}

{"type":"motion","x":3.8,"y":0,"z":0,"at_ms":200}
{"type":"speed","kmh":0}
"#;

    #[test]
    fn test_replay_parses_lines() {
        let source = ReplaySource::from_reader(RECORDING.as_bytes()).unwrap();
        assert_eq!(source.len(), 5);
        assert!(source.is_available());
    }

    #[test]
    fn test_replay_reports_bad_line_number() {
        let input = "{\"type\":\"speed\",\"kmh\":10}\n{\"type\":\"motion\",\"x\":1}\n";
        let err = ReplaySource::from_reader(input.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Replay { line: 2, .. }));
    }

    #[test]
    fn test_replay_without_motion_is_unavailable() {
        let source = ReplaySource::from_reader("{\"type\":\"speed\",\"kmh\":30}\n".as_bytes()).unwrap();
        assert!(!source.is_available());

        let empty = ReplaySource::from_reader("".as_bytes()).unwrap();
        assert!(empty.is_empty());
        assert!(!empty.is_available());
    }

    #[tokio::test]
    async fn test_replay_sends_events_in_order() {
        let start = Utc::now();
        let source = ReplaySource::from_reader(RECORDING.as_bytes())
            .unwrap()
            .starting_at(start);
        let (tx, mut rx) = mpsc::channel(16);

        Box::new(source).run(tx).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], SensorEvent::Speed(15.0));
        match events[3] {
            SensorEvent::Motion(sample) => {
                assert!((sample.x - 3.8).abs() < f64::EPSILON);
                assert_eq!(sample.at, start + chrono::Duration::milliseconds(200));
            }
            SensorEvent::Speed(_) => panic!("expected motion"),
        }
    }

    #[tokio::test]
    async fn test_replay_converts_gps_speed() {
        let input = "{\"type\":\"speed\",\"mps\":10}\n{\"type\":\"speed\",\"kmh\":20}\n";
        let source = ReplaySource::from_reader(input.as_bytes()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        Box::new(source).run(tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(SensorEvent::Speed(36.0)));
        assert_eq!(rx.recv().await, Some(SensorEvent::Speed(20.0)));
    }

    #[test]
    fn test_replay_speed_needs_one_unit() {
        let err = ReplaySource::from_reader("{\"type\":\"speed\"}\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Replay { line: 1, .. }));

        let both = "{\"type\":\"speed\",\"kmh\":1,\"mps\":1}\n";
        let err = ReplaySource::from_reader(both.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[tokio::test]
    async fn test_replay_stops_when_receiver_dropped() {
        let source = ReplaySource::from_reader(RECORDING.as_bytes()).unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(Box::new(source).run(tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_fixed_location_provider() {
        let point = GeoPoint {
            latitude: 14.5995,
            longitude: 120.9842,
            accuracy_meters: 10.0,
        };
        let provider = FixedLocationProvider::new(Some(point));
        assert_eq!(provider.request_permission().await, Permission::Granted);
        assert_eq!(
            provider.current_location(Duration::from_secs(1)).await.unwrap(),
            point
        );

        let missing = FixedLocationProvider::new(None);
        assert_eq!(missing.request_permission().await, Permission::Denied);
        let err = missing
            .current_location(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_permission_error());
    }

    #[test]
    fn test_patterns() {
        assert_eq!(COUNTDOWN_PATTERN, &[0, 400, 200, 400]);
        assert_eq!(CRASH_PATTERN.len(), 6);
        assert_eq!(SOS_PATTERN, &[0, 1000, 500, 1000]);
    }
}
