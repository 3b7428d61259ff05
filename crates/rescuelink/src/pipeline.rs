//! The alert pipeline: sensor events in, delivered alerts out.
//!
//! One [`MonitorSession`] owns the sampler and speed tracker and consumes a
//! single channel of [`SensorEvent`]s. An impact starts a cancellable crash
//! countdown; if nobody cancels it the alert is composed and delivered.
//! Manual SOS skips the countdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alert::{LocationUpdate, Trigger};
use crate::composer::AlertComposer;
use crate::delivery::{DeliveryManager, DeliveryResult, UpdateResult};
use crate::device::{Actuator, MotionSource, COUNTDOWN_PATTERN, CRASH_PATTERN, SOS_PATTERN};
use crate::motion::{
    DrivingTransition, ImpactEvent, MotionSampler, SamplerConfig, SensorEvent, SpeedConfig,
    SpeedTracker,
};
use crate::{Error, Result};

/// Tuning for an [`AlertPipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Impact classification.
    pub sampler: SamplerConfig,
    /// Speed smoothing and driving mode.
    pub speed: SpeedConfig,
    /// Only classify motion while in driving mode.
    pub require_driving_mode: bool,
    /// Time the user has to cancel a crash alert.
    pub countdown: Duration,
    /// Interval between countdown vibrations.
    pub countdown_tick: Duration,
    /// Capacity of the sensor event channel.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            speed: SpeedConfig::default(),
            require_driving_mode: true,
            countdown: Duration::from_secs(10),
            countdown_tick: Duration::from_secs(1),
            channel_capacity: 256,
        }
    }
}

/// Per-session detection state.
#[derive(Debug, Clone)]
pub struct MonitorSession {
    sampler: MotionSampler,
    speed: SpeedTracker,
    require_driving_mode: bool,
}

impl MonitorSession {
    /// Create a session from the pipeline tuning.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            sampler: MotionSampler::new(config.sampler),
            speed: SpeedTracker::new(config.speed),
            require_driving_mode: config.require_driving_mode,
        }
    }

    /// Whether motion samples are currently classified.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        !self.require_driving_mode || self.speed.is_driving()
    }

    /// Smoothed ground speed in km/h.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed.speed()
    }

    /// Feed one event, returning an impact if one was detected.
    pub fn handle(&mut self, event: SensorEvent) -> Option<ImpactEvent> {
        match event {
            SensorEvent::Speed(kmh) => {
                match self.speed.observe(kmh) {
                    Some(DrivingTransition::Started) => {
                        info!(speed_kmh = self.speed.speed(), "driving mode activated");
                    }
                    Some(DrivingTransition::Stopped) => info!("driving mode deactivated"),
                    None => {}
                }
                self.sampler.set_ground_speed(self.speed.speed());
                None
            }
            SensorEvent::Motion(sample) => {
                if self.is_monitoring() {
                    self.sampler.process(sample)
                } else {
                    None
                }
            }
        }
    }
}

/// Cancels running crash countdowns.
///
/// Every countdown listens to the same canceller; a cancel reaches the
/// countdowns that are running at that moment, not later ones.
#[derive(Debug)]
pub struct CountdownCanceller {
    tx: watch::Sender<u64>,
}

impl CountdownCanceller {
    /// Create a canceller.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Cancel every running countdown.
    pub fn cancel(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// A receiver for a countdown to watch.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for CountdownCanceller {
    fn default() -> Self {
        Self::new()
    }
}

/// How a crash countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// The countdown ran out; the alert goes out.
    Elapsed,
    /// The user cancelled.
    Cancelled,
}

/// Summary of one monitoring run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    /// Motion samples received.
    pub motion_samples: usize,
    /// Speed readings received.
    pub speed_readings: usize,
    /// Impacts detected.
    pub impacts: usize,
    /// Impacts ignored because an alert was already in progress.
    pub suppressed: usize,
    /// Countdowns the user cancelled.
    pub cancelled: usize,
    /// Results of crash alerts that were sent.
    pub alerts: Vec<DeliveryResult>,
}

/// Wires the composer, delivery manager and actuator together.
#[derive(Debug)]
pub struct AlertPipeline {
    composer: AlertComposer,
    delivery: Arc<DeliveryManager>,
    actuator: Arc<dyn Actuator>,
    config: PipelineConfig,
}

impl AlertPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        composer: AlertComposer,
        delivery: Arc<DeliveryManager>,
        actuator: Arc<dyn Actuator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            composer,
            delivery,
            actuator,
            config,
        }
    }

    /// The composer in use.
    #[must_use]
    pub fn composer(&self) -> &AlertComposer {
        &self.composer
    }

    /// The delivery manager in use.
    #[must_use]
    pub fn delivery(&self) -> &Arc<DeliveryManager> {
        &self.delivery
    }

    /// Send a manual SOS immediately.
    ///
    /// # Errors
    ///
    /// Returns an error only if the delivery task panicked.
    pub async fn trigger_sos(&self) -> Result<DeliveryResult> {
        info!("SOS triggered");
        self.actuator.vibrate(SOS_PATTERN, true);

        let record = self.composer.compose(Trigger::Sos).await;
        let result = self.deliver(record).await;

        self.actuator.cancel_vibration();
        result
    }

    /// Send a fresh location fix for an alert that was already raised.
    ///
    /// The fix is bounded by the composer's location timeout. A failed
    /// remote write keeps the update in the local updates queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocationUnavailable`] if no fix was obtained, or an
    /// error if the delivery task panicked.
    pub async fn send_location_update(&self, alert_id: &str) -> Result<UpdateResult> {
        let location = self
            .composer
            .locate()
            .await
            .ok_or(Error::LocationUnavailable)?;
        let identity = self.composer.load_identity();
        let update = LocationUpdate::new(alert_id, identity.user_id, location, chrono::Utc::now());
        debug!(alert_id, update_id = %update.update_id, "sending location update");

        let delivery = Arc::clone(&self.delivery);
        let result = tokio::spawn(async move { delivery.send_update(update).await })
            .await
            .map_err(|e| Error::internal(format!("location update task failed: {e}")))?;

        if result.delivered {
            info!(alert_id, "{}", result.user_message());
        } else {
            warn!(alert_id, "{}", result.user_message());
        }
        Ok(result)
    }

    /// Run the crash countdown for `event` and deliver unless cancelled.
    ///
    /// Returns `Ok(None)` if the countdown was cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the delivery task panicked.
    pub async fn handle_impact(
        &self,
        event: ImpactEvent,
        mut cancel: watch::Receiver<u64>,
    ) -> Result<Option<DeliveryResult>> {
        warn!(
            severity = %event.severity,
            magnitude_g = event.magnitude_g,
            countdown_secs = self.config.countdown.as_secs(),
            "impact detected, starting countdown"
        );

        let outcome = run_countdown(
            self.config.countdown,
            self.config.countdown_tick,
            self.actuator.as_ref(),
            &mut cancel,
        )
        .await;

        if outcome == CountdownOutcome::Cancelled {
            info!("crash alert cancelled by user");
            self.actuator.cancel_vibration();
            return Ok(None);
        }

        self.actuator.vibrate(CRASH_PATTERN, true);
        let record = self.composer.compose(Trigger::Impact(event)).await;
        let result = self.deliver(record).await;
        self.actuator.cancel_vibration();
        result.map(Some)
    }

    /// Consume `source` until it is exhausted, alerting on impacts.
    ///
    /// Only one crash alert is in progress at a time; impacts detected while
    /// one is counting down or being delivered are counted as suppressed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SensorUnavailable`] if the source has no motion
    /// sensor, or the source's own error if reading it fails.
    pub async fn monitor(
        self: &Arc<Self>,
        source: Box<dyn MotionSource>,
        canceller: &CountdownCanceller,
    ) -> Result<MonitorReport> {
        if !source.is_available() {
            return Err(Error::SensorUnavailable {
                name: source.name(),
            });
        }

        info!(source = source.name(), "crash monitoring started");
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let reader = tokio::spawn(source.run(tx));

        let mut session = MonitorSession::new(&self.config);
        let mut report = MonitorReport::default();
        let mut in_flight: Option<JoinHandle<Result<Option<DeliveryResult>>>> = None;

        while let Some(event) = rx.recv().await {
            match event {
                SensorEvent::Motion(_) => report.motion_samples += 1,
                SensorEvent::Speed(_) => report.speed_readings += 1,
            }

            let Some(impact) = session.handle(event) else {
                continue;
            };
            report.impacts += 1;

            if let Some(handle) = in_flight.take() {
                if handle.is_finished() {
                    Self::record_alert(&mut report, handle.await);
                } else {
                    debug!("alert already in progress, ignoring impact");
                    report.suppressed += 1;
                    in_flight = Some(handle);
                    continue;
                }
            }

            let pipeline = Arc::clone(self);
            let cancel = canceller.subscribe();
            in_flight = Some(tokio::spawn(async move {
                pipeline.handle_impact(impact, cancel).await
            }));
        }

        if let Some(handle) = in_flight {
            Self::record_alert(&mut report, handle.await);
        }

        reader
            .await
            .map_err(|e| Error::internal(format!("sensor task failed: {e}")))??;

        info!(
            samples = report.motion_samples,
            impacts = report.impacts,
            alerts = report.alerts.len(),
            "crash monitoring stopped"
        );
        Ok(report)
    }

    fn record_alert(
        report: &mut MonitorReport,
        joined: std::result::Result<Result<Option<DeliveryResult>>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(Some(result))) => report.alerts.push(result),
            Ok(Ok(None)) => report.cancelled += 1,
            Ok(Err(e)) => warn!(error = %e, "crash alert failed"),
            Err(e) => warn!(error = %e, "crash alert task failed"),
        }
    }

    async fn deliver(&self, record: crate::alert::AlertRecord) -> Result<DeliveryResult> {
        let result = self
            .delivery
            .spawn_deliver(record)
            .await
            .map_err(|e| Error::internal(format!("delivery task failed: {e}")))?;

        if result.delivered {
            info!(alert_id = %result.alert_id, "{}", result.user_message());
        } else {
            warn!(alert_id = %result.alert_id, "{}", result.user_message());
        }
        Ok(result)
    }
}

/// Count down, vibrating once per tick, until elapsed or cancelled.
///
/// Only cancels sent after the countdown starts are honored. A closed
/// canceller lets the countdown run out.
pub async fn run_countdown(
    duration: Duration,
    tick: Duration,
    actuator: &dyn Actuator,
    cancel: &mut watch::Receiver<u64>,
) -> CountdownOutcome {
    cancel.mark_unchanged();
    let deadline = Instant::now() + duration;
    let tick = tick.max(Duration::from_millis(1));
    let mut cancel_open = true;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return CountdownOutcome::Elapsed;
        }

        actuator.vibrate(COUNTDOWN_PATTERN, false);
        let step = tokio::time::sleep(tick.min(deadline - now));
        tokio::pin!(step);

        loop {
            if !cancel_open {
                step.as_mut().await;
                break;
            }
            tokio::select! {
                () = &mut step => break,
                changed = cancel.changed() => {
                    if changed.is_ok() {
                        return CountdownOutcome::Cancelled;
                    }
                    cancel_open = false;
                }
            }
        }
    }
}
