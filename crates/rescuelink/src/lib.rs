//! `rescuelink` - Crash detection and emergency alert delivery
//!
//! This library turns accelerometer and speed readings into crash alerts,
//! composes SOS and crash alerts with the user's identity and location, and
//! delivers them to a remote document store. Alerts that cannot be delivered
//! stay in a local queue until a retry succeeds.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod alert;
pub mod cli;
pub mod composer;
pub mod config;
pub mod delivery;
pub mod device;
pub mod error;
pub mod logging;
pub mod motion;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod service;
pub mod storage;

pub use alert::{
    AlertKind, AlertRecord, AlertSeverity, DeliveryState, GeoPoint, LocationUpdate, UserIdentity,
};
pub use composer::AlertComposer;
pub use config::Config;
pub use delivery::{DeliveryManager, DeliveryResult, RetryReport, UpdateResult};
pub use device::ReplaySource;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use motion::{ImpactEvent, ImpactSeverity, MotionSample, Sensitivity};
pub use pipeline::{AlertPipeline, MonitorReport};
pub use queue::{LocalQueue, QueueEntry};
pub use remote::{RemoteError, RemoteStore};
pub use service::Services;
pub use storage::{KeyValueStore, Storage, StorageStats};
