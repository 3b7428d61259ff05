//! Builds a ready-to-use pipeline from configuration.

use std::sync::Arc;

use tracing::{debug, info};

use crate::composer::AlertComposer;
use crate::config::Config;
use crate::delivery::DeliveryManager;
use crate::device::{Actuator, FixedLocationProvider, LocationProvider, LogActuator};
use crate::pipeline::AlertPipeline;
use crate::remote::{HttpDocumentStore, OfflineStore, RemoteStore};
use crate::storage::Storage;
use crate::Result;

/// The storage, remote store and pipeline for one configuration.
#[derive(Debug)]
pub struct Services {
    config: Config,
    storage: Arc<Storage>,
    remote: Arc<dyn RemoteStore>,
    pipeline: Arc<AlertPipeline>,
}

impl Services {
    /// Open the configured database and build everything on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the remote
    /// client cannot be built.
    pub fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(config.database_path())?;
        Self::with_storage(config, storage)
    }

    /// Build everything on top of an already-open storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote client cannot be built.
    pub fn with_storage(config: Config, storage: Storage) -> Result<Self> {
        let remote: Arc<dyn RemoteStore> = match &config.delivery.endpoint {
            Some(endpoint) => {
                info!(endpoint, "using remote document store");
                Arc::new(HttpDocumentStore::new(endpoint, config.write_timeout())?)
            }
            None => {
                debug!("no endpoint configured, alerts stay local");
                Arc::new(OfflineStore)
            }
        };
        let location: Arc<dyn LocationProvider> =
            Arc::new(FixedLocationProvider::new(config.device_location()));
        let actuator: Arc<dyn Actuator> = Arc::new(LogActuator);

        Ok(Self::assemble(config, Arc::new(storage), remote, location, actuator))
    }

    /// Wire explicit collaborators together.
    #[must_use]
    pub fn assemble(
        config: Config,
        storage: Arc<Storage>,
        remote: Arc<dyn RemoteStore>,
        location: Arc<dyn LocationProvider>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        let composer = AlertComposer::new(storage.clone(), location, config.composer_config());
        let delivery = Arc::new(DeliveryManager::new(
            remote.clone(),
            storage.clone(),
            config.delivery_config(),
        ));
        let pipeline = Arc::new(AlertPipeline::new(
            composer,
            delivery,
            actuator,
            config.pipeline_config(),
        ));

        Self {
            config,
            storage,
            remote,
            pipeline,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The key-value storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Name of the remote store in use.
    #[must_use]
    pub fn remote_name(&self) -> &'static str {
        self.remote.name()
    }

    /// The alert pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<AlertPipeline> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::DeliveryState;

    #[tokio::test]
    async fn test_offline_services_queue_sos_locally() {
        let mut config = Config::default();
        config.location.timeout_ms = 50;
        let services = Services::with_storage(config, Storage::open_in_memory().unwrap()).unwrap();

        assert_eq!(services.remote_name(), "offline");

        let result = services.pipeline().trigger_sos().await.unwrap();
        assert!(!result.delivered);
        assert!(result.locally_saved);
        assert_eq!(result.state, DeliveryState::FailedLocal);

        let pending = services.pipeline().delivery().pending().entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.location, None);
    }

    #[test]
    fn test_endpoint_selects_http_store() {
        let mut config = Config::default();
        config.delivery.endpoint = Some("https://alerts.example.com/v1".to_string());
        let services = Services::with_storage(config, Storage::open_in_memory().unwrap()).unwrap();
        assert_eq!(services.remote_name(), "http");
    }

    #[tokio::test]
    async fn test_device_location_is_used() {
        let mut config = Config::default();
        config.device.latitude = Some(14.5995);
        config.device.longitude = Some(120.9842);
        let services = Services::with_storage(config, Storage::open_in_memory().unwrap()).unwrap();

        let point = services.pipeline().composer().locate().await.unwrap();
        assert!((point.latitude - 14.5995).abs() < f64::EPSILON);
    }
}
