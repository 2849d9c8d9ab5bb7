//! `phyn.leak_test` service
//!
//! Resolves the targeted entity to its device, the device to its Phyn id and
//! the device's config entry to an authenticated client, then asks the device
//! to run a leak test. Any missing link fails the call; nothing is retried.

use std::sync::Arc;

use hass_registries::{DeviceEntry, DeviceRegistry, EntityEntry, EntityRegistry};
use hass_services::{ServiceCall, ServiceError, ServiceRegistry, SupportsResponse};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::api::{ApiError, LeakTestResponse, PhynClient};
use crate::consts::{ATTR_ENTITY_ID, ATTR_EXTENDED, DOMAIN, LEAK_TEST_SUCCESS, SERVICE_LEAK_TEST};

pub trait EntityLookup: Send + Sync {
    fn entity(&self, entity_id: &str) -> Option<Arc<EntityEntry>>;
}

pub trait DeviceLookup: Send + Sync {
    fn device(&self, device_id: &str) -> Option<Arc<DeviceEntry>>;
}

pub trait ClientLookup: Send + Sync {
    /// Client authenticated for one of the given config entries
    fn client_for(&self, config_entry_ids: &[String]) -> Option<Arc<dyn PhynClient>>;
}

impl EntityLookup for EntityRegistry {
    fn entity(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.get(entity_id)
    }
}

impl DeviceLookup for DeviceRegistry {
    fn device(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.get(device_id)
    }
}

#[derive(Debug, Error)]
pub enum LeakTestError {
    #[error("no entity referenced")]
    NoEntityReferenced,

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("entity {0} is not attached to a device")]
    NoDevice(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {0} has no phyn identifier")]
    MissingIdentifier(String),

    #[error("no authenticated client for device {0}")]
    NoClient(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("leak test not started, device answered {0:?}")]
    Unsuccessful(Option<String>),
}

pub fn leak_test_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            ATTR_ENTITY_ID: { "type": "string" },
            ATTR_EXTENDED: { "type": "boolean" }
        },
        "additionalProperties": false
    })
}

pub struct LeakTestHandler {
    entities: Arc<dyn EntityLookup>,
    devices: Arc<dyn DeviceLookup>,
    clients: Arc<dyn ClientLookup>,
}

impl LeakTestHandler {
    pub fn new(
        entities: Arc<dyn EntityLookup>,
        devices: Arc<dyn DeviceLookup>,
        clients: Arc<dyn ClientLookup>,
    ) -> Self {
        Self {
            entities,
            devices,
            clients,
        }
    }

    pub async fn run(&self, call: &ServiceCall) -> Result<LeakTestResponse, LeakTestError> {
        let entity_id = call
            .entity_ids()
            .into_iter()
            .next()
            .ok_or(LeakTestError::NoEntityReferenced)?;
        let extended = call.get::<bool>(ATTR_EXTENDED).unwrap_or(false);

        let entity = self
            .entities
            .entity(&entity_id)
            .ok_or_else(|| LeakTestError::UnknownEntity(entity_id.clone()))?;
        let device_id = entity
            .device_id
            .as_deref()
            .ok_or_else(|| LeakTestError::NoDevice(entity_id.clone()))?;
        let device = self
            .devices
            .device(device_id)
            .ok_or_else(|| LeakTestError::UnknownDevice(device_id.to_string()))?;
        let phyn_id = device
            .identifier_for(DOMAIN)
            .ok_or_else(|| LeakTestError::MissingIdentifier(device.id.clone()))?;
        let client = self
            .clients
            .client_for(&device.config_entries)
            .ok_or_else(|| LeakTestError::NoClient(device.id.clone()))?;

        debug!(
            "Running leak test for device_id: {} (extended: {})",
            phyn_id, extended
        );
        let response = client.run_leak_test(phyn_id, extended).await?;

        if response.code.as_deref() == Some(LEAK_TEST_SUCCESS) {
            Ok(response)
        } else {
            Err(LeakTestError::Unsuccessful(response.code))
        }
    }
}

/// Register `phyn.leak_test`; failures reach the caller as `CallFailed`
pub fn register_leak_test_service(
    registry: &ServiceRegistry,
    handler: Arc<LeakTestHandler>,
) -> Result<(), ServiceError> {
    registry.register(
        DOMAIN,
        SERVICE_LEAK_TEST,
        move |call: ServiceCall| {
            let handler = handler.clone();
            async move {
                match handler.run(&call).await {
                    Ok(_) => Ok(None),
                    Err(err) => {
                        error!("{} failed: {}", call.service_id(), err);
                        Err(ServiceError::CallFailed(err.to_string()))
                    }
                }
            }
        },
        Some(leak_test_schema()),
        SupportsResponse::None,
    )
}
