//! Service registry
//!
//! Holds every registered service keyed by `domain.service`, validates the
//! incoming payload against the service's JSON schema and routes the call to
//! its async handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use jsonschema::JSONSchema;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{Context, ServiceCall, SupportsResponse};

pub type ServiceResult = Result<Option<serde_json::Value>, ServiceError>;

pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("invalid schema for {service}: {reason}")]
    InvalidSchema { service: String, reason: String },

    #[error("service does not support responses")]
    ResponseNotSupported,
}

/// Public description of a registered service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    /// JSON schema the payload must satisfy
    pub schema: Option<serde_json::Value>,
    pub supports_response: SupportsResponse,
}

struct RegisteredService {
    handler: ServiceHandler,
    validator: Option<Arc<JSONSchema>>,
    description: ServiceDescription,
}

pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
}

fn service_key(domain: &str, service: &str) -> String {
    format!("{}.{}", domain, service)
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Register (or replace) a service
    ///
    /// The schema is compiled up front so a broken schema is reported to the
    /// registering integration instead of to every caller.
    #[instrument(skip(self, domain, service, handler, schema))]
    pub fn register<F, Fut>(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        handler: F,
        schema: Option<serde_json::Value>,
        supports_response: SupportsResponse,
    ) -> Result<(), ServiceError>
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let domain = domain.into();
        let service = service.into();
        let key = service_key(&domain, &service);

        let validator = match &schema {
            Some(schema) => Some(Arc::new(JSONSchema::compile(schema).map_err(|e| {
                ServiceError::InvalidSchema {
                    service: key.clone(),
                    reason: e.to_string(),
                }
            })?)),
            None => None,
        };

        debug!(domain = %domain, service = %service, "Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        self.services.insert(
            key,
            RegisteredService {
                handler,
                validator,
                description: ServiceDescription {
                    domain,
                    service,
                    schema,
                    supports_response,
                },
            },
        );
        Ok(())
    }

    /// Call a service
    ///
    /// The response is only handed back when `return_response` is set; asking
    /// for one from a service registered with [`SupportsResponse::None`] fails.
    #[instrument(skip(self, service_data, context))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        context: Context,
        return_response: bool,
    ) -> ServiceResult {
        let key = service_key(domain, service);

        let (handler, validator, supports_response) = {
            let registered = self.services.get(&key).ok_or_else(|| {
                warn!(domain = %domain, service = %service, "Service not found");
                ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                }
            })?;
            (
                registered.handler.clone(),
                registered.validator.clone(),
                registered.description.supports_response,
            )
        };

        if return_response && supports_response == SupportsResponse::None {
            return Err(ServiceError::ResponseNotSupported);
        }

        if let Some(validator) = validator {
            if let Err(errors) = validator.validate(&service_data) {
                let reason = errors
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(service = %key, %reason, "Rejected service data");
                return Err(ServiceError::InvalidData(reason));
            }
        }

        debug!(domain = %domain, service = %service, "Calling service");
        let result = handler(ServiceCall::new(domain, service, service_data, context)).await?;

        Ok(if return_response { result } else { None })
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&service_key(domain, service))
    }

    pub fn get_service(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .get(&service_key(domain, service))
            .map(|s| s.description.clone())
    }

    pub fn domain_services(&self, domain: &str) -> Vec<ServiceDescription> {
        self.services
            .iter()
            .filter(|s| s.description.domain == domain)
            .map(|s| s.description.clone())
            .collect()
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        let removed = self
            .services
            .remove(&service_key(domain, service))
            .is_some();
        if removed {
            debug!(domain = %domain, service = %service, "Unregistered service");
        }
        removed
    }

}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedServiceRegistry = Arc<ServiceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn toggle_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "entity_id": {"type": "string"},
                "extended": {"type": "boolean"}
            },
            "additionalProperties": false
        })
    }

    #[tokio::test]
    async fn test_register_and_call_with_response() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                "test",
                "echo",
                |call: ServiceCall| async move { Ok(Some(call.service_data)) },
                None,
                SupportsResponse::Optional,
            )
            .unwrap();

        let result = registry
            .call("test", "echo", json!({"msg": "hi"}), Context::new(), true)
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"msg": "hi"})));

        let silent = registry
            .call("test", "echo", json!({"msg": "hi"}), Context::new(), false)
            .await
            .unwrap();
        assert_eq!(silent, None);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let registry = ServiceRegistry::new();
        let result = registry
            .call("phyn", "leak_test", json!({}), Context::new(), false)
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_response_not_supported() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                "phyn",
                "leak_test",
                |_: ServiceCall| async { Ok(None) },
                None,
                SupportsResponse::None,
            )
            .unwrap();

        let result = registry
            .call("phyn", "leak_test", json!({}), Context::new(), true)
            .await;
        assert!(matches!(result, Err(ServiceError::ResponseNotSupported)));
    }

    #[tokio::test]
    async fn test_schema_rejects_bad_payload() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                "phyn",
                "leak_test",
                |_: ServiceCall| async { Ok(None) },
                Some(toggle_schema()),
                SupportsResponse::None,
            )
            .unwrap();

        let ok = registry
            .call(
                "phyn",
                "leak_test",
                json!({"entity_id": "valve.main", "extended": true}),
                Context::new(),
                false,
            )
            .await;
        assert!(ok.is_ok());

        let wrong_type = registry
            .call(
                "phyn",
                "leak_test",
                json!({"extended": "yes"}),
                Context::new(),
                false,
            )
            .await;
        assert!(matches!(wrong_type, Err(ServiceError::InvalidData(_))));

        let extra_key = registry
            .call(
                "phyn",
                "leak_test",
                json!({"duration": 5}),
                Context::new(),
                false,
            )
            .await;
        assert!(matches!(extra_key, Err(ServiceError::InvalidData(_))));
    }

    #[test]
    fn test_broken_schema_is_rejected_at_registration() {
        let registry = ServiceRegistry::new();
        let result = registry.register(
            "phyn",
            "leak_test",
            |_: ServiceCall| async { Ok(None) },
            Some(json!({"type": 12})),
            SupportsResponse::None,
        );

        assert!(matches!(result, Err(ServiceError::InvalidSchema { .. })));
        assert!(!registry.has_service("phyn", "leak_test"));
    }

    #[test]
    fn test_unregister_and_domain_services() {
        let registry = ServiceRegistry::new();
        for service in ["leak_test", "refresh"] {
            registry
                .register(
                    "phyn",
                    service,
                    |_: ServiceCall| async { Ok(None) },
                    None,
                    SupportsResponse::None,
                )
                .unwrap();
        }

        assert_eq!(registry.domain_services("phyn").len(), 2);
        assert!(registry.unregister("phyn", "refresh"));
        assert!(!registry.unregister("phyn", "refresh"));
        assert!(registry.has_service("phyn", "leak_test"));
        assert_eq!(registry.domain_services("phyn").len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                "phyn",
                "leak_test",
                |_: ServiceCall| async { Err(ServiceError::CallFailed("boom".to_string())) },
                None,
                SupportsResponse::None,
            )
            .unwrap();

        let result = registry
            .call("phyn", "leak_test", json!({}), Context::new(), false)
            .await;
        assert!(matches!(result, Err(ServiceError::CallFailed(msg)) if msg == "boom"));
    }
}
