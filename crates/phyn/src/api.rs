//! Remote device API seam
//!
//! The cloud client itself lives outside this crate. The integration only
//! needs to authenticate, list the account's homes and start leak tests, so
//! those operations are expressed as traits the host wires a client into.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{CONF_BRAND, CONF_PASSWORD, CONF_USERNAME, NOT_AUTHORIZED_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Brand {
    Phyn,
    Kohler,
}

impl Brand {
    pub const ALL: [Brand; 2] = [Brand::Phyn, Brand::Kohler];

    /// Display name, also the stored and form value
    pub fn as_str(&self) -> &'static str {
        match self {
            Brand::Phyn => "Phyn",
            Brand::Kohler => "Kohler",
        }
    }

    /// Identifier the API expects
    pub fn api_name(&self) -> &'static str {
        match self {
            Brand::Phyn => "phyn",
            Brand::Kohler => "kohler",
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Transport level failure talking to the service
    #[error("request failed: {0}")]
    Request(String),

    /// Rejection by the remote auth layer, carrying its status code
    #[error("{code}: {message}")]
    Client { code: String, message: String },
}

impl ApiError {
    pub fn not_authorized(message: impl Into<String>) -> Self {
        ApiError::Client {
            code: NOT_AUTHORIZED_CODE.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Client { code, .. } => Some(code),
            ApiError::Request(_) => None,
        }
    }

    pub fn is_not_authorized(&self) -> bool {
        self.code() == Some(NOT_AUTHORIZED_CODE)
    }
}

/// A home on the account; only the alias is interpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Home {
    pub alias_name: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Home {
    pub fn named(alias_name: impl Into<String>) -> Self {
        Self {
            alias_name: alias_name.into(),
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeakTestResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Account credentials as stored in a config entry
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(rename = "Brand")]
    pub brand: Brand,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, brand: Brand) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            brand,
        }
    }

    /// Read credentials back from config entry data
    pub fn from_entry_data(
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        let mut object = serde_json::Map::new();
        for key in [CONF_USERNAME, CONF_PASSWORD, CONF_BRAND] {
            if let Some(value) = data.get(key) {
                object.insert(key.to_string(), value.clone());
            }
        }
        serde_json::from_value(serde_json::Value::Object(object))
    }

    pub fn to_entry_data(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            (CONF_USERNAME.to_string(), self.username.clone().into()),
            (CONF_PASSWORD.to_string(), self.password.clone().into()),
            (CONF_BRAND.to_string(), self.brand.as_str().into()),
        ])
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("brand", &self.brand)
            .finish()
    }
}

/// Authenticated session against the device API
#[async_trait]
pub trait PhynClient: Send + Sync {
    async fn get_homes(&self, username: &str) -> Result<Vec<Home>, ApiError>;

    async fn run_leak_test(
        &self,
        device_id: &str,
        extended: bool,
    ) -> Result<LeakTestResponse, ApiError>;
}

/// Opens sessions; the host supplies the real implementation
#[async_trait]
pub trait PhynConnector: Send + Sync {
    async fn connect(
        &self,
        username: &str,
        password: &str,
        brand: Brand,
    ) -> Result<Arc<dyn PhynClient>, ApiError>;
}
