//! Config flow for the phyn integration
//!
//! Three entry paths converge on the same stored state:
//! - `user`: first setup, collects username, password and brand
//! - `reauth` / `reauth_confirm`: new username and password, brand kept
//! - `reconfigure`: replace all three fields of an existing entry
//!
//! Every path validates the credentials against the API first. A failed
//! validation redisplays the same form with `{"base": <code>}` and changes
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hass_config_entries::{
    ConfigEntry, ConfigEntryUpdate, ConfigFlow, FlowContext, FlowError, FlowResult, FormField,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::api::{ApiError, Brand, Credentials, PhynConnector};
use crate::consts::{
    CONFIG_FLOW_MINOR_VERSION, CONFIG_FLOW_VERSION, CONF_BRAND, CONF_PASSWORD, CONF_USERNAME,
    STEP_REAUTH, STEP_REAUTH_CONFIRM, STEP_RECONFIGURE, STEP_USER,
};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("cannot connect to the Phyn API: {0}")]
    CannotConnect(#[source] ApiError),

    /// Rejected by the remote auth layer; the flow inspects the status code
    #[error(transparent)]
    Auth(ApiError),

    #[error("no homes found for account")]
    NoHomesFound,
}

impl From<ApiError> for ValidationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Request(_) => {
                error!("Error connecting to the Phyn API: {}", err);
                ValidationError::CannotConnect(err)
            }
            ApiError::Client { .. } => {
                warn!("Phyn API rejected the request: {}", err);
                ValidationError::Auth(err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Alias of the account's first home
    pub title: String,
}

/// Check that the credentials open a session and the account has a home
pub async fn validate_input(
    connector: &dyn PhynConnector,
    credentials: &Credentials,
) -> Result<ValidationResult, ValidationError> {
    debug!(
        "Validating credentials for {} ({})",
        credentials.username, credentials.brand
    );

    let client = connector
        .connect(
            &credentials.username,
            &credentials.password,
            credentials.brand,
        )
        .await?;
    let homes = client.get_homes(&credentials.username).await?;

    let home = homes.into_iter().next().ok_or_else(|| {
        warn!("Account {} has no homes", credentials.username);
        ValidationError::NoHomesFound
    })?;

    Ok(ValidationResult {
        title: home.alias_name,
    })
}

/// Error code shown under the form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorCode {
    InvalidAuth,
    CannotConnect,
}

impl FlowErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowErrorCode::InvalidAuth => "invalid_auth",
            FlowErrorCode::CannotConnect => "cannot_connect",
        }
    }
}

impl From<&ValidationError> for FlowErrorCode {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::Auth(api) if api.is_not_authorized() => FlowErrorCode::InvalidAuth,
            _ => FlowErrorCode::CannotConnect,
        }
    }
}

fn form_errors(err: &ValidationError) -> HashMap<String, String> {
    HashMap::from([(
        "base".to_string(),
        FlowErrorCode::from(err).as_str().to_string(),
    )])
}

pub fn user_schema() -> Vec<FormField> {
    vec![
        FormField::required_string(CONF_USERNAME),
        FormField::required_string(CONF_PASSWORD),
        FormField::required_select(CONF_BRAND, Brand::ALL.iter().map(Brand::as_str)),
    ]
}

pub fn reauth_schema() -> Vec<FormField> {
    vec![
        FormField::required_string(CONF_USERNAME),
        FormField::required_string(CONF_PASSWORD),
    ]
}

#[derive(Debug, Deserialize)]
struct ReauthInput {
    username: String,
    password: String,
}

fn parse_input<T: DeserializeOwned>(input: serde_json::Value) -> Result<T, FlowError> {
    serde_json::from_value(input).map_err(|e| FlowError::InvalidInput(e.to_string()))
}

fn stored_brand(entry: &ConfigEntry) -> Result<Brand, FlowError> {
    entry
        .data
        .get(CONF_BRAND)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| FlowError::InvalidEntry {
            entry_id: entry.entry_id.clone(),
            reason: "no valid brand stored".to_string(),
        })
}

pub struct PhynConfigFlow {
    connector: Arc<dyn PhynConnector>,
}

impl PhynConfigFlow {
    pub fn new(connector: Arc<dyn PhynConnector>) -> Self {
        Self { connector }
    }

    async fn step_user(
        &self,
        ctx: &mut FlowContext,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let Some(input) = user_input else {
            return Ok(ctx.show_form(STEP_USER, user_schema(), HashMap::new()));
        };
        let credentials: Credentials = parse_input(input)?;

        ctx.set_unique_id(credentials.username.clone());
        if let Some(abort) = ctx.abort_if_unique_id_configured() {
            return Ok(abort);
        }

        match validate_input(self.connector.as_ref(), &credentials).await {
            Ok(info) => Ok(ctx.create_entry(info.title, credentials.to_entry_data())),
            Err(err) => Ok(ctx.show_form(STEP_USER, user_schema(), form_errors(&err))),
        }
    }

    async fn step_reauth_confirm(
        &self,
        ctx: &mut FlowContext,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let Some(input) = user_input else {
            return Ok(ctx.show_form(STEP_REAUTH_CONFIRM, reauth_schema(), HashMap::new()));
        };
        let input: ReauthInput = parse_input(input)?;

        let entry = ctx.reauth_entry()?;
        let credentials = Credentials::new(input.username, input.password, stored_brand(&entry)?);

        match validate_input(self.connector.as_ref(), &credentials).await {
            Ok(info) => {
                let update = ConfigEntryUpdate::new()
                    .title(info.title)
                    .unique_id(credentials.username.clone())
                    .data_updates(HashMap::from([
                        (CONF_USERNAME.to_string(), credentials.username.into()),
                        (CONF_PASSWORD.to_string(), credentials.password.into()),
                    ]));
                ctx.update_reload_and_abort(&entry.entry_id, update).await
            }
            Err(err) => Ok(ctx.show_form(
                STEP_REAUTH_CONFIRM,
                reauth_schema(),
                form_errors(&err),
            )),
        }
    }

    async fn step_reconfigure(
        &self,
        ctx: &mut FlowContext,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let entry = ctx.reconfigure_entry()?;
        debug!("Reconfigure entry: {} ({})", entry.title, entry.entry_id);

        let Some(input) = user_input else {
            return Ok(ctx.show_form(STEP_RECONFIGURE, user_schema(), HashMap::new()));
        };
        let credentials: Credentials = parse_input(input)?;

        match validate_input(self.connector.as_ref(), &credentials).await {
            Ok(info) => {
                let update = ConfigEntryUpdate::new()
                    .title(info.title)
                    .unique_id(credentials.username.clone())
                    .data_updates(credentials.to_entry_data());
                ctx.update_reload_and_abort(&entry.entry_id, update).await
            }
            Err(err) => Ok(ctx.show_form(STEP_RECONFIGURE, user_schema(), form_errors(&err))),
        }
    }
}

#[async_trait]
impl ConfigFlow for PhynConfigFlow {
    fn version(&self) -> (u32, u32) {
        (CONFIG_FLOW_VERSION, CONFIG_FLOW_MINOR_VERSION)
    }

    async fn async_step(
        &mut self,
        ctx: &mut FlowContext,
        step_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        match step_id {
            STEP_USER => self.step_user(ctx, user_input).await,
            // Stored entry data arrives here; the confirm form asks afresh
            STEP_REAUTH => self.step_reauth_confirm(ctx, None).await,
            STEP_REAUTH_CONFIRM => self.step_reauth_confirm(ctx, user_input).await,
            STEP_RECONFIGURE => self.step_reconfigure(ctx, user_input).await,
            other => Err(FlowError::UnknownStep(other.to_string())),
        }
    }
}
