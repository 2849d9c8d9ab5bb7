//! Config flows
//!
//! A config flow is a small wizard an integration runs to create or update
//! one of its config entries. The integration implements [`ConfigFlow`]; the
//! [`FlowManager`] owns the in-progress flows, feeds them user input step by
//! step and persists whatever entry a flow finally creates.
//!
//! Each step returns a [`FlowResult`]:
//! - `form`: show (or re-show, with errors) a form; the flow stays alive
//! - `create_entry`: the manager stores and sets up a new entry
//! - `abort`: the flow ends, possibly after updating an existing entry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryUpdate};
use crate::manager::{ConfigEntries, ConfigEntriesError};

pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";
pub const ABORT_ALREADY_IN_PROGRESS: &str = "already_in_progress";
pub const ABORT_REAUTH_SUCCESSFUL: &str = "reauth_successful";
pub const ABORT_RECONFIGURE_SUCCESSFUL: &str = "reconfigure_successful";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("no config flow registered for {0}")]
    UnknownHandler(String),

    #[error("flow not found: {0}")]
    UnknownFlow(String),

    #[error("flow has no step {0}")]
    UnknownStep(String),

    #[error("invalid user input: {0}")]
    InvalidInput(String),

    #[error("config entry not found for flow: {0}")]
    EntryNotFound(String),

    /// Stored data no user input can repair; the flow ends
    #[error("config entry {entry_id} is unusable: {reason}")]
    InvalidEntry { entry_id: String, reason: String },

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// One field of a form schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Allowed values of a `select` field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FormField {
    pub fn required_string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: "string".to_string(),
            required: Some(true),
            default: None,
            options: Vec::new(),
        }
    }

    pub fn required_select<I, S>(name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            field_type: "select".to_string(),
            required: Some(true),
            default: None,
            options: options.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of a flow step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data_schema: Vec<FormField>,
    /// Field key (or "base") -> error code, present on forms
    pub errors: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, serde_json::Value>>,
    /// The entry stored for a `create_entry` result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ConfigEntry>,
}

impl FlowResult {
    fn empty(result_type: FlowResultType) -> Self {
        Self {
            flow_id: String::new(),
            handler: String::new(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            title: None,
            reason: None,
            data: None,
            result: None,
        }
    }

    pub fn form(
        step_id: impl Into<String>,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    ) -> Self {
        Self {
            step_id: Some(step_id.into()),
            data_schema,
            errors: Some(errors),
            ..Self::empty(FlowResultType::Form)
        }
    }

    pub fn create_entry(
        title: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            data: Some(data),
            ..Self::empty(FlowResultType::CreateEntry)
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::empty(FlowResultType::Abort)
        }
    }
}

/// Per-flow state and the helpers a flow uses to talk to the entry store
pub struct FlowContext {
    pub flow_id: String,
    pub handler: String,
    pub source: ConfigEntrySource,
    /// Entry a reauth or reconfigure flow works on
    pub entry_id: Option<String>,
    unique_id: Option<String>,
    entries: Arc<ConfigEntries>,
}

impl FlowContext {
    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn set_unique_id(&mut self, unique_id: impl Into<String>) {
        self.unique_id = Some(unique_id.into());
    }

    /// `Some(abort)` when an entry with this flow's unique id already exists
    pub fn abort_if_unique_id_configured(&self) -> Option<FlowResult> {
        let unique_id = self.unique_id.as_deref()?;
        self.entries
            .get_by_unique_id(&self.handler, unique_id)
            .map(|_| {
                debug!("Aborting {} flow, {} already configured", self.handler, unique_id);
                FlowResult::abort(ABORT_ALREADY_CONFIGURED)
            })
    }

    fn source_entry(&self) -> Result<ConfigEntry, FlowError> {
        let entry_id = self
            .entry_id
            .as_deref()
            .ok_or_else(|| FlowError::EntryNotFound(self.flow_id.clone()))?;
        self.entries
            .get(entry_id)
            .ok_or_else(|| FlowError::EntryNotFound(entry_id.to_string()))
    }

    pub fn reauth_entry(&self) -> Result<ConfigEntry, FlowError> {
        self.source_entry()
    }

    pub fn reconfigure_entry(&self) -> Result<ConfigEntry, FlowError> {
        self.source_entry()
    }

    pub fn show_form(
        &self,
        step_id: &str,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    ) -> FlowResult {
        FlowResult::form(step_id, data_schema, errors)
    }

    pub fn create_entry(
        &self,
        title: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> FlowResult {
        FlowResult::create_entry(title, data)
    }

    pub fn abort(&self, reason: impl Into<String>) -> FlowResult {
        FlowResult::abort(reason)
    }

    /// Apply `update` to an existing entry, reload it and end the flow
    ///
    /// A reload failure is logged only: the new data is already stored and the
    /// entry's state records the setup error.
    pub async fn update_reload_and_abort(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> Result<FlowResult, FlowError> {
        match self.entries.update(entry_id, update).await {
            Ok(_) => {}
            Err(ConfigEntriesError::AlreadyExists { unique_id, .. }) => {
                warn!(
                    "Not updating entry {}: {} belongs to another entry",
                    entry_id, unique_id
                );
                return Ok(FlowResult::abort(ABORT_ALREADY_CONFIGURED));
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.entries.reload(entry_id).await {
            warn!("Reload after update of entry {} failed: {}", entry_id, err);
        }

        Ok(FlowResult::abort(match self.source {
            ConfigEntrySource::Reauth => ABORT_REAUTH_SUCCESSFUL,
            _ => ABORT_RECONFIGURE_SUCCESSFUL,
        }))
    }
}

/// An integration's config flow
#[async_trait]
pub trait ConfigFlow: Send + Sync {
    /// `(version, minor_version)` stamped on entries this flow creates
    fn version(&self) -> (u32, u32) {
        (1, 1)
    }

    async fn async_step(
        &mut self,
        ctx: &mut FlowContext,
        step_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError>;
}

pub type FlowFactory = Arc<dyn Fn() -> Box<dyn ConfigFlow> + Send + Sync>;

struct ActiveFlow {
    ctx: FlowContext,
    flow: Box<dyn ConfigFlow>,
    step_id: String,
}

/// Summary of an in-progress flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub handler: String,
    pub step_id: String,
    pub source: ConfigEntrySource,
}

pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    factories: DashMap<String, FlowFactory>,
    /// Flows waiting for user input; a flow is taken out while a step runs
    flows: DashMap<String, ActiveFlow>,
    /// entry id -> flow id of the reauth/reconfigure flow working on it
    entry_claims: DashMap<String, String>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            factories: DashMap::new(),
            flows: DashMap::new(),
            entry_claims: DashMap::new(),
        }
    }

    pub fn register_flow(&self, domain: &str, factory: FlowFactory) {
        self.factories.insert(domain.to_string(), factory);
        debug!("Registered config flow for {}", domain);
    }

    /// Start a flow at the first step for `source`
    ///
    /// Reauth and reconfigure flows need the entry they work on; only one such
    /// flow may be active per entry.
    pub async fn init(
        &self,
        handler: &str,
        source: ConfigEntrySource,
        entry_id: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let factory = self
            .factories
            .get(handler)
            .map(|r| r.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(handler.to_string()))?;

        let flow_id = Ulid::new().to_string();

        let entry_id = match source {
            ConfigEntrySource::Reauth | ConfigEntrySource::Reconfigure => {
                let entry_id = entry_id
                    .filter(|id| self.entries.get(id).is_some())
                    .ok_or_else(|| {
                        FlowError::EntryNotFound(entry_id.unwrap_or_default().to_string())
                    })?;
                match self.entry_claims.entry(entry_id.to_string()) {
                    Entry::Occupied(_) => {
                        debug!("Flow for entry {} already in progress", entry_id);
                        let mut result = FlowResult::abort(ABORT_ALREADY_IN_PROGRESS);
                        result.flow_id = flow_id;
                        result.handler = handler.to_string();
                        return Ok(result);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(flow_id.clone());
                    }
                }
                Some(entry_id.to_string())
            }
            _ => None,
        };

        info!("Starting {} flow {} ({:?})", handler, flow_id, source);

        let active = ActiveFlow {
            ctx: FlowContext {
                flow_id,
                handler: handler.to_string(),
                source,
                entry_id,
                unique_id: None,
                entries: self.entries.clone(),
            },
            flow: factory(),
            step_id: source.step_id().to_string(),
        };
        let step_id = active.step_id.clone();
        self.run_step(active, &step_id, data).await
    }

    /// Start a reauth flow for an entry, handing it the stored data
    pub async fn start_reauth(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| FlowError::EntryNotFound(entry_id.to_string()))?;
        let data = serde_json::to_value(&entry.data)
            .map_err(|e| FlowError::InvalidInput(e.to_string()))?;
        self.init(
            &entry.domain,
            ConfigEntrySource::Reauth,
            Some(entry_id),
            Some(data),
        )
        .await
    }

    /// Submit user input to the step a flow is waiting on
    pub async fn configure(
        &self,
        flow_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let (_, active) = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        let step_id = active.step_id.clone();
        self.run_step(active, &step_id, user_input).await
    }

    /// Discard a flow; nothing it collected was persisted
    pub fn abort(&self, flow_id: &str) -> bool {
        match self.flows.remove(flow_id) {
            Some((_, active)) => {
                self.release(&active.ctx);
                debug!("Aborted flow {}", flow_id);
                true
            }
            None => false,
        }
    }

    pub fn list_flows(&self) -> Vec<FlowSummary> {
        self.flows
            .iter()
            .map(|f| FlowSummary {
                flow_id: f.ctx.flow_id.clone(),
                handler: f.ctx.handler.clone(),
                step_id: f.step_id.clone(),
                source: f.ctx.source,
            })
            .collect()
    }

    fn release(&self, ctx: &FlowContext) {
        if let Some(ref entry_id) = ctx.entry_id {
            self.entry_claims
                .remove_if(entry_id, |_, flow_id| *flow_id == ctx.flow_id);
        }
    }

    async fn run_step(
        &self,
        mut active: ActiveFlow,
        step_id: &str,
        user_input: Option<serde_json::Value>,
    ) -> Result<FlowResult, FlowError> {
        let outcome = active
            .flow
            .async_step(&mut active.ctx, step_id, user_input)
            .await;

        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                // Bad input leaves the form open for another try
                if matches!(err, FlowError::InvalidInput(_)) {
                    self.flows.insert(active.ctx.flow_id.clone(), active);
                } else {
                    self.release(&active.ctx);
                }
                return Err(err);
            }
        };

        result.flow_id = active.ctx.flow_id.clone();
        result.handler = active.ctx.handler.clone();

        match result.result_type {
            FlowResultType::Form => {
                if let Some(ref next) = result.step_id {
                    active.step_id = next.clone();
                }
                self.flows.insert(active.ctx.flow_id.clone(), active);
                Ok(result)
            }
            FlowResultType::Abort => {
                self.release(&active.ctx);
                info!(
                    "Flow {} aborted: {}",
                    result.flow_id,
                    result.reason.as_deref().unwrap_or_default()
                );
                Ok(result)
            }
            FlowResultType::CreateEntry => {
                self.release(&active.ctx);
                self.finish_create_entry(&active, result).await
            }
        }
    }

    async fn finish_create_entry(
        &self,
        active: &ActiveFlow,
        mut result: FlowResult,
    ) -> Result<FlowResult, FlowError> {
        let (version, minor_version) = active.flow.version();
        let mut entry = ConfigEntry::new(
            active.ctx.handler.clone(),
            result.title.clone().unwrap_or_default(),
        )
        .with_data(result.data.clone().unwrap_or_default())
        .with_source(active.ctx.source)
        .with_version(version, minor_version);
        if let Some(unique_id) = active.ctx.unique_id() {
            entry = entry.with_unique_id(unique_id);
        }

        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                let mut abort = FlowResult::abort(ABORT_ALREADY_CONFIGURED);
                abort.flow_id = result.flow_id;
                abort.handler = result.handler;
                return Ok(abort);
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.entries.setup(&entry.entry_id).await {
            warn!("Setup of new entry {} failed: {}", entry.entry_id, err);
        }

        result.result = Some(self.entries.get(&entry.entry_id).unwrap_or(entry));
        Ok(result)
    }
}
