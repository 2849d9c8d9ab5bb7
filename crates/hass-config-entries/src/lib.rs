//! Config Entries
//!
//! A config entry is one configured instance of an integration (for example
//! one cloud account). This crate stores entries in
//! `.storage/core.config_entries`, runs their setup/unload through the
//! owning integration and hosts the config flows that create and update them.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`IntegrationSetup`] - Lifecycle hooks an integration provides
//! - [`ConfigFlow`] / [`FlowManager`] - Setup wizards and their host

pub mod entry;
pub mod flow;
pub mod manager;

pub use entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate};

pub use flow::{
    ConfigFlow, FlowContext, FlowError, FlowFactory, FlowManager, FlowResult, FlowResultType,
    FlowSummary, FormField, ABORT_ALREADY_CONFIGURED, ABORT_ALREADY_IN_PROGRESS,
    ABORT_REAUTH_SUCCESSFUL, ABORT_RECONFIGURE_SUCCESSFUL,
};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, IntegrationSetup,
    SetupError, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
