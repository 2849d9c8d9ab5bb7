//! Service calls for the host platform
//!
//! Integrations expose operator-triggered actions as services. A service is
//! addressed as `domain.service`, receives a JSON payload and may optionally
//! answer with a response.

mod call;
mod context;
mod registry;

pub use call::{ServiceCall, SupportsResponse};
pub use context::Context;
pub use registry::{
    ServiceDescription, ServiceError, ServiceFuture, ServiceHandler, ServiceRegistry,
    ServiceResult, SharedServiceRegistry,
};
