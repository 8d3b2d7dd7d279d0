//! Instance lifecycle: records, the registry state machine, and the
//! orchestrator facade.

pub mod models;
pub mod registry;
pub mod service;

pub use models::{
    CreateInstanceRequest, HealthResponse, Instance, InstanceConfig, InstanceDetails,
    InstanceState, LogsResponse,
};
pub use registry::{InstanceRegistry, RegistryError};
pub use service::{InstanceError, InstanceResult, InstanceService, ServiceConfig};
