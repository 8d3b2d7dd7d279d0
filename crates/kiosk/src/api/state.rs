//! Application state shared across handlers.

use std::sync::Arc;

use crate::instance::InstanceService;

#[derive(Clone)]
pub struct AppState {
    pub instances: Arc<InstanceService>,
}

impl AppState {
    pub fn new(instances: Arc<InstanceService>) -> Self {
        Self { instances }
    }
}
