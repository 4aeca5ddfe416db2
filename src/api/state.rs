use std::sync::Arc;

use crate::breaker::FailOpenBreaker;
use crate::detect::IncidentLog;
use crate::Deployment;

#[derive(Clone)]
pub struct AppState {
    pub breaker: Arc<FailOpenBreaker>,
    pub incidents: Option<Arc<IncidentLog>>,
}

impl From<Deployment> for AppState {
    fn from(d: Deployment) -> Self {
        Self {
            breaker: d.breaker,
            incidents: d.incidents,
        }
    }
}
