use std::sync::Arc;

use crate::auth::AuthGate;
use crate::cache::CacheStore;
use crate::ingest::IngestionSubsystem;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn CacheStore>,
    pub ingestion: Arc<IngestionSubsystem>,
    pub auth: Arc<AuthGate>,
}

impl ApiState {
    pub fn new(ingestion: Arc<IngestionSubsystem>, auth: Arc<AuthGate>) -> Self {
        Self {
            store: ingestion.store().clone(),
            ingestion,
            auth,
        }
    }
}
