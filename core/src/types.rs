use std::sync::Arc;

use dialcast_campaign::service::CampaignService;
use dialcast_dispatch::janitor::MaintenanceRunner;
use dialcast_dispatch::lease_store::LeaseStore;
use dialcast_helpers::time::Clock;

use crate::application::CampaignManager;

/// The shared state handed to operator API handlers.
#[derive(Clone)]
pub struct ApiAppState {
    pub service: Arc<dyn CampaignService + Send + Sync>,
    pub store: Arc<dyn LeaseStore>,
    pub maintenance: Arc<MaintenanceRunner>,
    pub manager: Arc<CampaignManager>,
    pub clock: Arc<dyn Clock>,
}
