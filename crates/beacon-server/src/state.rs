use std::sync::Arc;

use beacon_engine::delivery::DeliveryExecutor;
use beacon_engine::orchestrator::Orchestrator;
use beacon_engine::registry::ChannelRegistry;
use beacon_engine::scheduler::Scheduler;
use beacon_engine::signals::DeliverySignals;
use beacon_engine::store::DeliveryStore;

/// Shared application state. Every collaborator is an explicit instance
/// injected here; there is no process-global registry or queue.
pub struct AppState {
    pub store: Arc<DeliveryStore>,
    pub registry: Arc<ChannelRegistry>,
    pub executor: Arc<DeliveryExecutor>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub signals: Arc<DeliverySignals>,
}
