pub mod client_log;
pub mod config;
pub mod handlers;
pub mod models;
pub mod store;
pub mod trace;

use std::sync::Arc;

use config::EngineConfig;
use store::DataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DataStore>,
    pub engine: Arc<EngineConfig>,
}
