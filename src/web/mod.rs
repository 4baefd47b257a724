//! Control API: the local HTTP surface transport adapters talk to.

pub mod api;
pub mod auth;
pub mod router;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ConfigProvider;
use crate::core::conversation::ConversationManager;
use crate::core::events::EventBus;
use crate::core::store::QueueStore;

pub use server::run_web_server;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: QueueStore,
    pub config: Arc<ConfigProvider>,
    pub events: EventBus,
    pub conversations: Arc<ConversationManager>,
    pub log_dir: PathBuf,
}
