//! agentmux library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod providers;
pub mod web;

pub use crate::cli::Commands;
pub use crate::config::{ConfigProvider, Settings};
pub use crate::core::{
    ConversationManager, Dispatcher, EventBus, Invoker, MessageData, ProviderInvoker, QueueStore,
};
pub use crate::error::{Error, Result};
pub use crate::web::{run_web_server, AppState};
