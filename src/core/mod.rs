//! Core orchestration engine: queue store, routing, conversations,
//! dispatcher, events, and the invoker seam.

pub mod conversation;
pub mod dispatcher;
pub mod events;
pub mod invoker;
pub mod routing;
pub mod store;

pub use conversation::{Conversation, ConversationManager};
pub use dispatcher::Dispatcher;
pub use events::{Event, EventBus, EventKind};
pub use invoker::{Invoker, ProviderInvoker, FALLBACK_APOLOGY};
pub use store::{MessageData, MessageStatus, QueueStore, ResponseData, StoredMessage, StoredResponse};
