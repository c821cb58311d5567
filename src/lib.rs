//! # Chatcast
//!
//! An in-process message broadcast engine: a bounded, append-only message
//! history with live fan-out to any number of subscribers.
//!
//! ## Core Concepts
//!
//! - **Log**: Append-only window of messages with monotonic sequence numbers
//! - **Broadcaster**: Serializes appends and pushes each one to every session
//! - **Subscriptions**: Catch-up batch, bounded live queue, liveness checks
//! - **Service**: `send`, `stream`, `get_history`, `delete` for transports
//!
//! ## Example
//!
//! ```ignore
//! use chatcast::{Broadcaster, BroadcasterConfig, ChatService, ConnectionFlag, StreamEvent};
//!
//! let service = ChatService::new(Broadcaster::new(BroadcasterConfig::default())?);
//!
//! let flag = ConnectionFlag::new();
//! let stream = service.stream(flag.clone())?;
//! std::thread::spawn(move || {
//!     for event in stream {
//!         if let StreamEvent::Message { message } = event {
//!             println!("{}: {}", message.sender, message.content);
//!         }
//!     }
//! });
//!
//! let id = service.send("alice", "hello")?;
//! service.delete(id)?;
//! ```

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod log;
pub mod service;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use broadcaster::{Broadcaster, BroadcasterStats};
pub use config::{BackendConfig, BroadcasterConfig};
pub use error::{ChatError, Result};
pub use log::{DurableLog, MemoryLog, MessageStore};
pub use service::{ChatService, DeleteResponse};
pub use subscriptions::{
    AlwaysConnected, CloseReason, ConnectionFlag, Gap, Liveness, MessageStream, SessionState,
    StreamEvent, Subscription,
};
pub use types::*;
