//! Subscriber sessions for live message delivery.
//!
//! Each subscriber gets:
//! - A catch-up batch snapshotted atomically with registration
//! - A bounded live queue; overflowing it closes the session
//! - A delivery cursor for resuming after a lossy close
//!
//! # Example
//!
//! ```ignore
//! let subscription = broadcaster.subscribe()?;
//! for event in subscription.into_stream(flag.clone()) {
//!     match event {
//!         StreamEvent::Message { message } => send_to_client(&message)?,
//!         StreamEvent::Heartbeat => send_keepalive()?,
//!         StreamEvent::Closed { reason } if reason.is_lossy() => schedule_resume(),
//!         _ => {}
//!     }
//! }
//! ```

mod session;
mod types;

pub use session::{MessageStream, Subscription};
pub(crate) use types::SessionShared;
pub use types::{
    AlwaysConnected, CloseReason, ConnectionFlag, Gap, Liveness, SessionState, StreamEvent,
};
