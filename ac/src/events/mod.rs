//! Observability for execution runs
//!
//! The loop reports through an [`EventEmitter`], which forwards to an optional
//! [`ObservabilitySink`]. [`EventBus`] is the stock sink: a tokio broadcast
//! channel that any number of consumers can subscribe to.
//!
//! ```rust,ignore
//! let bus = Arc::new(EventBus::with_default_capacity());
//! let mut rx = bus.subscribe();
//! let report = ExecutionLoop::new("exec-1", limits)
//!     .with_sink(bus.clone())
//!     .run("list the repo", &tools, &model)
//!     .await;
//! while let Ok(event) = rx.try_recv() {
//!     println!("{} {}", event.event_type, event.payload);
//! }
//! ```

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, ObservabilitySink};
pub use types::{ExecutionEvent, event_type};
