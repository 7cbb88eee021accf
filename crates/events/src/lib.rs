//! Progress event fan-out.
//!
//! - [`ProgressPublisher`] -- per-job publish/subscribe hub with bounded
//!   replay history, backed by one unbounded `tokio::sync::mpsc` channel per
//!   subscriber.
//! - [`Subscription`] -- a subscriber's end of the feed; de-duplicates by
//!   sequence and unsubscribes on drop.

pub mod publisher;

pub use publisher::{ProgressPublisher, SubscriberId, Subscription, DEFAULT_HISTORY_CAPACITY};
