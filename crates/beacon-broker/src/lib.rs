//! Message broker for the beacon realtime core: routing fan-out, guaranteed
//! delivery with bounded retry, in-process pattern subscribers, and
//! cross-instance republication over the shared store's pub/sub.

mod broker;
mod error;
mod queue;
mod subscribers;

pub use broker::{BrokerConfig, BrokerEvent, BrokerStats, MessageBroker, SweepStats};
pub use error::BrokerError;
pub use queue::QueuedMessage;
pub use subscribers::{SubscriberHandler, SubscriberPattern};
