//! Shared data model for the beacon realtime core: identifiers, the message
//! model, routing targets, and the transport seam consumed by the broker.

pub mod ids;
pub mod message;
pub mod mock;
pub mod routing;
pub mod transport;

pub use ids::{ConnectionId, MessageId, SessionId, TokenId};
pub use message::{
    BackoffStrategy, DeliveryOptions, Message, MessageDraft, Priority, RetryPolicy, Sender,
    SenderKind,
};
pub use routing::{Condition, ConditionOp, Routing, RoutingTarget};
pub use transport::{Transport, TransportError};
