//! Publish/subscribe fan-out.
//!
//! A connection that SUBSCRIBEs registers its outbox with the
//! [`hub::PubSubHub`]; PUBLISH pushes `message` frames through those
//! outboxes. For one publisher and one channel, delivery order equals
//! publish order; across channels no order is promised.

pub mod hub;

pub use hub::{PubSubHub, SubscriberHandle};
