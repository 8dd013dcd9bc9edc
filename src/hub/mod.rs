//! Subscriber hub: bounded per-subscriber queues with drop-newest fan-out

pub mod fanout;
pub mod subscription;

pub use fanout::{HubPayload, PublishOutcome, SubscriberHub};
pub use subscription::{FrameKind, Subscription, SubscriptionHandle};
