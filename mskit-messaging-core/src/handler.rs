// mskit-messaging-core/src/handler.rs
use crate::{broker::Delivery, MessagingError};
use async_trait::async_trait;

/// Consumer callback for a subscription.
///
/// Returning `Ok` acknowledges the delivery (unless the subscription runs in
/// no-ack mode). Returning `Err` is logged and leaves the delivery
/// unacknowledged, so it keeps occupying a slot of the prefetch window.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<bool, MessagingError>;
}
