//! Message handler interface.

use async_trait::async_trait;

use crate::messaging::transport::Delivery;

/// Callback for one subscription.
///
/// `handle` is awaited once per delivery, in delivery order, on the
/// subscription's own task. Failures are the handler's business: log them,
/// keep state consistent, return.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}
