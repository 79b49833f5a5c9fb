// mskit-messaging-core/src/channel.rs
use std::{future::Future, sync::Arc};

use tracing::debug;

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    Result,
};

/// Opens a dedicated channel, runs `op` on it and closes it again, whatever
/// the outcome of `op`.
pub(crate) async fn with_channel<T, F, Fut>(conn: &Arc<dyn BrokerConnection>, op: F) -> Result<T>
where
    F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let ch = conn.create_channel().await?;
    let result = op(Arc::clone(&ch)).await;

    // After a failed operation the broker usually closed the channel already.
    if let Err(e) = ch.close().await {
        debug!(error = %e, "channel close failed");
    }
    result
}
