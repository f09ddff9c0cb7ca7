use crate::ids::{DeviceId, MessageId};
use crate::parcel::CompressionAlgorithm;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Application-facing event sink.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// A complete, checksum-verified message arrived from `source`. The
    ///  payload is handed over exactly as the sender enqueued it; if
    ///  `compression` is set the application is expected to unpack it.
    async fn on_message_completed(
        &self,
        source: DeviceId,
        msg_id: MessageId,
        compression: Option<CompressionAlgorithm>,
        payload: Vec<u8>,
    );

    /// A queued outgoing message exhausted its retry budget and was dropped.
    ///  The queue for `target` keeps going with the next message.
    async fn on_send_failed(&self, target: DeviceId, msg_id: MessageId);
}
